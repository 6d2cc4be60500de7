//! Process launcher and handshake.
//!
//! Stands up a child and a live channel to it:
//!
//! ```text
//!  allocate transport ──► [spawn lock: spawn child, drop child ends]
//!        │                                  │
//!        │             punch payload ──► child stdin (then closed)
//!        ▼                                  ▼
//!  connect (pipes / rendezvous accept / memory) ──► Hello ⇄ Hello ──► Launched
//! ```
//!
//! The handshake deadline is absolute and counted from the spawn. Early
//! exit, timeout or cancellation kill the child and report its captured
//! console output.

pub mod capture;
pub mod punch;
pub mod transport;

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ipc::message::{Envelope, Hello, ProcessCreationInfo, ProcessKind};
use crate::ipc::{Channel, WireFormat};
use crate::types::{ChannelConfig, Error, LauncherConfig, ProcessId, Result};

pub use capture::{OutputBuffer, OutputSink, OutputStream, TracingSink};
pub use punch::{HandleRef, PunchPayload};
pub use transport::TransportKind;

#[cfg(unix)]
use transport::pipes;

/// Buffer size of the in-memory duplex used for in-process children.
const IN_PROCESS_BUFFER: usize = 256 * 1024;

/// How long a failed child's console capture may take to drain.
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

/// Handle inheritance is process-wide, so every launcher in the process
/// (the root's and every in-process child's) spawns under this one lock.
static SPAWN_LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();

fn process_spawn_lock() -> Arc<Mutex<()>> {
    SPAWN_LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone()
}

/// Progress reported while a child is being launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPhase {
    Spawning,
    Handshaking,
}

/// Runs the worker side of an in-process child.
pub trait InProcessHost: Send + Sync + fmt::Debug {
    /// Start a child on a task. `stream` is its end of the transport;
    /// `shutdown` is cancelled when the parent destroys it.
    fn start(
        &self,
        punch: PunchPayload,
        stream: DuplexStream,
        shutdown: CancellationToken,
    ) -> JoinHandle<()>;
}

/// A child whose handshake completed.
#[derive(Debug)]
pub struct Launched {
    pub channel: Channel,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
    pub peer: Hello,
    pub child: ChildProcess,
}

/// The running child behind a process handle.
#[derive(Debug)]
pub enum ChildProcess {
    Os(OsChild),
    InProcess(InProcessChild),
}

#[derive(Debug)]
pub struct OsChild {
    child: tokio::process::Child,
    #[cfg(unix)]
    keepalive: Option<pipes::Keepalive>,
    output: OutputBuffer,
}

#[derive(Debug)]
pub struct InProcessChild {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl ChildProcess {
    pub fn os_pid(&self) -> Option<u32> {
        match self {
            ChildProcess::Os(os) => os.child.id(),
            ChildProcess::InProcess(_) => Some(std::process::id()),
        }
    }

    pub fn output(&self) -> Option<&OutputBuffer> {
        match self {
            ChildProcess::Os(os) => Some(&os.output),
            ChildProcess::InProcess(_) => None,
        }
    }

    /// Signal the shutdown handle. The child is expected to exit on its own.
    pub fn request_shutdown(&mut self) {
        match self {
            #[cfg(unix)]
            ChildProcess::Os(os) => {
                os.keepalive.take();
            }
            #[cfg(not(unix))]
            ChildProcess::Os(_) => {}
            ChildProcess::InProcess(child) => child.shutdown.cancel(),
        }
    }

    /// Wait for the child to exit and describe how it ended.
    pub async fn wait(&mut self) -> String {
        match self {
            ChildProcess::Os(os) => match os.child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {}", e),
            },
            ChildProcess::InProcess(child) => match (&mut child.task).await {
                Ok(()) => "exited".to_string(),
                Err(e) if e.is_cancelled() => "aborted".to_string(),
                Err(e) => format!("panicked: {}", e),
            },
        }
    }

    /// Force termination.
    pub async fn kill(&mut self) {
        match self {
            ChildProcess::Os(os) => {
                if let Err(e) = os.child.kill().await {
                    tracing::debug!("Kill of child {:?} failed: {}", os.child.id(), e);
                }
            }
            ChildProcess::InProcess(child) => {
                child.shutdown.cancel();
                child.task.abort();
            }
        }
    }
}

/// Parent-side transport ends, allocated before the spawn.
enum Allocated {
    #[cfg(unix)]
    Pipes {
        to_child: pipes::PipePair,
        from_child: pipes::PipePair,
    },
    Rendezvous(TcpListener),
}

/// Parent-side transport ends after the child ends were released.
enum Connector {
    #[cfg(unix)]
    Pipes {
        to_child: std::os::unix::io::OwnedFd,
        from_child: std::os::unix::io::OwnedFd,
    },
    Rendezvous(TcpListener),
}

impl Allocated {
    async fn new(kind: TransportKind, config: &LauncherConfig) -> Result<(Self, HandleRef, HandleRef)> {
        match kind {
            #[cfg(unix)]
            TransportKind::Pipes => {
                use std::os::unix::io::AsRawFd;
                let to_child = pipes::parent_to_child()?;
                let from_child = pipes::child_to_parent()?;
                let read = HandleRef::Fd(to_child.child.as_raw_fd());
                let write = HandleRef::Fd(from_child.child.as_raw_fd());
                Ok((Allocated::Pipes { to_child, from_child }, read, write))
            }
            TransportKind::Rendezvous => {
                let listener = TcpListener::bind(config.rendezvous_addr).await?;
                let addr = listener.local_addr()?;
                Ok((
                    Allocated::Rendezvous(listener),
                    HandleRef::Tcp(addr),
                    HandleRef::Tcp(addr),
                ))
            }
            other => Err(Error::spawn(format!(
                "transport {:?} cannot be used for an OS child",
                other
            ))),
        }
    }

    /// Close the child's ends in this process.
    fn release_child_ends(self) -> Connector {
        match self {
            #[cfg(unix)]
            Allocated::Pipes { to_child, from_child } => {
                drop(to_child.child);
                drop(from_child.child);
                Connector::Pipes {
                    to_child: to_child.parent,
                    from_child: from_child.parent,
                }
            }
            Allocated::Rendezvous(listener) => Connector::Rendezvous(listener),
        }
    }
}

impl Connector {
    async fn connect(self) -> Result<(transport::BoxReader, transport::BoxWriter)> {
        match self {
            #[cfg(unix)]
            Connector::Pipes { to_child, from_child } => {
                let reader = pipes::into_receiver(from_child)?;
                let writer = pipes::into_sender(to_child)?;
                Ok((Box::new(reader), Box::new(writer)))
            }
            Connector::Rendezvous(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!("Rendezvous connection from {}", peer);
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }
}

/// Spawns children and completes their handshake.
#[derive(Debug, Clone)]
pub struct Launcher {
    identity: Hello,
    config: LauncherConfig,
    channel_config: ChannelConfig,
    format: WireFormat,
    spawn_lock: Arc<Mutex<()>>,
    sink: Arc<dyn OutputSink>,
    in_process: Option<Arc<dyn InProcessHost>>,
}

impl Launcher {
    /// `identity` is the Hello this process sends to each child.
    pub fn new(
        identity: Hello,
        config: LauncherConfig,
        channel_config: ChannelConfig,
        format: WireFormat,
    ) -> Self {
        Self {
            identity,
            config,
            channel_config,
            format,
            spawn_lock: process_spawn_lock(),
            sink: Arc::new(TracingSink),
            in_process: None,
        }
    }

    pub fn with_output_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_in_process_host(mut self, host: Arc<dyn InProcessHost>) -> Self {
        self.in_process = Some(host);
        self
    }

    /// The lock every spawn in this process takes around handle inheritance.
    pub fn spawn_lock(&self) -> Arc<Mutex<()>> {
        self.spawn_lock.clone()
    }

    /// Launch a child and complete its handshake.
    pub async fn launch<F>(
        &self,
        info: &ProcessCreationInfo,
        cancel: &CancellationToken,
        on_phase: F,
    ) -> Result<Launched>
    where
        F: Fn(LaunchPhase) + Send + Sync,
    {
        if cancel.is_cancelled() {
            return Err(Error::cancelled("process creation cancelled"));
        }
        match TransportKind::for_kind(&info.kind) {
            TransportKind::Memory => self.launch_in_process(info, cancel, &on_phase).await,
            transport => self.launch_os(info, transport, cancel, &on_phase).await,
        }
    }

    async fn launch_in_process<F>(
        &self,
        info: &ProcessCreationInfo,
        cancel: &CancellationToken,
        on_phase: &F,
    ) -> Result<Launched>
    where
        F: Fn(LaunchPhase) + Send + Sync,
    {
        let host = self
            .in_process
            .clone()
            .ok_or_else(|| Error::spawn("no in-process host is configured"))?;

        on_phase(LaunchPhase::Spawning);
        let (parent_io, child_io) = tokio::io::duplex(IN_PROCESS_BUFFER);
        let shutdown = CancellationToken::new();
        let punch = self.punch(info, HandleRef::Memory, HandleRef::Memory, HandleRef::Memory);
        let mut task = {
            let _guard = self.spawn_lock.lock().await;
            host.start(punch, child_io, shutdown.clone())
        };
        let deadline = Instant::now() + self.config.handshake_timeout;
        tracing::debug!("In-process child {} started", info.process_id);

        on_phase(LaunchPhase::Handshaking);
        let (reader, writer) = tokio::io::split(parent_io);
        let (channel, mut inbound) =
            Channel::open(reader, writer, &self.channel_config, self.format);

        let result = tokio::select! {
            hello = self.exchange_hello(&info.process_id, &channel, &mut inbound) => hello,
            _ = &mut task => Err(Error::handshake("in-process child exited before the handshake")),
            _ = cancel.cancelled() => Err(Error::cancelled("process creation cancelled")),
            _ = tokio::time::sleep_until(deadline) => Err(Error::handshake(format!(
                "no handshake within {:?}",
                self.config.handshake_timeout
            ))),
        };

        match result {
            Ok(peer) => Ok(Launched {
                channel,
                inbound,
                peer,
                child: ChildProcess::InProcess(InProcessChild { task, shutdown }),
            }),
            Err(e) => {
                channel.close(e.clone()).await;
                shutdown.cancel();
                task.abort();
                tracing::error!("Launch of in-process child {} failed: {}", info.process_id, e);
                Err(e)
            }
        }
    }

    async fn launch_os<F>(
        &self,
        info: &ProcessCreationInfo,
        transport: TransportKind,
        cancel: &CancellationToken,
        on_phase: &F,
    ) -> Result<Launched>
    where
        F: Fn(LaunchPhase) + Send + Sync,
    {
        on_phase(LaunchPhase::Spawning);
        let program = self.resolve_program(info)?;
        let mut command = match &info.kind {
            ProcessKind::Remote { host } => {
                let mut command = Command::new(&self.config.remote_shell);
                command.arg(host).arg(&program);
                command
            }
            _ => Command::new(&program),
        };
        command
            .args(self.transport_args())
            .args(&self.config.worker_args)
            .args(&info.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Inheritable ends exist only while the lock is held.
        #[cfg_attr(not(unix), allow(unused_variables))]
        let (spawned, connector, punch, keepalive) = {
            let _guard = self.spawn_lock.lock().await;
            let (allocated, read_handle, write_handle) =
                Allocated::new(transport, &self.config).await?;

            #[cfg(unix)]
            let (watchdog_end, keepalive) = if TransportKind::has_watchdog(&info.kind) {
                let (child_end, keepalive) = pipes::watchdog()?;
                (Some(child_end), Some(keepalive))
            } else {
                (None, None)
            };
            #[cfg(unix)]
            let shutdown_handle = {
                use std::os::unix::io::AsRawFd;
                watchdog_end
                    .as_ref()
                    .map_or(HandleRef::None, |fd| HandleRef::Fd(fd.as_raw_fd()))
            };
            #[cfg(not(unix))]
            let (shutdown_handle, keepalive) = (HandleRef::None, ());

            let punch = self.punch(info, write_handle, read_handle, shutdown_handle);
            let spawned = command.spawn();
            let connector = allocated.release_child_ends();
            #[cfg(unix)]
            drop(watchdog_end);
            (spawned, connector, punch, keepalive)
        };
        let mut child = spawned
            .map_err(|e| Error::spawn(format!("cannot start {}: {}", program.display(), e)))?;
        let deadline = Instant::now() + self.config.handshake_timeout;
        tracing::info!(
            "Spawned child {} (kind={}, os_pid={:?})",
            info.process_id,
            info.kind,
            child.id()
        );

        let output = OutputBuffer::new(self.config.output_capture_lines);
        let mut captures = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            captures.push(capture::capture(
                stdout,
                OutputStream::Stdout,
                info.process_id.clone(),
                self.sink.clone(),
                output.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            captures.push(capture::capture(
                stderr,
                OutputStream::Stderr,
                info.process_id.clone(),
                self.sink.clone(),
                output.clone(),
            ));
        }
        let stdin = child.stdin.take();

        on_phase(LaunchPhase::Handshaking);
        let handshake = async {
            let mut stdin = stdin.ok_or_else(|| Error::spawn("child stdin is not available"))?;
            stdin
                .write_all(punch.to_text().as_bytes())
                .await
                .map_err(|e| Error::handshake(format!("cannot write punch payload: {}", e)))?;
            stdin.flush().await?;
            drop(stdin);

            let (reader, writer) = connector.connect().await?;
            let (channel, mut inbound) =
                Channel::open(reader, writer, &self.channel_config, self.format);
            match self
                .exchange_hello(&info.process_id, &channel, &mut inbound)
                .await
            {
                Ok(peer) => Ok((channel, inbound, peer)),
                Err(e) => {
                    channel.close(e.clone()).await;
                    Err(e)
                }
            }
        };

        let result = tokio::select! {
            done = handshake => done,
            status = child.wait() => Err(Error::handshake(match status {
                Ok(status) => format!("child exited before the handshake ({})", status),
                Err(e) => format!("child wait failed: {}", e),
            })),
            _ = cancel.cancelled() => Err(Error::cancelled("process creation cancelled")),
            _ = tokio::time::sleep_until(deadline) => Err(Error::handshake(format!(
                "no handshake within {:?}",
                self.config.handshake_timeout
            ))),
        };

        match result {
            Ok((channel, inbound, peer)) => Ok(Launched {
                channel,
                inbound,
                peer,
                child: ChildProcess::Os(OsChild {
                    child,
                    #[cfg(unix)]
                    keepalive,
                    output,
                }),
            }),
            Err(e) => {
                if let Err(kill_err) = child.kill().await {
                    tracing::debug!("Kill after failed launch: {}", kill_err);
                }
                let _ = tokio::time::timeout(OUTPUT_DRAIN, futures::future::join_all(captures)).await;
                let e = with_console(e, &output);
                tracing::error!("Launch of child {} failed: {}", info.process_id, e);
                Err(e)
            }
        }
    }

    /// Send our Hello and wait for the child's.
    async fn exchange_hello(
        &self,
        expected: &ProcessId,
        channel: &Channel,
        inbound: &mut mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<Hello> {
        channel.send(&Envelope::Hello(self.identity.clone())).await?;
        match inbound.recv().await {
            Some(Envelope::Hello(hello)) if &hello.process_id == expected => {
                tracing::debug!(
                    "Handshake with {} complete (os_pid={})",
                    hello.process_id,
                    hello.os_pid
                );
                Ok(hello)
            }
            Some(Envelope::Hello(hello)) => Err(Error::handshake(format!(
                "child announced itself as {}, expected {}",
                hello.process_id, expected
            ))),
            Some(other) => Err(Error::handshake(format!(
                "expected hello, got {}",
                other.kind()
            ))),
            None => Err(Error::handshake(format!(
                "channel closed during handshake: {}",
                channel
                    .close_reason()
                    .map_or_else(|| "no reason".to_string(), |e| e.to_string())
            ))),
        }
    }

    fn punch(
        &self,
        info: &ProcessCreationInfo,
        write_handle: HandleRef,
        read_handle: HandleRef,
        shutdown_handle: HandleRef,
    ) -> PunchPayload {
        PunchPayload {
            host: self.identity.host.clone(),
            process_id: info.process_id.clone(),
            kind: info.kind.clone(),
            integrity: info.integrity,
            write_handle,
            read_handle,
            shutdown_handle,
            parent_pid: self.identity.os_pid,
        }
    }

    /// Flags every worker accepts so both ends of the channel agree.
    fn transport_args(&self) -> Vec<String> {
        let keepalive_ms = self
            .channel_config
            .keepalive_interval
            .map_or(0, |d| d.as_millis().max(1));
        vec![
            "--wire-format".to_string(),
            self.format.name().to_string(),
            "--max-frame-bytes".to_string(),
            self.channel_config.max_frame_bytes.to_string(),
            "--keepalive-ms".to_string(),
            keepalive_ms.to_string(),
            "--keepalive-misses".to_string(),
            self.channel_config.keepalive_misses.to_string(),
        ]
    }

    fn resolve_program(&self, info: &ProcessCreationInfo) -> Result<PathBuf> {
        if let Some(program) = info.program.clone().or_else(|| self.config.worker_program.clone()) {
            return Ok(program);
        }
        let exe = std::env::current_exe()
            .map_err(|e| Error::spawn(format!("cannot locate current executable: {}", e)))?;
        Ok(exe.with_file_name(format!(
            "hostmesh-worker{}",
            std::env::consts::EXE_SUFFIX
        )))
    }
}

fn with_console(err: Error, output: &OutputBuffer) -> Error {
    match err {
        Error::Spawn(msg) => Error::Spawn(format!("{}\n--- console ---\n{}", msg, output.render())),
        Error::Handshake(msg) => {
            Error::Handshake(format!("{}\n--- console ---\n{}", msg, output.render()))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Config;

    fn launcher(handshake_timeout: Duration) -> Launcher {
        let config = Config::default();
        Launcher::new(
            Hello {
                host: "localhost".into(),
                process_id: ProcessId::root(),
                os_pid: std::process::id(),
            },
            LauncherConfig {
                handshake_timeout,
                ..config.launcher
            },
            config.channel,
            WireFormat::MsgPack,
        )
    }

    /// Answers the handshake with a configurable identity, then idles.
    #[derive(Debug)]
    struct FakeHost {
        announce: Option<ProcessId>,
    }

    impl InProcessHost for FakeHost {
        fn start(
            &self,
            punch: PunchPayload,
            stream: DuplexStream,
            shutdown: CancellationToken,
        ) -> JoinHandle<()> {
            let announce = self.announce.clone();
            tokio::spawn(async move {
                let (reader, writer) = tokio::io::split(stream);
                let (channel, mut inbound) =
                    Channel::open(reader, writer, &ChannelConfig::default(), WireFormat::MsgPack);
                assert!(matches!(inbound.recv().await, Some(Envelope::Hello(_))));
                if let Some(id) = announce {
                    let _ = channel
                        .send(&Envelope::Hello(Hello {
                            host: punch.host.clone(),
                            process_id: id,
                            os_pid: std::process::id(),
                        }))
                        .await;
                }
                shutdown.cancelled().await;
            })
        }
    }

    fn info(id: &str) -> ProcessCreationInfo {
        ProcessCreationInfo::new(id.parse().unwrap(), ProcessKind::InProcess)
    }

    #[tokio::test]
    async fn test_in_process_handshake() {
        let launcher = launcher(Duration::from_secs(5)).with_in_process_host(Arc::new(FakeHost {
            announce: Some("P1".parse().unwrap()),
        }));
        let phases = std::sync::Mutex::new(Vec::new());
        let launched = launcher
            .launch(&info("P1"), &CancellationToken::new(), |phase| {
                phases.lock().unwrap().push(phase)
            })
            .await
            .unwrap();

        assert_eq!(launched.peer.process_id, "p1".parse::<ProcessId>().unwrap());
        assert_eq!(
            *phases.lock().unwrap(),
            vec![LaunchPhase::Spawning, LaunchPhase::Handshaking]
        );
    }

    #[tokio::test]
    async fn test_wrong_identity_fails_handshake() {
        let launcher = launcher(Duration::from_secs(5)).with_in_process_host(Arc::new(FakeHost {
            announce: Some("P2".parse().unwrap()),
        }));
        let err = launcher
            .launch(&info("P1"), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_child_times_out() {
        let launcher = launcher(Duration::from_millis(200))
            .with_in_process_host(Arc::new(FakeHost { announce: None }));
        let err = launcher
            .launch(&info("P1"), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(ref m) if m.contains("no handshake")));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_launch() {
        let launcher = launcher(Duration::from_secs(30))
            .with_in_process_host(Arc::new(FakeHost { announce: None }));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = launcher.launch(&info("P1"), &cancel, |_| {}).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let launcher = launcher(Duration::from_secs(5));
        let info = ProcessCreationInfo::new("P1".parse().unwrap(), ProcessKind::Local)
            .with_program("/definitely/not/a/real/hostmesh-worker");
        let err = launcher
            .launch(&info, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_reports_console_output() {
        let launcher = launcher(Duration::from_secs(10));
        let info = ProcessCreationInfo::new("P1".parse().unwrap(), ProcessKind::Local)
            .with_program("/bin/sh");
        // sh rejects the worker flags and exits before any handshake.
        let err = launcher
            .launch(&info, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        match err {
            Error::Handshake(msg) => assert!(msg.contains("--- console ---")),
            other => panic!("expected handshake error, got {:?}", other),
        }
    }

    #[test]
    fn test_launchers_share_the_spawn_lock() {
        let a = launcher(Duration::from_secs(1));
        let b = launcher(Duration::from_secs(2));
        assert!(Arc::ptr_eq(&a.spawn_lock(), &b.spawn_lock()));
    }

    #[test]
    fn test_transport_args_encode_keepalive() {
        let launcher = launcher(Duration::from_secs(1));
        let args = launcher.transport_args();
        assert_eq!(args[0], "--wire-format");
        assert_eq!(args[1], "msgpack");
        assert_eq!(args[5], "15000");
    }
}
