//! Transport primitives exchanged through the punch payload.
//!
//! Selection is a pure function of [`ProcessKind`]:
//!
//! | kind        | data transport            | shutdown handle |
//! |-------------|---------------------------|-----------------|
//! | in-process  | in-memory duplex          | token           |
//! | local       | two anonymous pipes       | watchdog pipe   |
//! | socket      | loopback rendezvous       | watchdog pipe   |
//! | remote      | rendezvous socket         | none            |
//!
//! On platforms without anonymous pipe support, `local` falls back to the
//! rendezvous socket.

use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::ipc::message::ProcessKind;
use crate::launcher::punch::{HandleRef, PunchPayload};
use crate::types::{Error, Result};

/// Boxed read half of a child transport.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;
/// Boxed write half of a child transport.
pub type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Data transport used for a process kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Memory,
    Pipes,
    Rendezvous,
}

impl TransportKind {
    pub fn for_kind(kind: &ProcessKind) -> Self {
        match kind {
            ProcessKind::InProcess => TransportKind::Memory,
            ProcessKind::Local if cfg!(unix) => TransportKind::Pipes,
            ProcessKind::Local | ProcessKind::Socket | ProcessKind::Remote { .. } => {
                TransportKind::Rendezvous
            }
        }
    }

    /// Whether the child shares this machine and can inherit a watchdog pipe.
    pub fn has_watchdog(kind: &ProcessKind) -> bool {
        cfg!(unix) && matches!(kind, ProcessKind::Local | ProcessKind::Socket)
    }
}

/// Child side: connect to the transport named in the punch payload.
pub async fn connect_child(punch: &PunchPayload) -> Result<(BoxReader, BoxWriter)> {
    match (&punch.read_handle, &punch.write_handle) {
        (HandleRef::Tcp(read), HandleRef::Tcp(write)) if read == write => {
            let stream = TcpStream::connect(write).await.map_err(|e| {
                Error::handshake(format!("cannot reach rendezvous {}: {}", write, e))
            })?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(unix)]
        (HandleRef::Fd(read), HandleRef::Fd(write)) => {
            let reader = pipes::adopt_receiver(*read)?;
            let writer = pipes::adopt_sender(*write)?;
            Ok((Box::new(reader), Box::new(writer)))
        }
        (read, write) => Err(Error::handshake(format!(
            "unsupported transport handles read={} write={}",
            read, write
        ))),
    }
}

/// Child side: a future that resolves when the parent asks for shutdown.
///
/// A missing handle never resolves.
pub fn shutdown_signal(handle: &HandleRef) -> Result<Pin<Box<dyn Future<Output = ()> + Send>>> {
    match handle {
        HandleRef::None | HandleRef::Memory => Ok(Box::pin(std::future::pending())),
        #[cfg(unix)]
        HandleRef::Fd(fd) => {
            let receiver = pipes::adopt_receiver(*fd)?;
            Ok(Box::pin(async move {
                use tokio::io::AsyncReadExt;
                let mut receiver = receiver;
                let mut buf = [0u8; 64];
                loop {
                    match receiver.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => continue,
                    }
                }
            }))
        }
        other => Err(Error::handshake(format!(
            "unsupported shutdown handle: {}",
            other
        ))),
    }
}

#[cfg(unix)]
pub mod pipes {
    //! Anonymous pipes for same-machine children.
    //!
    //! Parent ends are created close-on-exec; child ends are inheritable and
    //! must be dropped by the parent right after the spawn, inside the spawn
    //! lock, so no concurrently spawned child inherits them.

    #![allow(unsafe_code)]

    use std::io;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use tokio::net::unix::pipe;

    /// One direction of a child transport.
    #[derive(Debug)]
    pub struct PipePair {
        /// End kept by the parent (close-on-exec).
        pub parent: OwnedFd,
        /// End inherited by the child.
        pub child: OwnedFd,
    }

    /// Parent-side handle that keeps the child's watchdog pipe open.
    ///
    /// Dropping it closes the write end; the child reads EOF and shuts down.
    #[derive(Debug)]
    pub struct Keepalive(#[allow(dead_code)] OwnedFd);

    fn pipe_fds() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds: [RawFd; 2] = [0; 2];

        // SAFETY: pipe() is a standard POSIX call; fds is a valid 2-element array.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: both FDs are valid and unowned after a successful pipe() call.
        let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        Ok((read_fd, write_fd))
    }

    /// Pipe the parent writes and the child reads.
    pub fn parent_to_child() -> io::Result<PipePair> {
        let (read_fd, write_fd) = pipe_fds()?;
        set_cloexec(&write_fd)?;
        Ok(PipePair {
            parent: write_fd,
            child: read_fd,
        })
    }

    /// Pipe the child writes and the parent reads.
    pub fn child_to_parent() -> io::Result<PipePair> {
        let (read_fd, write_fd) = pipe_fds()?;
        set_cloexec(&read_fd)?;
        Ok(PipePair {
            parent: read_fd,
            child: write_fd,
        })
    }

    /// Watchdog pipe: `(child read end, parent keepalive)`.
    pub fn watchdog() -> io::Result<(OwnedFd, Keepalive)> {
        let pair = parent_to_child()?;
        Ok((pair.child, Keepalive(pair.parent)))
    }

    fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
        // SAFETY: fcntl(F_SETFD) is async-signal-safe and the FD is valid.
        let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Take ownership of an inherited descriptor named in the punch payload.
    fn adopt(raw: RawFd) -> io::Result<OwnedFd> {
        // SAFETY: F_GETFD only inspects the descriptor table entry.
        if unsafe { libc::fcntl(raw, libc::F_GETFD) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the descriptor is open and was handed to this process for
        // exclusive use by the parent; nothing else in the process owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        // Grandchildren must not inherit it.
        set_cloexec(&fd)?;
        Ok(fd)
    }

    pub fn adopt_receiver(raw: RawFd) -> io::Result<pipe::Receiver> {
        pipe::Receiver::from_owned_fd(adopt(raw)?)
    }

    pub fn adopt_sender(raw: RawFd) -> io::Result<pipe::Sender> {
        pipe::Sender::from_owned_fd(adopt(raw)?)
    }

    pub fn into_receiver(fd: OwnedFd) -> io::Result<pipe::Receiver> {
        pipe::Receiver::from_owned_fd(fd)
    }

    pub fn into_sender(fd: OwnedFd) -> io::Result<pipe::Sender> {
        pipe::Sender::from_owned_fd(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_selection_is_by_kind() {
        assert_eq!(
            TransportKind::for_kind(&ProcessKind::InProcess),
            TransportKind::Memory
        );
        assert_eq!(
            TransportKind::for_kind(&ProcessKind::Socket),
            TransportKind::Rendezvous
        );
        assert_eq!(
            TransportKind::for_kind(&ProcessKind::Remote { host: "h".into() }),
            TransportKind::Rendezvous
        );
        #[cfg(unix)]
        assert_eq!(
            TransportKind::for_kind(&ProcessKind::Local),
            TransportKind::Pipes
        );
        assert!(!TransportKind::has_watchdog(&ProcessKind::Remote {
            host: "h".into()
        }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watchdog_signals_on_drop() {
        use std::os::unix::io::IntoRawFd;

        let (child_end, keepalive) = pipes::watchdog().unwrap();
        let signal = shutdown_signal(&HandleRef::Fd(child_end.into_raw_fd())).unwrap();
        drop(keepalive);
        tokio::time::timeout(std::time::Duration::from_secs(5), signal)
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_pair_carries_bytes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let pair = pipes::parent_to_child().unwrap();
        let mut tx = pipes::into_sender(pair.parent).unwrap();
        let mut rx = pipes::into_receiver(pair.child).unwrap();
        tx.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_rendezvous_handles_must_match() {
        let punch = PunchPayload {
            host: "localhost".into(),
            process_id: "P1".parse().unwrap(),
            kind: ProcessKind::Socket,
            integrity: Default::default(),
            write_handle: HandleRef::Tcp("127.0.0.1:1".parse().unwrap()),
            read_handle: HandleRef::None,
            shutdown_handle: HandleRef::None,
            parent_pid: 1,
        };
        assert!(matches!(
            connect_child(&punch).await,
            Err(Error::Handshake(_))
        ));
    }
}
