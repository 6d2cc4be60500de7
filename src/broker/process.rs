//! Process handles and their lifecycle.
//!
//! ```text
//! Created → Spawning → Handshaking → Live ─┬─► Lost
//!    │          │            │             └─► Destroyed
//!    └──────────┴────────────┴──► Lost | Destroyed
//! ```
//!
//! `Lost` and `Destroyed` are terminal. Entering either notifies every
//! process-lost subscriber of the handle.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::OnceLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::ipc::message::{Hello, ProcessCreationInfo};
use crate::ipc::Channel;
use crate::types::{Error, ProcessId, Result};

/// Process state (parent-side view of a child).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Created,
    Spawning,
    Handshaking,
    Live,
    Lost,
    Destroyed,
}

impl ProcessState {
    /// Check if state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Lost | ProcessState::Destroyed)
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        match (self, to) {
            // CREATED
            (ProcessState::Created, ProcessState::Spawning) => true,
            // SPAWNING
            (ProcessState::Spawning, ProcessState::Handshaking) => true,
            // HANDSHAKING
            (ProcessState::Handshaking, ProcessState::Live) => true,
            // Any live or starting state can be lost or destroyed
            (from, ProcessState::Lost | ProcessState::Destroyed) => !from.is_terminal(),
            // All other transitions invalid
            _ => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Created => "created",
            ProcessState::Spawning => "spawning",
            ProcessState::Handshaking => "handshaking",
            ProcessState::Live => "live",
            ProcessState::Lost => "lost",
            ProcessState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Parent-side handle of one child process.
#[derive(Debug)]
pub struct ProcessHandle {
    info: ProcessCreationInfo,
    state: watch::Sender<ProcessState>,
    channel: OnceLock<Channel>,
    peer: OnceLock<Hello>,
    os_pid: OnceLock<u32>,
    end_reason: OnceLock<String>,
    created_at: DateTime<Utc>,
    live_at: OnceLock<DateTime<Utc>>,
    ended_at: OnceLock<DateTime<Utc>>,
    /// Stops the exit monitor, which then shuts the child down.
    pub(crate) stop: CancellationToken,
    /// Aborts an unfinished launch.
    pub(crate) launch_cancel: CancellationToken,
}

impl ProcessHandle {
    pub fn new(info: ProcessCreationInfo) -> Self {
        let (state, _) = watch::channel(ProcessState::Created);
        Self {
            info,
            state,
            channel: OnceLock::new(),
            peer: OnceLock::new(),
            os_pid: OnceLock::new(),
            end_reason: OnceLock::new(),
            created_at: Utc::now(),
            live_at: OnceLock::new(),
            ended_at: OnceLock::new(),
            stop: CancellationToken::new(),
            launch_cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.info.process_id
    }

    pub fn info(&self) -> &ProcessCreationInfo {
        &self.info
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn os_pid(&self) -> Option<u32> {
        self.os_pid.get().copied()
    }

    pub fn peer(&self) -> Option<&Hello> {
        self.peer.get()
    }

    /// Channel to the child, once its handshake completed.
    pub fn channel(&self) -> Option<Channel> {
        self.channel.get().cloned()
    }

    /// Why the handle ended, once terminal.
    pub fn end_reason(&self) -> Option<&str> {
        self.end_reason.get().map(String::as_str)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn live_at(&self) -> Option<DateTime<Utc>> {
        self.live_at.get().copied()
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at.get().copied()
    }

    /// Apply a transition. Returns `false` (and changes nothing) if it is not
    /// valid from the current state.
    pub fn transition(&self, to: ProcessState) -> bool {
        self.apply(to, None)
    }

    fn apply(&self, to: ProcessState, reason: Option<String>) -> bool {
        let mut from = None;
        let applied = self.state.send_if_modified(|state| {
            if !state.can_transition_to(to) {
                return false;
            }
            // Visible before any waiter observes the new state.
            if let Some(reason) = reason {
                let _ = self.end_reason.set(reason);
            }
            if to == ProcessState::Live {
                let _ = self.live_at.set(Utc::now());
            } else if to.is_terminal() {
                let _ = self.ended_at.set(Utc::now());
            }
            from = Some(*state);
            *state = to;
            true
        });
        if let Some(from) = from {
            tracing::info!(
                "process_transition: pid={}, from={}, to={}",
                self.info.process_id,
                from,
                to
            );
        }
        applied
    }

    /// Record the live channel and mark the handle live.
    ///
    /// Fails if the handle reached a terminal state in the meantime.
    pub(crate) fn go_live(&self, channel: Channel, peer: Hello, os_pid: Option<u32>) -> bool {
        let _ = self.channel.set(channel);
        let _ = self.peer.set(peer);
        if let Some(pid) = os_pid {
            let _ = self.os_pid.set(pid);
        }
        self.transition(ProcessState::Live)
    }

    /// Enter a terminal state. Only the first call wins.
    pub(crate) fn end(&self, to: ProcessState, reason: impl Into<String>) -> bool {
        self.apply(to, Some(reason.into()))
    }

    /// Wait until the child is live and return its channel.
    pub async fn wait_live(&self) -> Result<Channel> {
        let mut rx = self.state.subscribe();
        let state = match rx
            .wait_for(|s| *s == ProcessState::Live || s.is_terminal())
            .await
        {
            Ok(state) => *state,
            Err(_) => ProcessState::Lost,
        };
        match (state, self.channel()) {
            (ProcessState::Live, Some(channel)) => Ok(channel),
            _ => Err(self.lost_error()),
        }
    }

    pub(crate) fn lost_error(&self) -> Error {
        Error::process_lost(format!(
            "{}: {}",
            self.info.process_id,
            self.end_reason().unwrap_or("not running")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::ProcessKind;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn handle() -> ProcessHandle {
        ProcessHandle::new(ProcessCreationInfo::new(
            "P1".parse().unwrap(),
            ProcessKind::InProcess,
        ))
    }

    #[test]
    fn test_valid_transitions() {
        assert!(ProcessState::Created.can_transition_to(ProcessState::Spawning));
        assert!(ProcessState::Spawning.can_transition_to(ProcessState::Handshaking));
        assert!(ProcessState::Handshaking.can_transition_to(ProcessState::Live));
        assert!(ProcessState::Live.can_transition_to(ProcessState::Lost));
        assert!(ProcessState::Created.can_transition_to(ProcessState::Destroyed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!ProcessState::Created.can_transition_to(ProcessState::Live));
        assert!(!ProcessState::Live.can_transition_to(ProcessState::Spawning));
        assert!(!ProcessState::Lost.can_transition_to(ProcessState::Destroyed));
        assert!(!ProcessState::Destroyed.can_transition_to(ProcessState::Lost));
    }

    #[test]
    fn test_end_is_set_once() {
        let h = handle();
        assert!(h.transition(ProcessState::Spawning));
        assert!(h.end(ProcessState::Lost, "exited (exit status: 1)"));
        assert!(!h.end(ProcessState::Destroyed, "destroyed"));
        assert_eq!(h.state(), ProcessState::Lost);
        assert_eq!(h.end_reason(), Some("exited (exit status: 1)"));
        assert!(h.live_at().is_none());
        assert!(h.ended_at().is_some_and(|t| t >= h.created_at()));
    }

    #[traced_test]
    #[test]
    fn test_transitions_are_logged() {
        let h = handle();
        assert!(h.transition(ProcessState::Spawning));
        assert!(!h.transition(ProcessState::Live));
        assert!(logs_contain("from=created, to=spawning"));
        assert!(!logs_contain("to=live"));
    }

    #[tokio::test]
    async fn test_wait_live_reports_loss() {
        let h = Arc::new(handle());
        let waiter = {
            let h = h.clone();
            tokio::spawn(async move { h.wait_live().await })
        };
        h.transition(ProcessState::Spawning);
        h.end(ProcessState::Lost, "handshake failed");
        let err = waiter.await.unwrap().unwrap_err();
        match err {
            Error::ProcessLost(msg) => assert!(msg.contains("handshake failed")),
            other => panic!("expected process lost, got {:?}", other),
        }
    }
}
