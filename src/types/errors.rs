//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. The
//! variants follow the failure taxonomy of the transport:
//! - **protocol**: malformed or oversize frames, unknown response ids. Fatal
//!   to the channel that saw them.
//! - **application**: an endpoint method failed. Travels as a [`RemoteError`].
//! - **process lifecycle**: spawn, handshake or unexpected exit. Fatal to one
//!   process handle only.
//! - **routing**: unknown process or endpoint. Reported to the caller, the
//!   channel stays healthy.
//!
//! `Error` is `Clone` so one channel failure can be handed to every call that
//! was still pending on it.

use std::sync::Arc;

use thiserror::Error;

use crate::ipc::message::{FailureKind, RemoteError};

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the process host.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Validation errors (bad identifiers, bad configuration, bad input).
    #[error("validation error: {0}")]
    Validation(String),

    /// Wire protocol violation. Always fatal to the channel.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The channel is gone (peer closed, keep-alive expired, local close).
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The target process exited, failed its handshake or was destroyed.
    #[error("process lost: {0}")]
    ProcessLost(String),

    /// No process with that id is reachable from here.
    #[error("process not found: {0}")]
    ProcessNotFound(String),

    /// A process with that id already exists.
    #[error("process already exists: {0}")]
    AlreadyExists(String),

    /// No endpoint registered under that id.
    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),

    /// The endpoint has no such method or event.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Wrong argument count or undecodable arguments.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The OS refused to start the child.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The child started but never completed the handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An endpoint method failed on the remote side.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The call or operation was cancelled (explicitly, by deadline, or by teardown).
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Map to the wire failure kind used in failed responses.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Validation(_) | Error::InvalidArguments(_) => FailureKind::InvalidArguments,
            Error::ProcessLost(_) => FailureKind::ProcessLost,
            Error::ProcessNotFound(_) => FailureKind::ProcessNotFound,
            Error::AlreadyExists(_) => FailureKind::AlreadyExists,
            Error::EndpointNotFound(_) => FailureKind::EndpointNotFound,
            Error::MethodNotFound(_) => FailureKind::MethodNotFound,
            Error::Spawn(_) | Error::Handshake(_) => FailureKind::Spawn,
            Error::Remote(remote) => remote.kind,
            Error::Timeout(_) => FailureKind::Timeout,
            Error::Protocol(_)
            | Error::ChannelClosed(_)
            | Error::Cancelled(_)
            | Error::Internal(_)
            | Error::Serialization(_)
            | Error::Io(_) => FailureKind::Internal,
        }
    }

    /// Convert into the structured description carried by a failed response.
    pub fn to_remote_error(&self) -> RemoteError {
        match self {
            Error::Remote(remote) => remote.clone(),
            Error::ChannelClosed(msg) => RemoteError::new(FailureKind::ProcessLost, msg.clone()),
            other => RemoteError::new(other.failure_kind(), other.detail()),
        }
    }

    /// Whether this error must tear down the channel it occurred on.
    pub fn is_fatal_to_channel(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Io(_))
    }

    /// The message without the variant prefix added by `Display`.
    fn detail(&self) -> String {
        match self {
            Error::Validation(msg)
            | Error::Protocol(msg)
            | Error::ChannelClosed(msg)
            | Error::ProcessLost(msg)
            | Error::ProcessNotFound(msg)
            | Error::AlreadyExists(msg)
            | Error::EndpointNotFound(msg)
            | Error::MethodNotFound(msg)
            | Error::InvalidArguments(msg)
            | Error::Spawn(msg)
            | Error::Handshake(msg)
            | Error::Cancelled(msg)
            | Error::Timeout(msg)
            | Error::Internal(msg)
            | Error::Serialization(msg) => msg.clone(),
            Error::Remote(remote) => remote.message.clone(),
            Error::Io(e) => e.to_string(),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }

    pub fn process_lost(msg: impl Into<String>) -> Self {
        Self::ProcessLost(msg.into())
    }

    pub fn process_not_found(msg: impl Into<String>) -> Self {
        Self::ProcessNotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn endpoint_not_found(msg: impl Into<String>) -> Self {
        Self::EndpointNotFound(msg.into())
    }

    pub fn method_not_found(msg: impl Into<String>) -> Self {
        Self::MethodNotFound(msg.into())
    }

    pub fn invalid_arguments(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
