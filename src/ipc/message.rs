//! Message shapes carried inside frames.
//!
//! Two layers:
//! - [`Envelope`]: what every node decodes. Addressing and correlation only;
//!   bodies stay opaque [`Bytes`] so a relaying node forwards them unchanged.
//! - Bodies: [`CallBody`] inside a request, [`Outcome`] inside a response,
//!   [`Notification`] inside a notify. Only the node that serves or issued
//!   the call decodes these.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::address::EndpointAddress;
use crate::types::{CallId, EndpointId, Error, ProcessId, SubscriptionId};

// =============================================================================
// Envelope
// =============================================================================

/// Top-level frame content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// First frame in each direction. Completes the handshake.
    Hello(Hello),
    /// A call expecting exactly one [`Envelope::Response`].
    Request {
        call_id: CallId,
        target: EndpointAddress,
        /// Caller's declared timeout, used as an absolute deadline by the callee.
        timeout_ms: Option<u64>,
        payload: Bytes,
    },
    /// Terminal outcome of the request with the same id.
    Response { call_id: CallId, payload: Bytes },
    /// Cancel a request previously sent on this channel.
    Cancel {
        call_id: CallId,
        target: EndpointAddress,
    },
    /// One-way message (event fan-out, process-lost notices).
    Notify {
        target: EndpointAddress,
        payload: Bytes,
    },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello(_) => "hello",
            Envelope::Request { .. } => "request",
            Envelope::Response { .. } => "response",
            Envelope::Cancel { .. } => "cancel",
            Envelope::Notify { .. } => "notify",
        }
    }
}

/// Identity a peer announces when a channel comes up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub host: String,
    pub process_id: ProcessId,
    pub os_pid: u32,
}

// =============================================================================
// Request bodies
// =============================================================================

/// Body of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallBody {
    /// Call a method on an endpoint.
    Invoke(Invocation),
    /// Operate on the target process itself.
    Control(ControlRequest),
}

/// A method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub method: MethodRef,
    pub args: Vec<Value>,
}

impl Invocation {
    pub fn by_name(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: MethodRef::Name(name.into()),
            args,
        }
    }

    pub fn by_id(id: u32, args: Vec<Value>) -> Self {
        Self {
            method: MethodRef::Id(id),
            args,
        }
    }
}

/// How a request names its method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodRef {
    Id(u32),
    Name(String),
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodRef::Id(id) => write!(f, "#{}", id),
            MethodRef::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Control surface. Every request is addressed to the process that performs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Create a child of the target process.
    CreateProcess {
        info: ProcessCreationInfo,
        must_not_exist: bool,
    },
    /// Destroy a child of the target process.
    DestroyProcess { process_id: ProcessId },
    /// Instantiate a registered interface as a new endpoint in the target process.
    CreateEndpoint {
        endpoint_id: EndpointId,
        interface: String,
    },
    /// Tear down an endpoint of the target process.
    DestroyEndpoint { endpoint_id: EndpointId },
    /// Interface descriptor of an endpoint of the target process.
    DescribeEndpoint { endpoint_id: EndpointId },
    /// Add or remove a subscription. The request target is the endpoint
    /// raising the event, or a process address for its lifecycle.
    ChangeEventSubscription {
        event: String,
        subscription_id: SubscriptionId,
        /// Process the notifications are delivered to.
        subscriber: EndpointAddress,
        subscribe: bool,
    },
    /// Sent by a node to its parent when a descendant becomes reachable
    /// through it or stops being so. Forwarded up to the root.
    UpdateRoute {
        process_id: ProcessId,
        reachable: bool,
    },
}

/// Result of a create-process request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateOutcome {
    CreatedNew,
    AlreadyExists,
}

/// Everything needed to start a child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessCreationInfo {
    pub process_id: ProcessId,
    pub kind: ProcessKind,
    /// Worker executable. Falls back to the launcher configuration.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub integrity: IntegrityLevel,
}

impl ProcessCreationInfo {
    pub fn new(process_id: ProcessId, kind: ProcessKind) -> Self {
        Self {
            process_id,
            kind,
            program: None,
            args: Vec::new(),
            integrity: IntegrityLevel::default(),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Where and how a child runs. Transport selection depends on this alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessKind {
    /// Hosted on a task of the creating process, in-memory transport.
    InProcess,
    /// OS child on this machine, anonymous pipes.
    Local,
    /// OS child reachable only by socket (different personality or runtime).
    Socket,
    /// Started through the remote shell on another host.
    Remote { host: String },
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::InProcess => write!(f, "in-process"),
            ProcessKind::Local => write!(f, "local"),
            ProcessKind::Socket => write!(f, "socket"),
            ProcessKind::Remote { host } => write!(f, "remote:{}", host),
        }
    }
}

impl FromStr for ProcessKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-process" => Ok(ProcessKind::InProcess),
            "local" => Ok(ProcessKind::Local),
            "socket" => Ok(ProcessKind::Socket),
            other => match other.strip_prefix("remote:") {
                Some(host) if !host.is_empty() => Ok(ProcessKind::Remote {
                    host: host.to_string(),
                }),
                _ => Err(Error::validation(format!("unknown process kind: {:?}", s))),
            },
        }
    }
}

/// Privilege level requested for a child. Recorded and reported, not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for IntegrityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntegrityLevel::Low => "low",
            IntegrityLevel::Medium => "medium",
            IntegrityLevel::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for IntegrityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(IntegrityLevel::Low),
            "medium" => Ok(IntegrityLevel::Medium),
            "high" => Ok(IntegrityLevel::High),
            _ => Err(Error::validation(format!("unknown integrity level: {:?}", s))),
        }
    }
}

// =============================================================================
// Response bodies
// =============================================================================

/// The single terminal outcome of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Success(Value),
    Failure(RemoteError),
    Cancelled,
}

impl Outcome {
    pub fn from_result(result: std::result::Result<Value, RemoteError>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(err) => Outcome::Failure(err),
        }
    }

    /// Convert into a local result, turning failures back into typed errors.
    pub fn into_result(self) -> crate::types::Result<Value> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(remote) => Err(remote.into_error()),
            Outcome::Cancelled => Err(Error::cancelled("call cancelled")),
        }
    }
}

/// Category of a failed call, preserved across hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The endpoint method itself failed.
    Application,
    InvalidArguments,
    ProcessLost,
    ProcessNotFound,
    AlreadyExists,
    EndpointNotFound,
    MethodNotFound,
    Spawn,
    Timeout,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Application => "application",
            FailureKind::InvalidArguments => "invalid_arguments",
            FailureKind::ProcessLost => "process_lost",
            FailureKind::ProcessNotFound => "process_not_found",
            FailureKind::AlreadyExists => "already_exists",
            FailureKind::EndpointNotFound => "endpoint_not_found",
            FailureKind::MethodNotFound => "method_not_found",
            FailureKind::Spawn => "spawn",
            FailureKind::Timeout => "timeout",
            FailureKind::Internal => "internal",
        }
    }
}

/// Structured description of a remote failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: FailureKind,
    pub type_name: String,
    pub message: String,
    pub remote_stack: Option<String>,
}

impl RemoteError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            type_name: kind.as_str().to_string(),
            message: message.into(),
            remote_stack: None,
        }
    }

    /// An error raised by endpoint code.
    pub fn application(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Application,
            type_name: type_name.into(),
            message: message.into(),
            remote_stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.remote_stack = Some(stack.into());
        self
    }

    /// Rebuild the local error this failure describes.
    pub fn into_error(self) -> Error {
        match self.kind {
            FailureKind::InvalidArguments => Error::InvalidArguments(self.message),
            FailureKind::ProcessLost => Error::ProcessLost(self.message),
            FailureKind::ProcessNotFound => Error::ProcessNotFound(self.message),
            FailureKind::AlreadyExists => Error::AlreadyExists(self.message),
            FailureKind::EndpointNotFound => Error::EndpointNotFound(self.message),
            FailureKind::MethodNotFound => Error::MethodNotFound(self.message),
            FailureKind::Spawn => Error::Spawn(self.message),
            FailureKind::Timeout => Error::Timeout(self.message),
            FailureKind::Application | FailureKind::Internal => Error::Remote(self),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)?;
        if let Some(stack) = &self.remote_stack {
            write!(f, "\n{}", stack)?;
        }
        Ok(())
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// Body of a notify envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    EventFired {
        subscription_id: SubscriptionId,
        source: EndpointAddress,
        event: String,
        args: Vec<Value>,
    },
    ProcessLost {
        subscription_id: SubscriptionId,
        process: EndpointAddress,
        reason: String,
    },
}

impl Notification {
    pub fn subscription_id(&self) -> &SubscriptionId {
        match self {
            Notification::EventFired {
                subscription_id, ..
            }
            | Notification::ProcessLost {
                subscription_id, ..
            } => subscription_id,
        }
    }
}
