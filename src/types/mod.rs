//! Core types for the process host.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ProcessId, EndpointId, CallId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the node, channels and launcher

mod config;
mod errors;
mod ids;

pub use config::{
    ChannelConfig, Config, LauncherConfig, NodeConfig, ObservabilityConfig, ENV_HOST_AUTHORITY,
};
pub use errors::{Error, Result};
pub use ids::{CallId, ChannelId, EndpointId, ProcessId, SubscriptionId, ROOT_PROCESS_ID};
