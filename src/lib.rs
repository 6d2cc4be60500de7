//! # Hostmesh Core - Process-Tree Host
//!
//! Rust implementation of a process host providing:
//! - Framed duplex channels with keep-alives and multiplexed calls
//! - A launcher that spawns children and completes a punch-payload handshake
//! - A broker that routes calls through a tree of worker processes
//! - Endpoints that dispatch typed method calls and fan out events
//! - Cancellation, timeouts and process-lost notifications
//!
//! ## Architecture
//!
//! Every process in the tree runs a [`Node`]. A node owns its endpoints and
//! its direct children; anything deeper is reached through the child that
//! announced it:
//! ```text
//!                 ┌──────────────┐
//!   callers  →    │  Node (root) │ ── endpoints
//!                 └──────┬───────┘
//!              channel   │   channel
//!           ┌────────────┴─────────────┐
//!     ┌─────┴──────┐             ┌─────┴──────┐
//!     │ Node (P1)  │             │ Node (P2)  │ ── endpoints
//!     └─────┬──────┘             └────────────┘
//!           │
//!     ┌─────┴──────┐
//!     │ Node (P3)  │
//!     └────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod address;
pub mod broker;
pub mod client;
pub mod dispatch;
pub mod ipc;
pub mod launcher;
pub mod types;
pub mod worker;

// Internal utilities
pub mod observability;

pub use address::EndpointAddress;
pub use broker::{CallOptions, Node, ProcessState};
pub use client::{RemoteEndpoint, RemoteProcess, Subscription};
pub use ipc::message::{CreateOutcome, Notification, ProcessCreationInfo, ProcessKind};
pub use types::{Config, Error, Result};
