//! Framed duplex channels between a parent and its children.
//!
//! Frames carry a 4-byte little-endian length prefix; the payload is one
//! [`message::Envelope`] in the channel's [`WireFormat`]. A [`Channel`]
//! multiplexes concurrent calls over one transport and correlates
//! responses by call id.

pub mod channel;
pub mod codec;
pub mod message;
pub mod wire;

pub use channel::{Channel, PendingCall};
pub use wire::WireFormat;
