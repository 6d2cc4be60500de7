//! Endpoint dispatch.
//!
//! A [`Dispatcher`] is the callee side of an interface: "method id → invoke"
//! and "event name → hook/unhook". How it is produced does not matter to the
//! host; [`InterfaceBuilder`] builds one from closures and the
//! [`FactoryRegistry`] maps interface names to constructors so remote
//! create-endpoint requests can instantiate objects.
//!
//! [`Endpoint`] wraps a dispatcher with the per-call lifecycle:
//!
//! ```text
//! Received ─► resolve method ─► check arity ─► Executing ─┬─► Succeeded
//!                                                         ├─► Failed
//!                  cancel request / deadline / teardown ──┴─► Cancelled
//! ```

pub mod builder;
pub mod builtin;
pub mod descriptor;
pub mod endpoint;
pub mod recovery;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::address::EndpointAddress;
use crate::ipc::message::{Notification, RemoteError};
use crate::types::{ChannelId, Error, Result};

pub use builder::{EventEmitter, FnDispatcher, InterfaceBuilder};
pub use descriptor::{InterfaceDescriptor, MethodDescriptor};
pub use endpoint::Endpoint;

/// What a method sees of the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Address of the endpoint being called.
    pub endpoint: EndpointAddress,
    /// Channel the call arrived on ([`ChannelId::LOCAL`] for in-process callers).
    pub caller: ChannelId,
    /// Cancelled when the call is cancelled, times out, or the endpoint is torn down.
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// `now + after`, or `None` (no deadline) when that is beyond what the
/// clock can represent.
pub(crate) fn deadline_after(after: std::time::Duration) -> Option<Instant> {
    Instant::now().checked_add(after)
}

/// Resolves at `deadline`; never resolves without one.
pub(crate) async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Callback an endpoint hands to [`Dispatcher::hook`]; firing it fans the
/// event out to every subscriber.
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(Vec<Value>) + Send + Sync>);

impl EventSink {
    pub fn new(f: impl Fn(Vec<Value>) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn fire(&self, args: Vec<Value>) {
        (self.0)(args)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

/// Callee side of an interface.
#[async_trait]
pub trait Dispatcher: Send + Sync + fmt::Debug {
    fn descriptor(&self) -> &InterfaceDescriptor;

    /// Run method `method` (already resolved and arity-checked).
    async fn invoke(
        &self,
        method: u32,
        args: Vec<Value>,
        ctx: CallContext,
    ) -> std::result::Result<Value, RemoteError>;

    /// Attach `sink` to the underlying event source. Called on the first subscriber.
    fn hook(&self, event: &str, sink: EventSink) -> Result<()>;

    /// Detach the event source. Called when the last subscriber leaves.
    fn unhook(&self, event: &str);
}

/// Delivers notifications to subscribers anywhere in the tree.
#[async_trait]
pub trait NotificationRouter: Send + Sync + fmt::Debug {
    async fn deliver(&self, subscriber: &EndpointAddress, notification: Notification) -> Result<()>;
}

type Factory = Arc<dyn Fn() -> Arc<dyn Dispatcher> + Send + Sync>;

/// Interface name → dispatcher constructor. Clones share one table.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: Arc<RwLock<HashMap<String, Factory>>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in interfaces.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(builtin::DIAGNOSTICS_INTERFACE, builtin::diagnostics);
        registry
    }

    /// Register (or replace) a factory. Names are case-insensitive.
    pub fn register<F, D>(&self, interface: &str, factory: F)
    where
        F: Fn() -> D + Send + Sync + 'static,
        D: Dispatcher + 'static,
    {
        let factory: Factory = Arc::new(move || Arc::new(factory()) as Arc<dyn Dispatcher>);
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(interface.to_ascii_lowercase(), factory);
    }

    pub fn create(&self, interface: &str) -> Result<Arc<dyn Dispatcher>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&interface.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown interface: {}", interface)))?;
        Ok(factory())
    }

    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("interfaces", &self.interfaces())
            .finish()
    }
}
