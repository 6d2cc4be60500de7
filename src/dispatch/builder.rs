//! Closure-backed dispatchers.
//!
//! ```ignore
//! let events = EventEmitter::new();
//! let dispatcher = InterfaceBuilder::new("counter")
//!     .method("Get", 0, |_args, _ctx| async { Ok(json!(1)) })
//!     .event("Changed")
//!     .build(events.clone());
//! events.emit("Changed", vec![json!(2)]); // no-op until someone subscribes
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::dispatch::{CallContext, Dispatcher, EventSink, InterfaceDescriptor, MethodDescriptor};
use crate::ipc::message::{FailureKind, RemoteError};
use crate::types::{Error, Result};

type Handler = Arc<
    dyn Fn(Vec<Value>, CallContext) -> BoxFuture<'static, std::result::Result<Value, RemoteError>>
        + Send
        + Sync,
>;

/// Event source shared between a dispatcher and the code raising its events.
///
/// An event with no hooked sink costs one map lookup.
#[derive(Clone, Default)]
pub struct EventEmitter {
    sinks: Arc<Mutex<HashMap<String, EventSink>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise an event. Returns whether anyone is listening.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> bool {
        let sink = self
            .sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.to_ascii_lowercase())
            .cloned();
        match sink {
            Some(sink) => {
                sink.fire(args);
                true
            }
            None => false,
        }
    }

    pub fn is_hooked(&self, event: &str) -> bool {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&event.to_ascii_lowercase())
    }

    fn attach(&self, event: &str, sink: EventSink) {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.to_ascii_lowercase(), sink);
    }

    fn detach(&self, event: &str) {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&event.to_ascii_lowercase());
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooked: Vec<String> = self
            .sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        f.debug_struct("EventEmitter").field("hooked", &hooked).finish()
    }
}

/// Builds a [`FnDispatcher`]. Method ids are assigned in declaration order.
pub struct InterfaceBuilder {
    descriptor: InterfaceDescriptor,
    handlers: Vec<Handler>,
}

impl InterfaceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: InterfaceDescriptor::new(name),
            handlers: Vec::new(),
        }
    }

    /// Add a method that always runs to completion.
    pub fn method<F, Fut>(self, name: &str, arity: usize, handler: F) -> Self
    where
        F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, RemoteError>> + Send + 'static,
    {
        self.add(name, arity, false, handler)
    }

    /// Add a method that honours cancellation requests and caller deadlines.
    pub fn cancellable_method<F, Fut>(self, name: &str, arity: usize, handler: F) -> Self
    where
        F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, RemoteError>> + Send + 'static,
    {
        self.add(name, arity, true, handler)
    }

    pub fn event(mut self, name: &str) -> Self {
        self.descriptor.events.push(name.to_string());
        self
    }

    pub fn build(self, events: EventEmitter) -> FnDispatcher {
        FnDispatcher {
            descriptor: self.descriptor,
            handlers: self.handlers,
            events,
        }
    }

    fn add<F, Fut>(mut self, name: &str, arity: usize, cancellable: bool, handler: F) -> Self
    where
        F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, RemoteError>> + Send + 'static,
    {
        let id = self.handlers.len() as u32;
        self.descriptor.methods.push(MethodDescriptor {
            id,
            name: name.to_string(),
            arity,
            cancellable,
        });
        self.handlers
            .push(Arc::new(move |args: Vec<Value>, ctx: CallContext| {
                handler(args, ctx).boxed()
            }));
        self
    }
}

impl fmt::Debug for InterfaceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceBuilder")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Dispatcher whose methods are closures.
pub struct FnDispatcher {
    descriptor: InterfaceDescriptor,
    handlers: Vec<Handler>,
    events: EventEmitter,
}

impl fmt::Debug for FnDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDispatcher")
            .field("interface", &self.descriptor.name)
            .field("events", &self.events)
            .finish()
    }
}

#[async_trait]
impl Dispatcher for FnDispatcher {
    fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        method: u32,
        args: Vec<Value>,
        ctx: CallContext,
    ) -> std::result::Result<Value, RemoteError> {
        let handler = self.handlers.get(method as usize).cloned().ok_or_else(|| {
            RemoteError::new(
                FailureKind::MethodNotFound,
                format!("{} has no method #{}", self.descriptor.name, method),
            )
        })?;
        handler(args, ctx).await
    }

    fn hook(&self, event: &str, sink: EventSink) -> Result<()> {
        let event = self.descriptor.event(event).ok_or_else(|| {
            Error::method_not_found(format!("{} has no event {}", self.descriptor.name, event))
        })?;
        self.events.attach(event, sink);
        Ok(())
    }

    fn unhook(&self, event: &str) {
        self.events.detach(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelId;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> CallContext {
        CallContext {
            endpoint: "localhost/root/calc".parse().unwrap(),
            caller: ChannelId::LOCAL,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    fn calc(events: EventEmitter) -> FnDispatcher {
        InterfaceBuilder::new("calc")
            .method("Add", 2, |args, _ctx| async move {
                let a = args[0].as_i64().unwrap_or_default();
                let b = args[1].as_i64().unwrap_or_default();
                Ok(json!(a + b))
            })
            .cancellable_method("Wait", 0, |_args, ctx| async move {
                ctx.cancelled().await;
                Ok(Value::Null)
            })
            .event("Changed")
            .build(events)
    }

    #[tokio::test]
    async fn test_methods_get_sequential_ids() {
        let dispatcher = calc(EventEmitter::new());
        let d = dispatcher.descriptor();
        assert_eq!(d.method_by_name("Add").unwrap().id, 0);
        assert!(d.method_by_name("wait").unwrap().cancellable);

        let sum = dispatcher
            .invoke(0, vec![json!(2), json!(3)], ctx())
            .await
            .unwrap();
        assert_eq!(sum, json!(5));
        assert!(dispatcher.invoke(7, vec![], ctx()).await.is_err());
    }

    #[test]
    fn test_emitter_is_silent_until_hooked() {
        let events = EventEmitter::new();
        let dispatcher = calc(events.clone());
        assert!(!events.emit("Changed", vec![]));

        let fired = Arc::new(Mutex::new(Vec::new()));
        let seen = fired.clone();
        dispatcher
            .hook(
                "changed",
                EventSink::new(move |args| seen.lock().unwrap().extend(args)),
            )
            .unwrap();
        assert!(events.emit("CHANGED", vec![json!(1)]));
        assert_eq!(*fired.lock().unwrap(), vec![json!(1)]);

        dispatcher.unhook("Changed");
        assert!(!events.is_hooked("Changed"));
        assert!(dispatcher.hook("Missing", EventSink::new(|_| {})).is_err());
    }
}
