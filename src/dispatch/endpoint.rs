//! Endpoint registration: a dispatcher plus its call lifecycle and
//! event-subscription table.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::address::EndpointAddress;
use crate::dispatch::recovery::{join_failure, recover_panic, with_recovery};
use crate::dispatch::{
    expired, CallContext, Dispatcher, EventSink, InterfaceDescriptor, NotificationRouter,
};
use crate::ipc::message::{FailureKind, Invocation, Notification, Outcome, RemoteError};
use crate::types::{ChannelId, Error, Result, SubscriptionId};

/// Where an event notification goes.
#[derive(Debug, Clone)]
pub struct Subscriber {
    /// Process (or endpoint) the notification is routed to.
    pub address: EndpointAddress,
    /// Channel the subscription arrived on. Closing it drops the subscription.
    pub channel: ChannelId,
}

type SubscriberTable = HashMap<String, HashMap<SubscriptionId, Subscriber>>;

/// A dispatcher registered under an endpoint id.
#[derive(Debug)]
pub struct Endpoint {
    address: EndpointAddress,
    dispatcher: Arc<dyn Dispatcher>,
    teardown: CancellationToken,
    /// Event name (canonical spelling) → subscribers. An event is hooked
    /// exactly while its entry is non-empty.
    subscribers: Mutex<SubscriberTable>,
    router: Arc<dyn NotificationRouter>,
    this: Weak<Endpoint>,
}

impl Endpoint {
    pub fn new(
        address: EndpointAddress,
        dispatcher: Arc<dyn Dispatcher>,
        router: Arc<dyn NotificationRouter>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            address,
            dispatcher,
            teardown: CancellationToken::new(),
            subscribers: Mutex::new(HashMap::new()),
            router,
            this: this.clone(),
        })
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn interface(&self) -> &str {
        &self.dispatcher.descriptor().name
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        self.dispatcher.descriptor()
    }

    pub fn is_torn_down(&self) -> bool {
        self.teardown.is_cancelled()
    }

    // =========================================================================
    // Call lifecycle
    // =========================================================================

    /// Serve one call and produce its single terminal outcome.
    ///
    /// `cancel` is the call's own signal (explicit cancellation requests).
    /// It and `deadline` only apply to cancellable methods; endpoint teardown
    /// cancels every call.
    pub async fn execute(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
        deadline: Option<Instant>,
        caller: ChannelId,
    ) -> Outcome {
        if self.is_torn_down() {
            return Outcome::Failure(
                Error::endpoint_not_found(self.address.to_string()).to_remote_error(),
            );
        }

        let descriptor = self.dispatcher.descriptor();
        let method = match descriptor.resolve(&invocation.method) {
            Ok(method) => method.clone(),
            Err(e) => return Outcome::Failure(e.to_remote_error()),
        };
        if invocation.args.len() != method.arity {
            return Outcome::Failure(RemoteError::new(
                FailureKind::InvalidArguments,
                format!(
                    "{}.{} takes {} argument(s), got {}",
                    descriptor.name,
                    method.name,
                    method.arity,
                    invocation.args.len()
                ),
            ));
        }

        let ctx_token = self.teardown.child_token();
        let ctx = CallContext {
            endpoint: self.address.clone(),
            caller,
            cancel: ctx_token.clone(),
            deadline: if method.cancellable { deadline } else { None },
        };
        let dispatcher = self.dispatcher.clone();
        let method_id = method.id;
        let args = invocation.args;
        let name = method.name.clone();
        let mut task = tokio::spawn(async move {
            recover_panic(dispatcher.invoke(method_id, args, ctx), &name).await
        });

        let joined = tokio::select! {
            joined = &mut task => Some(joined),
            _ = cancel.cancelled(), if method.cancellable => None,
            _ = expired(deadline), if method.cancellable => None,
            _ = self.teardown.cancelled() => None,
        };

        match joined {
            Some(Ok(result)) => Outcome::from_result(result),
            Some(Err(join_err)) => Outcome::Failure(join_failure(join_err, &method.name)),
            None => {
                // The method observes the token at its next await point; its
                // eventual result is discarded.
                ctx_token.cancel();
                tracing::debug!("Call to {}.{} cancelled", self.address, method.name);
                Outcome::Cancelled
            }
        }
    }

    // =========================================================================
    // Event subscriptions
    // =========================================================================

    /// Add a subscriber. Hooks the event on its first subscriber.
    ///
    /// Returns `false` if the subscription already existed.
    pub fn add_subscription(
        &self,
        event: &str,
        subscription_id: SubscriptionId,
        subscriber: Subscriber,
    ) -> Result<bool> {
        let descriptor = self.dispatcher.descriptor();
        let event = descriptor
            .event(event)
            .ok_or_else(|| {
                Error::method_not_found(format!("{} has no event {}", descriptor.name, event))
            })?
            .to_string();

        let mut table = self.lock_subscribers();
        if self.is_torn_down() {
            return Err(Error::endpoint_not_found(self.address.to_string()));
        }
        let subscribers = table.entry(event.clone()).or_default();
        if subscribers.contains_key(&subscription_id) {
            return Ok(false);
        }
        if subscribers.is_empty() {
            let sink = self.sink_for(&event);
            let dispatcher = self.dispatcher.clone();
            let hooked = with_recovery(|| dispatcher.hook(&event, sink), "hook");
            if let Err(e) = hooked {
                table.remove(&event);
                return Err(e);
            }
            tracing::debug!("Hooked {}.{}", self.address, event);
        }
        subscribers.insert(subscription_id, subscriber);
        Ok(true)
    }

    /// Remove a subscriber. Unhooks the event when the last one leaves.
    ///
    /// Removing an unknown subscription is a no-op returning `false`.
    pub fn remove_subscription(&self, event: &str, subscription_id: &SubscriptionId) -> Result<bool> {
        let descriptor = self.dispatcher.descriptor();
        let Some(event) = descriptor.event(event) else {
            return Err(Error::method_not_found(format!(
                "{} has no event {}",
                descriptor.name, event
            )));
        };

        let mut table = self.lock_subscribers();
        let removed = match table.get_mut(event) {
            Some(subscribers) => subscribers.remove(subscription_id).is_some(),
            None => false,
        };
        if removed {
            self.unhook_if_idle(&mut table, event);
        }
        Ok(removed)
    }

    /// Drop every subscription that arrived over `channel`.
    pub fn remove_channel_subscriptions(&self, channel: ChannelId) -> usize {
        let mut table = self.lock_subscribers();
        let mut removed = 0;
        let events: Vec<String> = table.keys().cloned().collect();
        for event in events {
            if let Some(subscribers) = table.get_mut(&event) {
                let before = subscribers.len();
                subscribers.retain(|_, s| s.channel != channel);
                removed += before - subscribers.len();
            }
            self.unhook_if_idle(&mut table, &event);
        }
        removed
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        let descriptor = self.dispatcher.descriptor();
        descriptor
            .event(event)
            .and_then(|event| self.lock_subscribers().get(event).map(HashMap::len))
            .unwrap_or(0)
    }

    /// Cancel every in-flight call and drop every subscription.
    pub fn tear_down(&self) {
        self.teardown.cancel();
        let mut table = self.lock_subscribers();
        for event in table.keys() {
            self.dispatcher.unhook(event);
        }
        table.clear();
        tracing::debug!("Endpoint {} torn down", self.address);
    }

    fn unhook_if_idle(&self, table: &mut MutexGuard<'_, SubscriberTable>, event: &str) {
        if table.get(event).is_some_and(HashMap::is_empty) {
            table.remove(event);
            self.dispatcher.unhook(event);
            tracing::debug!("Unhooked {}.{}", self.address, event);
        }
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, SubscriberTable> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sink_for(&self, event: &str) -> EventSink {
        let this = self.this.clone();
        let event = event.to_string();
        EventSink::new(move |args| {
            if let Some(endpoint) = this.upgrade() {
                endpoint.fan_out(&event, args);
            }
        })
    }

    /// Deliver one firing to every current subscriber, off the caller's thread.
    fn fan_out(&self, event: &str, args: Vec<Value>) {
        let targets: Vec<(SubscriptionId, Subscriber)> = self
            .lock_subscribers()
            .get(event)
            .map(|subs| subs.iter().map(|(id, s)| (id.clone(), s.clone())).collect())
            .unwrap_or_default();
        if targets.is_empty() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Event {}.{} fired outside a runtime, dropped", self.address, event);
            return;
        };
        let router = self.router.clone();
        let this = self.this.clone();
        let source = self.address.clone();
        let event = event.to_string();
        runtime.spawn(async move {
            for (subscription_id, subscriber) in targets {
                let notification = Notification::EventFired {
                    subscription_id: subscription_id.clone(),
                    source: source.clone(),
                    event: event.clone(),
                    args: args.clone(),
                };
                if let Err(e) = router.deliver(&subscriber.address, notification).await {
                    tracing::debug!(
                        "Dropping subscription {} on {}.{}: {}",
                        subscription_id,
                        source,
                        event,
                        e
                    );
                    if let Some(endpoint) = this.upgrade() {
                        let _ = endpoint.remove_subscription(&event, &subscription_id);
                    }
                }
            }
        });
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.teardown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{EventEmitter, InterfaceBuilder};
    use crate::ipc::message::MethodRef;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct ChannelRouter(mpsc::UnboundedSender<(EndpointAddress, Notification)>);

    #[async_trait]
    impl NotificationRouter for ChannelRouter {
        async fn deliver(
            &self,
            subscriber: &EndpointAddress,
            notification: Notification,
        ) -> Result<()> {
            self.0
                .send((subscriber.clone(), notification))
                .map_err(|_| Error::process_not_found("gone"))
        }
    }

    fn endpoint(
        events: EventEmitter,
    ) -> (
        Arc<Endpoint>,
        mpsc::UnboundedReceiver<(EndpointAddress, Notification)>,
    ) {
        let dispatcher = InterfaceBuilder::new("test")
            .method("Echo", 1, |args, _ctx| async move { Ok(args[0].clone()) })
            .cancellable_method("Sleep", 1, |args, ctx| async move {
                let ms = args[0].as_u64().unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!("slept")),
                    _ = ctx.cancelled() => Ok(json!("interrupted")),
                }
            })
            .method("Block", 1, |args, _ctx| async move {
                let ms = args[0].as_u64().unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!("done"))
            })
            .method("Panic", 0, |_args, _ctx| async move {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            })
            .event("Tick")
            .build(events);
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Endpoint::new(
                "localhost/root/test".parse().unwrap(),
                Arc::new(dispatcher),
                Arc::new(ChannelRouter(tx)),
            ),
            rx,
        )
    }

    fn subscriber(channel: ChannelId) -> Subscriber {
        Subscriber {
            address: "localhost/root".parse().unwrap(),
            channel,
        }
    }

    #[tokio::test]
    async fn test_echo_by_name() {
        let (ep, _rx) = endpoint(EventEmitter::new());
        let outcome = ep
            .execute(
                Invocation::by_name("echo", vec![json!(5)]),
                CancellationToken::new(),
                None,
                ChannelId::LOCAL,
            )
            .await;
        assert_eq!(outcome, Outcome::Success(json!(5)));
    }

    #[tokio::test]
    async fn test_wrong_arity_and_unknown_method() {
        let (ep, _rx) = endpoint(EventEmitter::new());
        let outcome = ep
            .execute(
                Invocation::by_name("Echo", vec![]),
                CancellationToken::new(),
                None,
                ChannelId::LOCAL,
            )
            .await;
        assert!(matches!(outcome, Outcome::Failure(ref e) if e.kind == FailureKind::InvalidArguments));

        let outcome = ep
            .execute(
                Invocation {
                    method: MethodRef::Id(42),
                    args: vec![],
                },
                CancellationToken::new(),
                None,
                ChannelId::LOCAL,
            )
            .await;
        assert!(matches!(outcome, Outcome::Failure(ref e) if e.kind == FailureKind::MethodNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_cancellable_method() {
        let (ep, _rx) = endpoint(EventEmitter::new());
        let started = Instant::now();
        let outcome = ep
            .execute(
                Invocation::by_name("Sleep", vec![json!(5000)]),
                CancellationToken::new(),
                Some(Instant::now() + Duration::from_millis(50)),
                ChannelId::LOCAL,
            )
            .await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_cancellable_method_ignores_cancel_and_deadline() {
        let (ep, _rx) = endpoint(EventEmitter::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = ep
            .execute(
                Invocation::by_name("Block", vec![json!(200)]),
                cancel,
                Some(Instant::now() + Duration::from_millis(10)),
                ChannelId::LOCAL,
            )
            .await;
        assert_eq!(outcome, Outcome::Success(json!("done")));
    }

    #[tokio::test]
    async fn test_explicit_cancel() {
        let (ep, _rx) = endpoint(EventEmitter::new());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let outcome = ep
            .execute(
                Invocation::by_name("Sleep", vec![json!(10_000)]),
                cancel,
                None,
                ChannelId::LOCAL,
            )
            .await;
        assert_eq!(outcome, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn test_teardown_cancels_every_call() {
        let (ep, _rx) = endpoint(EventEmitter::new());
        let running = {
            let ep = ep.clone();
            tokio::spawn(async move {
                ep.execute(
                    Invocation::by_name("Block", vec![json!(10_000)]),
                    CancellationToken::new(),
                    None,
                    ChannelId::LOCAL,
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ep.tear_down();
        assert_eq!(running.await.unwrap(), Outcome::Cancelled);

        let after = ep
            .execute(
                Invocation::by_name("Echo", vec![json!(1)]),
                CancellationToken::new(),
                None,
                ChannelId::LOCAL,
            )
            .await;
        assert!(matches!(after, Outcome::Failure(ref e) if e.kind == FailureKind::EndpointNotFound));
    }

    #[tokio::test]
    async fn test_panic_becomes_application_failure() {
        let (ep, _rx) = endpoint(EventEmitter::new());
        let outcome = ep
            .execute(
                Invocation::by_name("Panic", vec![]),
                CancellationToken::new(),
                None,
                ChannelId::LOCAL,
            )
            .await;
        match outcome {
            Outcome::Failure(e) => {
                assert_eq!(e.type_name, "panic");
                assert_eq!(e.message, "boom");
                let stack = e.remote_stack.unwrap();
                assert!(stack.contains("endpoint.rs"), "stack: {stack}");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hook_follows_subscriber_count() {
        let events = EventEmitter::new();
        let (ep, mut rx) = endpoint(events.clone());
        let first = SubscriptionId::new();
        let second = SubscriptionId::new();
        let ch = ChannelId::next();

        assert!(!events.is_hooked("Tick"));
        assert!(ep.add_subscription("tick", first.clone(), subscriber(ch)).unwrap());
        assert!(events.is_hooked("Tick"));
        assert!(!ep.add_subscription("Tick", first.clone(), subscriber(ch)).unwrap());
        assert!(ep.add_subscription("Tick", second.clone(), subscriber(ch)).unwrap());
        assert_eq!(ep.subscriber_count("Tick"), 2);

        events.emit("Tick", vec![json!(1)]);
        let mut seen = Vec::new();
        for _ in 0..2 {
            let (_, notification) = rx.recv().await.unwrap();
            seen.push(notification.subscription_id().clone());
        }
        assert!(seen.contains(&first) && seen.contains(&second));

        assert!(ep.remove_subscription("Tick", &first).unwrap());
        assert!(events.is_hooked("Tick"));
        assert!(ep.remove_subscription("Tick", &second).unwrap());
        assert!(!events.is_hooked("Tick"));

        // Removing again is a no-op.
        assert!(!ep.remove_subscription("Tick", &second).unwrap());
        assert!(ep.add_subscription("Nope", SubscriptionId::new(), subscriber(ch)).is_err());
    }

    #[tokio::test]
    async fn test_channel_close_drops_its_subscriptions() {
        let events = EventEmitter::new();
        let (ep, _rx) = endpoint(events.clone());
        let gone = ChannelId::next();
        let stays = ChannelId::next();
        ep.add_subscription("Tick", SubscriptionId::new(), subscriber(gone))
            .unwrap();
        ep.add_subscription("Tick", SubscriptionId::new(), subscriber(stays))
            .unwrap();

        assert_eq!(ep.remove_channel_subscriptions(gone), 1);
        assert!(events.is_hooked("Tick"));
        assert_eq!(ep.remove_channel_subscriptions(stays), 1);
        assert!(!events.is_hooked("Tick"));
    }
}
