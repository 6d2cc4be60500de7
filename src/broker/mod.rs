//! Broker: one node of the process tree.
//!
//! A [`Node`] owns the local endpoint table, the table of direct children,
//! the routes to deeper descendants and (for workers) the channel to its
//! parent. Every inbound request is routed by target process id:
//!
//! ```text
//!   target == self           ─► local endpoint / control handler
//!   target == direct child   ─► relay on the child's channel
//!   target behind a child    ─► relay on that child's channel
//!   anything else            ─► relay to the parent (root: not found)
//! ```
//!
//! Relayed payloads are never decoded: the request body is re-issued on the
//! next hop as opaque bytes and the response bytes come back unchanged.
//! The one exception is lifecycle control addressed to a direct child
//! (destroying it, subscribing to its loss), which only its supervisor can
//! answer.

mod control;
pub mod process;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::address::EndpointAddress;
use crate::dispatch::endpoint::Subscriber;
use crate::dispatch::{
    deadline_after, expired, Dispatcher, Endpoint, FactoryRegistry, NotificationRouter,
};
use crate::ipc::message::{
    CallBody, ControlRequest, CreateOutcome, Envelope, Hello, Notification, Outcome,
    ProcessCreationInfo, RemoteError,
};
use crate::ipc::{Channel, WireFormat};
use crate::launcher::{InProcessHost, Launcher};
use crate::types::{
    CallId, ChannelId, Config, EndpointId, Error, ProcessId, Result, SubscriptionId,
};

pub use process::{ProcessHandle, ProcessState};

/// Event name used to subscribe to the loss of a process.
pub const PROCESS_LOST_EVENT: &str = "ProcessLost";

/// Where an inbound message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Origin {
    /// An API call made in this process.
    Local,
    Parent,
    Child(ProcessId),
}

/// Next hop for a target process.
enum Route {
    Local,
    Child(Arc<ProcessHandle>),
    Parent(Channel),
    Unknown,
}

/// Options for one outgoing call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Sent to the callee as its deadline and enforced locally.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }
}

/// Local receiver of notifications addressed to this process.
#[derive(Debug)]
pub(crate) struct Listener {
    pub(crate) tx: mpsc::UnboundedSender<Notification>,
}

/// Parent link of a worker node.
#[derive(Debug)]
struct ParentLink {
    channel: Channel,
    address: EndpointAddress,
}

pub(crate) struct NodeInner {
    identity: Hello,
    address: EndpointAddress,
    config: Config,
    launcher: Launcher,
    factories: FactoryRegistry,
    endpoints: Mutex<HashMap<EndpointId, Arc<Endpoint>>>,
    endpoint_added: Notify,
    processes: Mutex<HashMap<ProcessId, Arc<ProcessHandle>>>,
    /// Descendant → the direct child it is reachable through.
    descendants: Mutex<HashMap<ProcessId, ProcessId>>,
    inflight: Mutex<HashMap<(ChannelId, CallId), CancellationToken>>,
    listeners: Mutex<HashMap<SubscriptionId, Listener>>,
    /// Process-lost subscribers, keyed by the watched process.
    lost_watchers: Mutex<HashMap<ProcessId, HashMap<SubscriptionId, Subscriber>>>,
    parent: OnceLock<ParentLink>,
    shutdown: CancellationToken,
    this: Weak<NodeInner>,
}

impl fmt::Debug for NodeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("os_pid", &self.identity.os_pid)
            .finish()
    }
}

/// Lock a table, recovering from poisoning.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// One process of the tree. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Node for `process_id`. Children it creates with
    /// [`ProcessKind::InProcess`](crate::ipc::message::ProcessKind::InProcess)
    /// run on tasks of this process, sharing `factories`.
    pub fn new(process_id: ProcessId, config: Config, factories: FactoryRegistry) -> Self {
        let identity = Hello {
            host: config.node.host_authority.clone(),
            process_id,
            os_pid: std::process::id(),
        };
        let in_process: Arc<dyn InProcessHost> = Arc::new(crate::worker::InProcessWorkerHost::new(
            config.clone(),
            factories.clone(),
        ));
        let launcher = Launcher::new(
            identity.clone(),
            config.launcher.clone(),
            config.channel.clone(),
            config.node.wire_format,
        )
        .with_in_process_host(in_process);
        let address = EndpointAddress::process(identity.host.clone(), identity.process_id.clone());

        let inner = Arc::new_cyclic(|this| NodeInner {
            identity,
            address,
            config,
            launcher,
            factories,
            endpoints: Mutex::new(HashMap::new()),
            endpoint_added: Notify::new(),
            processes: Mutex::new(HashMap::new()),
            descendants: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            lost_watchers: Mutex::new(HashMap::new()),
            parent: OnceLock::new(),
            shutdown: CancellationToken::new(),
            this: this.clone(),
        });
        tracing::info!("Node {} started", inner.address);
        Self { inner }
    }

    /// The root of a tree, with the built-in interfaces registered.
    pub fn root(config: Config) -> Self {
        Self::new(ProcessId::root(), config, FactoryRegistry::with_builtins())
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.inner.address
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.inner.identity.process_id
    }

    pub fn hello(&self) -> &Hello {
        &self.inner.identity
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn factories(&self) -> &FactoryRegistry {
        &self.inner.factories
    }

    pub fn format(&self) -> WireFormat {
        self.inner.config.node.wire_format
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once the node has shut down.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Register a dispatcher under `endpoint_id` in this process.
    pub fn register_endpoint(
        &self,
        endpoint_id: EndpointId,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<EndpointAddress> {
        self.inner.register_endpoint(endpoint_id, dispatcher)
    }

    /// Instantiate a registered interface as a local endpoint.
    pub fn create_endpoint(&self, endpoint_id: EndpointId, interface: &str) -> Result<EndpointAddress> {
        let dispatcher = self.inner.factories.create(interface)?;
        self.inner.register_endpoint(endpoint_id, dispatcher)
    }

    /// Tear down a local endpoint, cancelling its in-flight calls.
    pub fn destroy_endpoint(&self, endpoint_id: &EndpointId) -> Result<()> {
        self.inner.destroy_endpoint(endpoint_id)
    }

    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        lock(&self.inner.endpoints).keys().cloned().collect()
    }

    // =========================================================================
    // Processes
    // =========================================================================

    /// Create a direct child of this process.
    pub async fn create_process(
        &self,
        info: ProcessCreationInfo,
        must_not_exist: bool,
    ) -> Result<CreateOutcome> {
        self.inner.create_child(info, must_not_exist).await
    }

    /// Destroy a process anywhere in the tree. Returns `false` if it was not
    /// running.
    pub async fn destroy_process(&self, process_id: &ProcessId) -> Result<bool> {
        if lock(&self.inner.processes).contains_key(process_id) {
            return self.inner.destroy_child(process_id).await;
        }
        let target = EndpointAddress::process(self.inner.address.host(), process_id.clone());
        let body = CallBody::Control(ControlRequest::DestroyProcess {
            process_id: process_id.clone(),
        });
        match self.call(target, &body, CallOptions::default()).await {
            Ok(value) => Ok(value.as_bool().unwrap_or(false)),
            Err(Error::ProcessNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// State of a direct child.
    pub fn process_state(&self, process_id: &ProcessId) -> Option<ProcessState> {
        lock(&self.inner.processes)
            .get(process_id)
            .map(|handle| handle.state())
    }

    pub fn process_handle(&self, process_id: &ProcessId) -> Option<Arc<ProcessHandle>> {
        lock(&self.inner.processes).get(process_id).cloned()
    }

    pub fn child_ids(&self) -> Vec<ProcessId> {
        lock(&self.inner.processes).keys().cloned().collect()
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Send a call body to `target` and wait for its outcome.
    ///
    /// A timeout or cancellation resolves the call as cancelled immediately;
    /// the callee is told to stop and its late outcome is dropped.
    pub async fn call(
        &self,
        target: EndpointAddress,
        body: &CallBody,
        options: CallOptions,
    ) -> Result<Value> {
        let payload = Bytes::from(self.format().encode(body)?);
        let token = options
            .cancel
            .map(|cancel| cancel.child_token())
            .unwrap_or_default();
        let timeout_ms = options
            .timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        let expiry = options.timeout.and_then(deadline_after);

        let inner = self.inner.clone();
        let call_token = token.clone();
        let call_target = target.clone();
        let mut task = tokio::spawn(async move {
            inner
                .dispatch(&Origin::Local, ChannelId::LOCAL, call_target, timeout_ms, payload, call_token)
                .await
        });

        let finished = tokio::select! {
            joined = &mut task => Some(joined),
            _ = token.cancelled() => None,
            _ = expired(expiry) => None,
        };
        match finished {
            Some(Ok(bytes)) => {
                let outcome: Outcome = self.format().decode(&bytes)?;
                outcome.into_result()
            }
            Some(Err(e)) => Err(Error::internal(format!("call task failed: {}", e))),
            None => {
                token.cancel();
                tracing::debug!("Call to {} cancelled by the caller", target);
                Err(Error::cancelled(format!("call to {} cancelled", target)))
            }
        }
    }

    /// Subscribe this process to `event` on `target`.
    ///
    /// `target` is an endpoint for its events, or a process address with
    /// [`PROCESS_LOST_EVENT`] for its loss.
    pub async fn subscribe(
        &self,
        target: EndpointAddress,
        event: &str,
    ) -> Result<crate::client::Subscription> {
        let subscription_id = SubscriptionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.listeners).insert(subscription_id.clone(), Listener { tx });

        let body = CallBody::Control(ControlRequest::ChangeEventSubscription {
            event: event.to_string(),
            subscription_id: subscription_id.clone(),
            subscriber: self.inner.address.clone(),
            subscribe: true,
        });
        match self.call(target.clone(), &body, CallOptions::default()).await {
            Ok(_) => Ok(crate::client::Subscription::new(
                self.clone(),
                target,
                event.to_string(),
                subscription_id,
                rx,
            )),
            Err(e) => {
                lock(&self.inner.listeners).remove(&subscription_id);
                Err(e)
            }
        }
    }

    /// Be told when `process_id`, anywhere in the tree, is lost or destroyed.
    pub async fn subscribe_process_lost(
        &self,
        process_id: ProcessId,
    ) -> Result<crate::client::Subscription> {
        let target = EndpointAddress::process(self.inner.address.host(), process_id);
        self.subscribe(target, PROCESS_LOST_EVENT).await
    }

    /// Remove a subscription made with [`Node::subscribe`]. Removing one that
    /// is already gone is a no-op returning `false`.
    pub async fn unsubscribe(
        &self,
        target: EndpointAddress,
        event: &str,
        subscription_id: &SubscriptionId,
    ) -> Result<bool> {
        lock(&self.inner.listeners).remove(subscription_id);
        let body = CallBody::Control(ControlRequest::ChangeEventSubscription {
            event: event.to_string(),
            subscription_id: subscription_id.clone(),
            subscriber: self.inner.address.clone(),
            subscribe: false,
        });
        let removed = self.call(target, &body, CallOptions::default()).await?;
        Ok(removed.as_bool().unwrap_or(false))
    }

    /// Client for an endpoint anywhere in the tree.
    pub fn endpoint(&self, address: EndpointAddress) -> crate::client::RemoteEndpoint {
        crate::client::RemoteEndpoint::new(self.clone(), address)
    }

    /// Client for a process anywhere in the tree (this one included).
    pub fn process(&self, process_id: ProcessId) -> crate::client::RemoteProcess {
        crate::client::RemoteProcess::new(
            self.clone(),
            EndpointAddress::process(self.inner.address.host(), process_id),
        )
    }

    // =========================================================================
    // Tree membership
    // =========================================================================

    /// Adopt the channel to this node's parent, after its handshake.
    pub fn attach_parent(
        &self,
        parent: &Hello,
        channel: Channel,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<()> {
        let link = ParentLink {
            channel: channel.clone(),
            address: EndpointAddress::process(parent.host.clone(), parent.process_id.clone()),
        };
        self.inner
            .parent
            .set(link)
            .map_err(|_| Error::validation("parent channel already attached"))?;
        tracing::info!(
            "Node {} attached to parent {} over {}",
            self.inner.address,
            parent.process_id,
            channel.id()
        );
        tokio::spawn(pump(self.inner.this.clone(), channel, inbound, Origin::Parent));
        Ok(())
    }

    /// Destroy every child, tear down every endpoint and drop the parent link.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

// =============================================================================
// Routing
// =============================================================================

impl NodeInner {
    fn format(&self) -> WireFormat {
        self.config.node.wire_format
    }

    fn route(&self, process_id: &ProcessId) -> Route {
        if process_id == &self.identity.process_id {
            return Route::Local;
        }
        {
            let processes = lock(&self.processes);
            if let Some(handle) = processes.get(process_id) {
                return Route::Child(handle.clone());
            }
            let via = lock(&self.descendants).get(process_id).cloned();
            if let Some(handle) = via.and_then(|via| processes.get(&via).cloned()) {
                return Route::Child(handle);
            }
        }
        match self.parent.get() {
            Some(parent) => Route::Parent(parent.channel.clone()),
            None => Route::Unknown,
        }
    }

    /// Serve or relay one request and produce the encoded outcome.
    async fn dispatch(
        &self,
        origin: &Origin,
        caller: ChannelId,
        target: EndpointAddress,
        timeout_ms: Option<u64>,
        payload: Bytes,
        cancel: CancellationToken,
    ) -> Bytes {
        let deadline = timeout_ms.and_then(|ms| deadline_after(Duration::from_millis(ms)));
        match self.route(target.process_id()) {
            Route::Local => {
                let outcome = self
                    .serve_local(origin, caller, &target, &payload, cancel, deadline)
                    .await;
                self.encode_outcome(&outcome)
            }
            Route::Child(handle) => {
                if handle.id() == target.process_id() && target.is_process() {
                    if let Some(outcome) = self.supervise(caller, &handle, &payload).await {
                        return self.encode_outcome(&outcome);
                    }
                }
                let channel = match handle.wait_live().await {
                    Ok(channel) => channel,
                    Err(e) => return self.encode_outcome(&Outcome::Failure(e.to_remote_error())),
                };
                self.relay(&channel, target, timeout_ms, payload, cancel).await
            }
            Route::Parent(channel) => self.relay(&channel, target, timeout_ms, payload, cancel).await,
            Route::Unknown => {
                tracing::debug!("No route to {}", target);
                let err = Error::process_not_found(target.process_id().to_string());
                self.encode_outcome(&Outcome::Failure(err.to_remote_error()))
            }
        }
    }

    /// Re-issue a request on the next hop and hand back its response bytes.
    async fn relay(
        &self,
        channel: &Channel,
        target: EndpointAddress,
        timeout_ms: Option<u64>,
        payload: Bytes,
        cancel: CancellationToken,
    ) -> Bytes {
        let mut pending = match channel.start_call(target, timeout_ms, payload).await {
            Ok(pending) => pending,
            Err(e) => return self.encode_outcome(&Outcome::Failure(e.to_remote_error())),
        };
        let first = tokio::select! {
            response = pending.response() => Some(response),
            _ = cancel.cancelled() => None,
        };
        let response = match first {
            Some(response) => response,
            None => {
                if let Err(e) = pending.cancel() {
                    tracing::debug!("Cancel of relayed call {} not sent: {}", pending.call_id(), e);
                }
                pending.response().await
            }
        };
        match response {
            Ok(bytes) => bytes,
            Err(e) => self.encode_outcome(&Outcome::Failure(e.to_remote_error())),
        }
    }

    /// Serve a request addressed to this process.
    async fn serve_local(
        &self,
        origin: &Origin,
        caller: ChannelId,
        target: &EndpointAddress,
        payload: &[u8],
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Outcome {
        let body: CallBody = match self.format().decode(payload) {
            Ok(body) => body,
            Err(e) => {
                return Outcome::Failure(
                    Error::invalid_arguments(format!("undecodable call body: {}", e))
                        .to_remote_error(),
                )
            }
        };
        match body {
            CallBody::Invoke(invocation) => {
                let Some(endpoint_id) = target.endpoint_id() else {
                    return Outcome::Failure(
                        Error::validation(format!("{} is a process, not an endpoint", target))
                            .to_remote_error(),
                    );
                };
                match self.resolve_endpoint(endpoint_id).await {
                    Ok(endpoint) => endpoint.execute(invocation, cancel, deadline, caller).await,
                    Err(e) => Outcome::Failure(e.to_remote_error()),
                }
            }
            CallBody::Control(request) => Outcome::from_result(
                self.handle_control(origin, caller, target, request)
                    .await
                    .map_err(|e| e.to_remote_error()),
            ),
        }
    }

    fn encode_outcome(&self, outcome: &Outcome) -> Bytes {
        match self.format().encode(outcome) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::error!("Cannot encode call outcome: {}", e);
                let fallback = Outcome::Failure(RemoteError::new(
                    crate::ipc::message::FailureKind::Internal,
                    format!("outcome not encodable: {}", e),
                ));
                self.format()
                    .encode(&fallback)
                    .map(Bytes::from)
                    .unwrap_or_default()
            }
        }
    }

    // =========================================================================
    // Endpoint table
    // =========================================================================

    fn register_endpoint(
        &self,
        endpoint_id: EndpointId,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<EndpointAddress> {
        if self.shutdown.is_cancelled() {
            return Err(Error::validation("node is shut down"));
        }
        let address = self.address.with_endpoint(endpoint_id.clone());
        let router: Arc<dyn NotificationRouter> = Arc::new(NodeRouter(self.this.clone()));
        {
            let mut endpoints = lock(&self.endpoints);
            if endpoints.contains_key(&endpoint_id) {
                return Err(Error::validation(format!(
                    "endpoint {} is already registered",
                    address
                )));
            }
            endpoints.insert(
                endpoint_id,
                Endpoint::new(address.clone(), dispatcher, router),
            );
        }
        self.endpoint_added.notify_waiters();
        tracing::info!("Endpoint {} registered", address);
        Ok(address)
    }

    fn destroy_endpoint(&self, endpoint_id: &EndpointId) -> Result<()> {
        let removed = lock(&self.endpoints).remove(endpoint_id);
        match removed {
            Some(endpoint) => {
                endpoint.tear_down();
                tracing::info!("Endpoint {} destroyed", endpoint.address());
                Ok(())
            }
            None => Err(Error::endpoint_not_found(
                self.address.with_endpoint(endpoint_id.clone()).to_string(),
            )),
        }
    }

    fn endpoint(&self, endpoint_id: &EndpointId) -> Option<Arc<Endpoint>> {
        lock(&self.endpoints).get(endpoint_id).cloned()
    }

    /// Find an endpoint, waiting up to the configured resolve timeout for it
    /// to be registered.
    async fn resolve_endpoint(&self, endpoint_id: &EndpointId) -> Result<Arc<Endpoint>> {
        let deadline = deadline_after(self.config.node.endpoint_resolve_timeout);
        loop {
            let added = self.endpoint_added.notified();
            if let Some(endpoint) = self.endpoint(endpoint_id) {
                return Ok(endpoint);
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                return Err(Error::endpoint_not_found(
                    self.address.with_endpoint(endpoint_id.clone()).to_string(),
                ));
            }
            tokio::select! {
                _ = added => {}
                _ = expired(deadline) => {}
            }
        }
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Deliver a notification to the process `subscriber` names.
    async fn deliver(&self, subscriber: &EndpointAddress, notification: Notification) -> Result<()> {
        match self.route(subscriber.process_id()) {
            Route::Local => self.deliver_local(notification),
            Route::Child(handle) => {
                let channel = handle.channel().ok_or_else(|| handle.lost_error())?;
                self.forward_notification(&channel, subscriber, &notification)
                    .await
            }
            Route::Parent(channel) => {
                self.forward_notification(&channel, subscriber, &notification)
                    .await
            }
            Route::Unknown => Err(Error::process_not_found(subscriber.process_id().to_string())),
        }
    }

    fn deliver_local(&self, notification: Notification) -> Result<()> {
        let subscription_id = notification.subscription_id().clone();
        let mut listeners = lock(&self.listeners);
        let delivered = listeners
            .get(&subscription_id)
            .map(|listener| listener.tx.send(notification).is_ok());
        match delivered {
            Some(true) => Ok(()),
            Some(false) => {
                listeners.remove(&subscription_id);
                Err(Error::process_not_found(format!(
                    "subscription {} is no longer listened to",
                    subscription_id
                )))
            }
            None => Err(Error::process_not_found(format!(
                "no listener for subscription {}",
                subscription_id
            ))),
        }
    }

    async fn forward_notification(
        &self,
        channel: &Channel,
        subscriber: &EndpointAddress,
        notification: &Notification,
    ) -> Result<()> {
        let payload = Bytes::from(self.format().encode(notification)?);
        channel
            .send(&Envelope::Notify {
                target: subscriber.clone(),
                payload,
            })
            .await
    }

    /// Route an inbound notify envelope.
    async fn on_notify(&self, target: EndpointAddress, payload: Bytes) {
        let result = match self.route(target.process_id()) {
            Route::Local => self
                .format()
                .decode::<Notification>(&payload)
                .and_then(|notification| self.deliver_local(notification)),
            Route::Child(handle) => match handle.channel() {
                Some(channel) => channel.send(&Envelope::Notify { target: target.clone(), payload }).await,
                None => Err(handle.lost_error()),
            },
            Route::Parent(channel) => {
                channel
                    .send(&Envelope::Notify {
                        target: target.clone(),
                        payload,
                    })
                    .await
            }
            Route::Unknown => Err(Error::process_not_found(target.process_id().to_string())),
        };
        if let Err(e) = result {
            tracing::debug!("Notification for {} dropped: {}", target, e);
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        tracing::info!("Node {} shutting down", self.address);

        let children: Vec<ProcessId> = lock(&self.processes).keys().cloned().collect();
        for child in children {
            if let Err(e) = self.destroy_child(&child).await {
                tracing::warn!("Destroying child {} failed: {}", child, e);
            }
        }

        let endpoints: Vec<Arc<Endpoint>> = lock(&self.endpoints).drain().map(|(_, ep)| ep).collect();
        for endpoint in endpoints {
            endpoint.tear_down();
        }

        for (_, token) in lock(&self.inflight).drain() {
            token.cancel();
        }
        lock(&self.listeners).clear();
        lock(&self.lost_watchers).clear();

        if let Some(parent) = self.parent.get() {
            parent
                .channel
                .close(Error::channel_closed(format!("{} shut down", self.address)))
                .await;
        }
    }
}

/// Routes endpoint event fan-out through the node that owns the endpoint.
#[derive(Debug)]
struct NodeRouter(Weak<NodeInner>);

#[async_trait::async_trait]
impl NotificationRouter for NodeRouter {
    async fn deliver(&self, subscriber: &EndpointAddress, notification: Notification) -> Result<()> {
        match self.0.upgrade() {
            Some(node) => node.deliver(subscriber, notification).await,
            None => Err(Error::process_not_found("node is gone")),
        }
    }
}

// =============================================================================
// Channel pump
// =============================================================================

/// Serve one channel until it closes.
///
/// Boxed: serving a request can create a child, which starts another pump.
pub(crate) fn pump(
    node: Weak<NodeInner>,
    channel: Channel,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    origin: Origin,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        while let Some(envelope) = inbound.recv().await {
            let Some(inner) = node.upgrade() else {
                break;
            };
            match envelope {
                Envelope::Request {
                    call_id,
                    target,
                    timeout_ms,
                    payload,
                } => {
                    let token = CancellationToken::new();
                    lock(&inner.inflight).insert((channel.id(), call_id), token.clone());
                    let channel = channel.clone();
                    let origin = origin.clone();
                    tokio::spawn(async move {
                        let response = inner
                            .dispatch(&origin, channel.id(), target, timeout_ms, payload, token)
                            .await;
                        // A cancel arriving from here on is a lookup miss.
                        lock(&inner.inflight).remove(&(channel.id(), call_id));
                        let sent = channel
                            .send(&Envelope::Response {
                                call_id,
                                payload: response,
                            })
                            .await;
                        if let Err(e) = sent {
                            tracing::debug!("Response to call {} on {} not sent: {}", call_id, channel.id(), e);
                        }
                    });
                }
                Envelope::Cancel { call_id, target } => {
                    let token = lock(&inner.inflight).get(&(channel.id(), call_id)).cloned();
                    match token {
                        Some(token) => {
                            tracing::debug!("Cancelling call {} to {}", call_id, target);
                            token.cancel();
                        }
                        None => tracing::debug!("Cancel for finished call {} ignored", call_id),
                    }
                }
                Envelope::Notify { target, payload } => {
                    tokio::spawn(async move { inner.on_notify(target, payload).await });
                }
                Envelope::Hello(hello) => {
                    tracing::warn!(
                        "Unexpected hello from {} on established channel {}",
                        hello.process_id,
                        channel.id()
                    );
                }
                Envelope::Response { call_id, .. } => {
                    tracing::warn!("Stray response {} on channel {}", call_id, channel.id());
                }
            }
        }

        let reason = channel
            .close_reason()
            .map_or_else(|| "channel closed".to_string(), |e| e.to_string());
        tracing::debug!("Channel {} from {:?} ended: {}", channel.id(), origin, reason);
        if let Some(inner) = node.upgrade() {
            inner.channel_ended(&channel, &origin, reason).await;
        }
    })
}

impl NodeInner {
    /// Drop everything tied to a closed channel.
    async fn channel_ended(&self, channel: &Channel, origin: &Origin, reason: String) {
        let id = channel.id();
        let endpoints: Vec<Arc<Endpoint>> = lock(&self.endpoints).values().cloned().collect();
        for endpoint in endpoints {
            endpoint.remove_channel_subscriptions(id);
        }
        for watchers in lock(&self.lost_watchers).values_mut() {
            watchers.retain(|_, s| s.channel != id);
        }
        lock(&self.inflight).retain(|(channel_id, _), token| {
            if *channel_id == id {
                token.cancel();
                false
            } else {
                true
            }
        });

        match origin {
            Origin::Child(process_id) => {
                let is_current =
                    |handle: &Arc<ProcessHandle>| handle.channel().is_some_and(|c| c.id() == id);
                self.child_lost(process_id, is_current, reason).await
            }
            Origin::Parent => {
                tracing::warn!("Parent channel of {} lost: {}", self.address, reason);
                self.shutdown().await;
            }
            Origin::Local => {}
        }
    }
}
