//! Caller-side handles.
//!
//! Thin typed wrappers that build call bodies and hand them to the owning
//! [`Node`], which routes them like any other request.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};

use crate::address::EndpointAddress;
use crate::broker::{CallOptions, Node, PROCESS_LOST_EVENT};
use crate::dispatch::InterfaceDescriptor;
use crate::ipc::message::{
    CallBody, ControlRequest, CreateOutcome, Invocation, MethodRef, Notification,
    ProcessCreationInfo,
};
use crate::types::{EndpointId, Error, ProcessId, Result, SubscriptionId};

/// An endpoint anywhere in the tree.
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    node: Node,
    address: EndpointAddress,
    /// Fetched on the first by-name call, shared by clones.
    methods: Arc<OnceCell<InterfaceDescriptor>>,
}

impl RemoteEndpoint {
    pub(crate) fn new(node: Node, address: EndpointAddress) -> Self {
        Self {
            node,
            address,
            methods: Arc::new(OnceCell::new()),
        }
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Call a method by name.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with(Invocation::by_name(method, args), CallOptions::default())
            .await
    }

    /// Call a method. A by-name invocation is sent by id once the
    /// endpoint's method table is known.
    pub async fn call_with(&self, mut invocation: Invocation, options: CallOptions) -> Result<Value> {
        let endpoint_id = self.endpoint_id()?;
        if matches!(invocation.method, MethodRef::Name(_)) {
            self.describe_with(endpoint_id, options.clone())
                .await?
                .bind(&mut invocation.method);
        }
        self.node
            .call(self.address.clone(), &CallBody::Invoke(invocation), options)
            .await
    }

    /// Methods and events of the endpoint's interface.
    pub async fn describe(&self) -> Result<&InterfaceDescriptor> {
        self.describe_with(self.endpoint_id()?, CallOptions::default())
            .await
    }

    async fn describe_with(
        &self,
        endpoint_id: &EndpointId,
        options: CallOptions,
    ) -> Result<&InterfaceDescriptor> {
        self.methods
            .get_or_try_init(|| async move {
                let request = ControlRequest::DescribeEndpoint {
                    endpoint_id: endpoint_id.clone(),
                };
                let described = self
                    .node
                    .call(self.address.to_process(), &CallBody::Control(request), options)
                    .await?;
                tracing::trace!("Fetched method table of {}", self.address);
                Ok::<_, Error>(serde_json::from_value(described)?)
            })
            .await
    }

    fn endpoint_id(&self) -> Result<&EndpointId> {
        self.address.endpoint_id().ok_or_else(|| {
            Error::validation(format!("{} is a process, not an endpoint", self.address))
        })
    }

    /// Subscribe to one of the endpoint's events.
    pub async fn subscribe(&self, event: &str) -> Result<Subscription> {
        self.node.subscribe(self.address.clone(), event).await
    }
}

/// A process anywhere in the tree.
#[derive(Debug, Clone)]
pub struct RemoteProcess {
    node: Node,
    address: EndpointAddress,
}

impl RemoteProcess {
    pub(crate) fn new(node: Node, address: EndpointAddress) -> Self {
        Self { node, address }
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn process_id(&self) -> &ProcessId {
        self.address.process_id()
    }

    /// Handle to an endpoint of this process. Nothing is checked until it is called.
    pub fn endpoint(&self, endpoint_id: EndpointId) -> RemoteEndpoint {
        RemoteEndpoint::new(self.node.clone(), self.address.with_endpoint(endpoint_id))
    }

    pub async fn create_endpoint(
        &self,
        endpoint_id: EndpointId,
        interface: &str,
    ) -> Result<RemoteEndpoint> {
        let created = self
            .control(ControlRequest::CreateEndpoint {
                endpoint_id,
                interface: interface.to_string(),
            })
            .await?;
        let address = created
            .as_str()
            .ok_or_else(|| Error::internal("create-endpoint returned no address"))?
            .parse()?;
        Ok(RemoteEndpoint::new(self.node.clone(), address))
    }

    /// Fails with [`Error::EndpointNotFound`] if there is no such endpoint.
    pub async fn destroy_endpoint(&self, endpoint_id: EndpointId) -> Result<()> {
        self.control(ControlRequest::DestroyEndpoint { endpoint_id })
            .await
            .map(|_| ())
    }

    /// Create a child of this process.
    pub async fn create_process(
        &self,
        info: ProcessCreationInfo,
        must_not_exist: bool,
    ) -> Result<CreateOutcome> {
        let outcome = self
            .control(ControlRequest::CreateProcess {
                info,
                must_not_exist,
            })
            .await?;
        Ok(serde_json::from_value(outcome)?)
    }

    /// Destroy a child of this process.
    pub async fn destroy_process(&self, process_id: ProcessId) -> Result<bool> {
        let destroyed = self
            .control(ControlRequest::DestroyProcess { process_id })
            .await?;
        Ok(destroyed.as_bool().unwrap_or(false))
    }

    /// Be told when this process is lost or destroyed.
    pub async fn on_lost(&self) -> Result<Subscription> {
        self.node
            .subscribe(self.address.clone(), PROCESS_LOST_EVENT)
            .await
    }

    async fn control(&self, request: ControlRequest) -> Result<Value> {
        self.node
            .call(
                self.address.clone(),
                &CallBody::Control(request),
                CallOptions::default(),
            )
            .await
    }
}

/// A live event subscription. Dropping it stops local delivery; call
/// [`Subscription::unsubscribe`] to also unhook the source.
#[derive(Debug)]
pub struct Subscription {
    node: Node,
    target: EndpointAddress,
    event: String,
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    pub(crate) fn new(
        node: Node,
        target: EndpointAddress,
        event: String,
        id: SubscriptionId,
        rx: mpsc::UnboundedReceiver<Notification>,
    ) -> Self {
        Self {
            node,
            target,
            event,
            id,
            rx,
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn target(&self) -> &EndpointAddress {
        &self.target
    }

    /// Next notification, or `None` once the node shut down.
    pub async fn next(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Remove the subscription at its source.
    pub async fn unsubscribe(self) -> Result<bool> {
        self.node
            .unsubscribe(self.target, &self.event, &self.id)
            .await
    }
}
