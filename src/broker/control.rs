//! Control surface: process and endpoint lifecycle, subscriptions, routes.

use bytes::Bytes;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{lock, pump, NodeInner, Origin, PROCESS_LOST_EVENT};
use crate::address::EndpointAddress;
use crate::broker::process::{ProcessHandle, ProcessState};
use crate::dispatch::endpoint::Subscriber;
use crate::ipc::message::{
    CallBody, ControlRequest, CreateOutcome, Notification, Outcome, ProcessCreationInfo,
};
use crate::launcher::{ChildProcess, LaunchPhase, Launched};
use crate::types::{ChannelId, Error, ProcessId, Result, SubscriptionId};

impl NodeInner {
    /// Execute a control request addressed to this process.
    pub(super) async fn handle_control(
        &self,
        origin: &Origin,
        caller: ChannelId,
        target: &EndpointAddress,
        request: ControlRequest,
    ) -> Result<Value> {
        if let ControlRequest::ChangeEventSubscription {
            event,
            subscription_id,
            subscriber,
            subscribe,
        } = request
        {
            let subscriber = Subscriber {
                address: subscriber,
                channel: caller,
            };
            let changed = match target.endpoint_id() {
                Some(endpoint_id) => {
                    let endpoint = self.resolve_endpoint(endpoint_id).await?;
                    if subscribe {
                        endpoint.add_subscription(&event, subscription_id, subscriber)?
                    } else {
                        endpoint.remove_subscription(&event, &subscription_id)?
                    }
                }
                None => self.change_lost_subscription(
                    target.process_id(),
                    &event,
                    subscription_id,
                    subscriber,
                    subscribe,
                )?,
            };
            return Ok(Value::Bool(changed));
        }

        if !target.is_process() {
            return Err(Error::validation(format!(
                "control requests are addressed to a process, not {}",
                target
            )));
        }
        match request {
            ControlRequest::CreateProcess {
                info,
                must_not_exist,
            } => {
                let outcome = self.create_child(info, must_not_exist).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            ControlRequest::DestroyProcess { process_id } => {
                if process_id == self.identity.process_id {
                    return Err(Error::validation("a process cannot destroy itself"));
                }
                Ok(Value::Bool(self.destroy_child(&process_id).await?))
            }
            ControlRequest::CreateEndpoint {
                endpoint_id,
                interface,
            } => {
                let dispatcher = self.factories.create(&interface)?;
                let address = self.register_endpoint(endpoint_id, dispatcher)?;
                Ok(Value::String(address.to_string()))
            }
            ControlRequest::DestroyEndpoint { endpoint_id } => {
                self.destroy_endpoint(&endpoint_id)?;
                Ok(Value::Null)
            }
            ControlRequest::DescribeEndpoint { endpoint_id } => {
                let endpoint = self.resolve_endpoint(&endpoint_id).await?;
                Ok(serde_json::to_value(endpoint.descriptor())?)
            }
            ControlRequest::UpdateRoute {
                process_id,
                reachable,
            } => {
                let Origin::Child(via) = origin else {
                    return Err(Error::validation("route updates are only accepted from children"));
                };
                self.update_route(via, process_id, reachable).await;
                Ok(Value::Null)
            }
            ControlRequest::ChangeEventSubscription { .. } => {
                Err(Error::internal("subscription change fell through"))
            }
        }
    }

    /// Lifecycle requests about a direct child are answered by its
    /// supervisor. Returns `None` for anything that should be relayed.
    pub(super) async fn supervise(
        &self,
        caller: ChannelId,
        handle: &Arc<ProcessHandle>,
        payload: &[u8],
    ) -> Option<Outcome> {
        let Ok(CallBody::Control(request)) = self.format().decode::<CallBody>(payload) else {
            return None;
        };
        let result = match request {
            ControlRequest::DestroyProcess { process_id } if &process_id == handle.id() => {
                self.destroy_child(&process_id).await.map(Value::Bool)
            }
            ControlRequest::ChangeEventSubscription {
                event,
                subscription_id,
                subscriber,
                subscribe,
            } if event.eq_ignore_ascii_case(PROCESS_LOST_EVENT) => self
                .change_lost_subscription(
                    handle.id(),
                    &event,
                    subscription_id,
                    Subscriber {
                        address: subscriber,
                        channel: caller,
                    },
                    subscribe,
                )
                .map(Value::Bool),
            _ => return None,
        };
        Some(Outcome::from_result(result.map_err(|e| e.to_remote_error())))
    }

    fn change_lost_subscription(
        &self,
        process_id: &ProcessId,
        event: &str,
        subscription_id: SubscriptionId,
        subscriber: Subscriber,
        subscribe: bool,
    ) -> Result<bool> {
        if !event.eq_ignore_ascii_case(PROCESS_LOST_EVENT) {
            return Err(Error::method_not_found(format!(
                "processes only raise {}, not {}",
                PROCESS_LOST_EVENT, event
            )));
        }
        let mut watchers = lock(&self.lost_watchers);
        if !subscribe {
            let removed = watchers
                .get_mut(process_id)
                .is_some_and(|subs| subs.remove(&subscription_id).is_some());
            if watchers.get(process_id).is_some_and(|subs| subs.is_empty()) {
                watchers.remove(process_id);
            }
            return Ok(removed);
        }
        if process_id != &self.identity.process_id
            && !lock(&self.processes).contains_key(process_id)
        {
            return Err(Error::process_not_found(process_id.to_string()));
        }
        let subs = watchers.entry(process_id.clone()).or_default();
        if subs.contains_key(&subscription_id) {
            return Ok(false);
        }
        subs.insert(subscription_id, subscriber);
        Ok(true)
    }

    // =========================================================================
    // Children
    // =========================================================================

    /// Create a direct child. Exactly one of several concurrent requests for
    /// the same id inserts the handle and spawns.
    pub(super) async fn create_child(
        &self,
        info: ProcessCreationInfo,
        must_not_exist: bool,
    ) -> Result<CreateOutcome> {
        let process_id = info.process_id.clone();
        if self.shutdown.is_cancelled() {
            return Err(Error::validation("node is shut down"));
        }
        if process_id == self.identity.process_id || process_id.is_root() {
            return Err(Error::already_exists(process_id.to_string()));
        }

        let claimed = {
            let mut processes = lock(&self.processes);
            match processes.get(&process_id) {
                Some(existing) => Err(Some(existing.clone())),
                None if lock(&self.descendants).contains_key(&process_id) => Err(None),
                None => {
                    let handle = Arc::new(ProcessHandle::new(info.clone()));
                    processes.insert(process_id.clone(), handle.clone());
                    Ok(handle)
                }
            }
        };
        let handle = match claimed {
            Ok(handle) => handle,
            Err(_) if must_not_exist => return Err(Error::already_exists(process_id.to_string())),
            Err(Some(existing)) => {
                existing.wait_live().await?;
                return Ok(CreateOutcome::AlreadyExists);
            }
            Err(None) => return Ok(CreateOutcome::AlreadyExists),
        };

        let launched = self
            .launcher
            .launch(&info, &handle.launch_cancel, |phase| {
                handle.transition(match phase {
                    LaunchPhase::Spawning => ProcessState::Spawning,
                    LaunchPhase::Handshaking => ProcessState::Handshaking,
                });
            })
            .await;

        let Launched {
            channel,
            inbound,
            peer,
            mut child,
        } = match launched {
            Ok(launched) => launched,
            Err(e) => {
                if handle.end(ProcessState::Lost, e.to_string()) {
                    let is_ours = {
                        let mut processes = lock(&self.processes);
                        let is_ours = processes
                            .get(&process_id)
                            .is_some_and(|current| Arc::ptr_eq(current, &handle));
                        if is_ours {
                            processes.remove(&process_id);
                        }
                        is_ours
                    };
                    if is_ours {
                        self.notify_lost(&process_id, &e.to_string()).await;
                    }
                    return Err(e);
                }
                // Destroyed while launching.
                return Err(handle.lost_error());
            }
        };

        if !handle.go_live(channel.clone(), peer, child.os_pid()) {
            channel.close(handle.lost_error()).await;
            child.kill().await;
            return Err(handle.lost_error());
        }
        tokio::spawn(pump(
            self.this.clone(),
            channel,
            inbound,
            Origin::Child(process_id.clone()),
        ));
        tokio::spawn(monitor(
            self.this.clone(),
            handle.clone(),
            child,
            self.config.launcher.kill_grace,
        ));
        self.announce_route(&process_id, true).await;
        tracing::info!(
            "Child {} is live (kind={}, os_pid={:?})",
            process_id,
            handle.info().kind,
            handle.os_pid()
        );
        Ok(CreateOutcome::CreatedNew)
    }

    /// Destroy a direct child. Returns `false` if there is none with that id.
    pub(super) async fn destroy_child(&self, process_id: &ProcessId) -> Result<bool> {
        let removed = lock(&self.processes).remove(process_id);
        let Some(handle) = removed else {
            return Ok(false);
        };
        handle.end(
            ProcessState::Destroyed,
            format!("destroyed by {}", self.identity.process_id),
        );
        tracing::info!("Destroying child {}", process_id);
        self.finish_child(
            &handle,
            Error::process_lost(format!("process {} destroyed", process_id)),
        )
        .await;
        Ok(true)
    }

    /// A child went away on its own: exited, or its channel failed.
    ///
    /// `is_current` guards against a stale report about an earlier
    /// incarnation of the same id.
    pub(super) async fn child_lost<F>(&self, process_id: &ProcessId, is_current: F, reason: String)
    where
        F: Fn(&Arc<ProcessHandle>) -> bool,
    {
        let removed = {
            let mut processes = lock(&self.processes);
            if processes.get(process_id).is_some_and(&is_current) {
                processes.remove(process_id)
            } else {
                None
            }
        };
        let Some(handle) = removed else {
            return;
        };
        if handle.end(ProcessState::Lost, reason.clone()) {
            tracing::warn!("Child {} lost: {}", process_id, reason);
        }
        self.finish_child(&handle, Error::process_lost(format!("{}: {}", process_id, reason)))
            .await;
    }

    /// Release everything a removed child held and tell whoever cares.
    async fn finish_child(&self, handle: &Arc<ProcessHandle>, cause: Error) {
        let process_id = handle.id().clone();
        handle.launch_cancel.cancel();
        if let Some(channel) = handle.channel() {
            // Fails every call still relayed to the child.
            channel.close(cause).await;
        }
        handle.stop.cancel();

        let orphaned: Vec<ProcessId> = {
            let mut descendants = lock(&self.descendants);
            let orphaned: Vec<ProcessId> = descendants
                .iter()
                .filter(|(_, via)| **via == process_id)
                .map(|(descendant, _)| descendant.clone())
                .collect();
            for descendant in &orphaned {
                descendants.remove(descendant);
            }
            orphaned
        };

        let reason = handle.end_reason().unwrap_or("ended").to_string();
        self.notify_lost(&process_id, &reason).await;
        self.announce_route(&process_id, false).await;
        for descendant in orphaned {
            self.announce_route(&descendant, false).await;
        }
    }

    async fn notify_lost(&self, process_id: &ProcessId, reason: &str) {
        let watchers = lock(&self.lost_watchers)
            .remove(process_id)
            .unwrap_or_default();
        let process = EndpointAddress::process(self.address.host(), process_id.clone());
        for (subscription_id, subscriber) in watchers {
            let notification = Notification::ProcessLost {
                subscription_id,
                process: process.clone(),
                reason: reason.to_string(),
            };
            if let Err(e) = self.deliver(&subscriber.address, notification).await {
                tracing::debug!(
                    "Process-lost notice for {} to {} dropped: {}",
                    process_id,
                    subscriber.address,
                    e
                );
            }
        }
    }

    // =========================================================================
    // Routes
    // =========================================================================

    async fn update_route(&self, via: &ProcessId, process_id: ProcessId, reachable: bool) {
        if process_id == self.identity.process_id {
            return;
        }
        {
            let mut descendants = lock(&self.descendants);
            if reachable {
                descendants.insert(process_id.clone(), via.clone());
            } else if descendants.get(&process_id) == Some(via) {
                descendants.remove(&process_id);
            }
        }
        tracing::debug!(
            "Route to {} via {}: {}",
            process_id,
            via,
            if reachable { "added" } else { "removed" }
        );
        self.announce_route(&process_id, reachable).await;
    }

    /// Tell the parent (if any) that `process_id` is reachable through us.
    async fn announce_route(&self, process_id: &ProcessId, reachable: bool) {
        let Some(parent) = self.parent.get() else {
            return;
        };
        let body = CallBody::Control(ControlRequest::UpdateRoute {
            process_id: process_id.clone(),
            reachable,
        });
        let payload = match self.format().encode(&body) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                tracing::error!("Cannot encode route update: {}", e);
                return;
            }
        };
        let response = match parent
            .channel
            .start_call(parent.address.clone(), None, payload)
            .await
        {
            Ok(mut pending) => pending.response().await,
            Err(e) => Err(e),
        };
        let result = response
            .and_then(|bytes| self.format().decode::<Outcome>(&bytes))
            .and_then(Outcome::into_result);
        if let Err(e) = result {
            tracing::debug!("Route update for {} not acknowledged: {}", process_id, e);
        }
    }
}

/// Own a live child until it exits or is told to stop.
async fn monitor(
    node: Weak<NodeInner>,
    handle: Arc<ProcessHandle>,
    mut child: ChildProcess,
    kill_grace: Duration,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = handle.stop.cancelled() => None,
    };
    match exited {
        Some(status) => {
            if let Some(node) = node.upgrade() {
                let expected = handle.clone();
                node.child_lost(
                    handle.id(),
                    move |current| Arc::ptr_eq(current, &expected),
                    format!("exited ({})", status),
                )
                .await;
            }
        }
        None => {
            child.request_shutdown();
            match tokio::time::timeout(kill_grace, child.wait()).await {
                Ok(status) => tracing::debug!("Child {} stopped ({})", handle.id(), status),
                Err(_) => {
                    tracing::warn!(
                        "Child {} did not stop within {:?}, killing",
                        handle.id(),
                        kill_grace
                    );
                    child.kill().await;
                }
            }
        }
    }
}
