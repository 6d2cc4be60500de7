//! Built-in interfaces every worker can instantiate.

use serde_json::{json, Value};
use std::time::Duration;

use crate::dispatch::{EventEmitter, FnDispatcher, InterfaceBuilder};
use crate::ipc::message::{FailureKind, RemoteError};

pub const DIAGNOSTICS_INTERFACE: &str = "diagnostics";

/// Event raised by `Pulse`.
pub const HEARTBEAT_EVENT: &str = "Heartbeat";

/// Type name of failures raised by `Fail`.
pub const DIAGNOSTICS_FAILURE: &str = "DiagnosticsFailure";

fn invalid(message: impl Into<String>) -> RemoteError {
    RemoteError::new(FailureKind::InvalidArguments, message)
}

/// Liveness and plumbing checks.
///
/// | method          | behaviour                                      |
/// |-----------------|------------------------------------------------|
/// | `Echo(x)`       | returns `x`                                    |
/// | `Sleep(ms)`     | sleeps, cancellable; returns `ms`              |
/// | `Fail(message)` | fails with type `DiagnosticsFailure`           |
/// | `ProcessInfo()` | host, process id, OS pid and endpoint address  |
/// | `Pulse(n)`      | fires `Heartbeat(i)` for `i in 0..n`           |
pub fn diagnostics() -> FnDispatcher {
    let events = EventEmitter::new();
    let pulse = events.clone();

    InterfaceBuilder::new(DIAGNOSTICS_INTERFACE)
        .method("Echo", 1, |mut args, _ctx| async move { Ok(args.remove(0)) })
        .cancellable_method("Sleep", 1, |args, ctx| async move {
            let ms = args[0]
                .as_u64()
                .ok_or_else(|| invalid("Sleep expects a non-negative integer"))?;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!(ms)),
                // The outcome is already Cancelled by the time this is observed.
                _ = ctx.cancelled() => Ok(Value::Null),
            }
        })
        .method("Fail", 1, |args, _ctx| async move {
            let message = match &args[0] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Err(RemoteError::application(DIAGNOSTICS_FAILURE, message))
        })
        .method("ProcessInfo", 0, |_args, ctx| async move {
            Ok(json!({
                "host": ctx.endpoint.host(),
                "process_id": ctx.endpoint.process_id().as_str(),
                "os_pid": std::process::id(),
                "endpoint": ctx.endpoint.to_string(),
            }))
        })
        .method("Pulse", 1, move |args, _ctx| {
            let events = pulse.clone();
            async move {
                let n = args[0]
                    .as_u64()
                    .ok_or_else(|| invalid("Pulse expects a non-negative integer"))?;
                let mut delivered = 0u64;
                for i in 0..n {
                    if events.emit(HEARTBEAT_EVENT, vec![json!(i)]) {
                        delivered += 1;
                    }
                }
                Ok(json!(delivered))
            }
        })
        .event(HEARTBEAT_EVENT)
        .build(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CallContext, Dispatcher, EventSink};
    use crate::types::ChannelId;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> CallContext {
        CallContext {
            endpoint: "localhost/P1/diag".parse().unwrap(),
            caller: ChannelId::LOCAL,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    fn id(d: &FnDispatcher, name: &str) -> u32 {
        d.descriptor().method_by_name(name).unwrap().id
    }

    #[tokio::test]
    async fn test_fail_carries_type_name() {
        let d = diagnostics();
        let err = d
            .invoke(id(&d, "Fail"), vec![json!("nope")], ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Application);
        assert_eq!(err.type_name, DIAGNOSTICS_FAILURE);
        assert_eq!(err.message, "nope");
    }

    #[tokio::test]
    async fn test_process_info_reports_address() {
        let d = diagnostics();
        let info = d.invoke(id(&d, "ProcessInfo"), vec![], ctx()).await.unwrap();
        assert_eq!(info["process_id"], json!("P1"));
        assert_eq!(info["endpoint"], json!("localhost/P1/diag"));
        assert_eq!(info["os_pid"], json!(std::process::id()));
    }

    #[tokio::test]
    async fn test_pulse_fires_only_when_hooked() {
        let d = diagnostics();
        let unheard = d.invoke(id(&d, "Pulse"), vec![json!(3)], ctx()).await.unwrap();
        assert_eq!(unheard, json!(0));

        let beats = Arc::new(Mutex::new(Vec::new()));
        let seen = beats.clone();
        d.hook(
            HEARTBEAT_EVENT,
            EventSink::new(move |args| seen.lock().unwrap().extend(args)),
        )
        .unwrap();
        let heard = d.invoke(id(&d, "Pulse"), vec![json!(3)], ctx()).await.unwrap();
        assert_eq!(heard, json!(3));
        assert_eq!(*beats.lock().unwrap(), vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_sleep_rejects_bad_argument() {
        let d = diagnostics();
        let err = d
            .invoke(id(&d, "Sleep"), vec![json!("soon")], ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidArguments);
    }
}
