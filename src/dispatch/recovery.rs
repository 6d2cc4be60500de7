//! Panic recovery for endpoint code.
//!
//! Endpoint methods and event hooks are application code. A panic in one of
//! them becomes a failed call, never a dead channel or node.

use futures::FutureExt;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Once;
use tokio::task::JoinError;

use crate::ipc::message::{FailureKind, RemoteError};
use crate::types::{Error, Result};

/// Type name reported for failures caused by a panic.
pub const PANIC_TYPE_NAME: &str = "panic";

thread_local! {
    /// Where the last panic on this thread happened, until someone takes it.
    static PANIC_SITE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook recording the panic location (and a backtrace when
/// `RUST_BACKTRACE` enables one) for the panicking thread.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let mut site = match info.location() {
                Some(location) => format!("panicked at {}", location),
                None => "panicked at an unknown location".to_string(),
            };
            let backtrace = Backtrace::capture();
            if backtrace.status() == BacktraceStatus::Captured {
                site.push_str(&format!("\n{}", backtrace));
            }
            PANIC_SITE.with(|cell| *cell.borrow_mut() = Some(site));
            previous(info);
        }));
    });
}

/// Drive a method future, turning a panic into an application failure whose
/// remote stack is the panic site.
pub async fn recover_panic<F, T>(
    future: F,
    operation_name: &str,
) -> std::result::Result<T, RemoteError>
where
    F: Future<Output = std::result::Result<T, RemoteError>>,
{
    install_panic_hook();
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(panic_payload.as_ref());
            let site = PANIC_SITE.with(|cell| cell.borrow_mut().take());
            tracing::error!(
                "async_panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );
            let failure = RemoteError::application(PANIC_TYPE_NAME, panic_msg);
            Err(match site {
                Some(site) => failure.with_stack(site),
                None => failure,
            })
        }
    }
}

/// Execute a function with panic recovery.
///
/// If the function panics, the panic is captured, logged, and converted
/// to an error.
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(panic_payload.as_ref());
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );

            Err(Error::internal(format!(
                "Panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Convert a failed method task into the failure delivered to the caller.
pub fn join_failure(err: JoinError, operation_name: &str) -> RemoteError {
    if err.is_panic() {
        let panic_msg = extract_panic_message(err.into_panic().as_ref());
        tracing::error!(
            "async_panic_recovered: operation={}, panic={}",
            operation_name,
            panic_msg
        );
        RemoteError::application(PANIC_TYPE_NAME, panic_msg)
    } else {
        RemoteError::new(
            FailureKind::Internal,
            format!("{} was aborted", operation_name),
        )
    }
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_recovery_success() {
        let result = with_recovery(|| Ok(42), "test_operation");
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_with_recovery_error() {
        let result: Result<()> = with_recovery(
            || Err(Error::validation("test error".to_string())),
            "test_operation",
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_with_recovery_panic() {
        let result: Result<()> = with_recovery(|| panic!("hook exploded"), "hook");
        match result {
            Err(Error::Internal(msg)) => assert!(msg.contains("hook exploded")),
            other => panic!("expected internal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_failure_reports_panic_message() {
        let task = tokio::spawn(async { panic!("method exploded") });
        let err = task.await.unwrap_err();
        let remote = join_failure(err, "Echo");
        assert_eq!(remote.kind, FailureKind::Application);
        assert_eq!(remote.type_name, PANIC_TYPE_NAME);
        assert_eq!(remote.message, "method exploded");
    }

    async fn exploding_method() -> std::result::Result<(), RemoteError> {
        panic!("method exploded")
    }

    #[tokio::test]
    async fn test_recovered_panic_carries_its_site() {
        let remote = recover_panic(exploding_method(), "Echo").await.unwrap_err();
        assert_eq!(remote.kind, FailureKind::Application);
        assert_eq!(remote.type_name, PANIC_TYPE_NAME);
        assert_eq!(remote.message, "method exploded");
        let stack = remote.remote_stack.unwrap();
        assert!(stack.contains("recovery.rs"), "stack: {stack}");
    }

    #[tokio::test]
    async fn test_recover_panic_passes_results_through() {
        let ok = recover_panic(async { Ok::<_, RemoteError>(7) }, "Add").await;
        assert_eq!(ok.unwrap(), 7);
        let failed = recover_panic(
            async { Err::<(), _>(RemoteError::application("ValueError", "bad")) },
            "Add",
        )
        .await
        .unwrap_err();
        assert_eq!(failed.remote_stack, None);
    }

    #[tokio::test]
    async fn test_join_failure_for_aborted_task() {
        let task = tokio::spawn(std::future::pending::<()>());
        task.abort();
        let remote = join_failure(task.await.unwrap_err(), "Sleep");
        assert_eq!(remote.kind, FailureKind::Internal);
    }
}
