//! The Tool Invoker contract and its retry/backoff runner.
//!
//! `ToolInvoker` is a single-attempt dispatch abstraction implemented by
//! `dael-mcp` (which knows how to route a call across MCP backends,
//! built-ins, and workflow-as-tools). [`invoke_with_retry`] wraps one
//! invoker call with the timeout/backoff loop: instead of "poll until a
//! condition holds", this retries "while the error is retryable and
//! attempts remain".

use std::time::Duration;

use async_trait::async_trait;
use dael_types::{DaelError, ErrorCode, RetrySpec};
use serde_json::Value;
use tokio::time::timeout as tokio_timeout;

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call(&self, name: &str, params: Value) -> Result<Value, DaelError>;
}

/// Runs `name(params)` through `invoker`, retrying per `retry` while the
/// invoker returns a retryable error, sleeping the backoff delay between
/// attempts (capped at `retry.max_delay`), and honoring `step_timeout` on
/// each individual attempt.
pub async fn invoke_with_retry(
    invoker: &dyn ToolInvoker,
    name: &str,
    params: Value,
    retry: &RetrySpec,
    step_timeout: Option<Duration>,
) -> (Result<Value, DaelError>, u32) {
    let mut attempt = 1u32;
    loop {
        let delay = retry.delay_for_attempt(attempt);
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        let call = invoker.call(name, params.clone());
        let outcome = match step_timeout {
            Some(d) => match tokio_timeout(d, call).await {
                Ok(result) => result,
                Err(_) => Err(DaelError::new(ErrorCode::ToolTimeout, format!("tool '{name}' exceeded its step timeout"))),
            },
            None => call.await,
        };

        match outcome {
            Ok(value) => return (Ok(value), attempt),
            Err(error) if error.retryable && attempt < retry.max_attempts => {
                attempt += 1;
            }
            Err(error) => return (Err(error), attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FlakyInvoker {
        failures_before_success: u32,
        calls: AtomicU32,
        fail_with: Mutex<ErrorCode>,
    }

    #[async_trait]
    impl ToolInvoker for FlakyInvoker {
        async fn call(&self, _name: &str, _params: Value) -> Result<Value, DaelError> {
            let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
            if call_index < self.failures_before_success {
                let code = *self.fail_with.lock().unwrap();
                Err(DaelError::new(code, "transient failure"))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let invoker = FlakyInvoker {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
            fail_with: Mutex::new(ErrorCode::ToolTimeout),
        };
        let retry = RetrySpec {
            max_attempts: 5,
            initial_delay: 0.0,
            max_delay: 0.0,
            backoff_multiplier: 2.0,
        };
        let (result, attempts) = invoke_with_retry(&invoker, "demo", serde_json::json!({}), &retry, None).await;
        assert!(result.is_ok());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn stops_retrying_non_retryable_errors() {
        let invoker = FlakyInvoker {
            failures_before_success: 5,
            calls: AtomicU32::new(0),
            fail_with: Mutex::new(ErrorCode::ParamInvalid),
        };
        let retry = RetrySpec::default();
        let (result, attempts) = invoke_with_retry(&invoker, "demo", serde_json::json!({}), &retry, None).await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn exhausts_max_attempts_on_persistent_retryable_error() {
        let invoker = FlakyInvoker {
            failures_before_success: 100,
            calls: AtomicU32::new(0),
            fail_with: Mutex::new(ErrorCode::ToolTimeout),
        };
        let retry = RetrySpec {
            max_attempts: 3,
            initial_delay: 0.0,
            max_delay: 0.0,
            backoff_multiplier: 1.0,
        };
        let (result, attempts) = invoke_with_retry(&invoker, "demo", serde_json::json!({}), &retry, None).await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }
}
