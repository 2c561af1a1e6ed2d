//! Timeout and bounded exponential backoff for backend calls.
//!
//! Embedding and LLM backends are the only operations that cross a network
//! boundary. Every such call runs through [`with_retry`]:
//!
//! - each attempt is bounded by `timeout`; an attempt that exceeds it ends
//!   the call with [`RagError::BackendTimeout`] and is not retried
//! - errors for which [`RagError::is_transient`] holds (network errors,
//!   HTTP 429, 5xx) are retried up to `max_retries` times
//! - any other error is returned immediately
//!
//! Backoff doubles per attempt from `backoff`, capped at 32× the base:
//! 1s, 2s, 4s, 8s, 16s, 32s, 32s, ... for the default one second base.

use std::future::Future;
use std::time::Duration;

use catalog_rag_core::{RagError, Result};
use tracing::warn;

/// How a backend call is bounded and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Delay before the first retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(30),
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * (1u32 << attempt.saturating_sub(1).min(5))
    }
}

/// Run `call` under `policy`, labelling timeouts and logs with `operation`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!(
                    operation,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient backend error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(operation, timeout = ?policy.timeout, "backend call timed out");
                return Err(RagError::BackendTimeout {
                    operation: operation.to_string(),
                    timeout: policy.timeout,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(6), Duration::from_millis(3200));
        assert_eq!(p.delay(9), Duration::from_millis(3200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&policy(3), "embed", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RagError::embedding("test", "connection refused"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&policy(2), "generate", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RagError::llm("test", "down"))
        })
        .await;
        assert!(matches!(result, Err(RagError::LlmBackend { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&policy(5), "generate", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RagError::LlmBackend {
                provider: "test".into(),
                status: Some(401),
                message: "bad key".into(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&policy(5), "generate", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        match result {
            Err(RagError::BackendTimeout { operation, timeout }) => {
                assert_eq!(operation, "generate");
                assert_eq!(timeout, Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
