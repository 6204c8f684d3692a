//! Retry combinator
//!
//! Re-runs an async operation while a caller-supplied predicate says the
//! failure is worth another attempt, sleeping a fixed backoff in between.

use std::future::Future;
use std::time::Duration;

/// Attempt budget and spacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Fixed delay before each retry
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// Run `operation(attempt)` (1-based) until it succeeds, returns a
/// non-retryable error, or the attempt budget runs out. The last error is
/// returned unchanged.
pub async fn with_retry<T, E, F, Fut, P>(
    policy: RetryPolicy,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && is_retryable(&e) => {
                tracing::warn!(
                    target: "xbridge_wallet::retry",
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "retryable failure, backing off"
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_succeeds_after_retryable_failures() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = with_retry(fast(3), |_| true, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("conflict on attempt {}", attempt))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_on_non_retryable() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = with_retry(
            fast(3),
            |e: &String| e.contains("conflict"),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("insufficient funds".to_string()) }
            },
        )
        .await;

        assert_eq!(result, Err("insufficient funds".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = with_retry(fast(3), |_| true, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("conflict {}", attempt)) }
        })
        .await;

        assert_eq!(result, Err("conflict 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
