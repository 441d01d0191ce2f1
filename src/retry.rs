// ===============================
// src/retry.rs (bounded retry for order submission)
// ===============================
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first one included. Never below 1.
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts: attempts.max(1), delay }
    }
}

/// Failure after the policy gave up: last error and how many attempts were made.
#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, `retryable` says stop, or attempts run out.
/// Fixed delay between attempts, no backoff: the next tick is the real retry.
pub async fn with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= policy.attempts || !retryable(&e) {
                    return Err(Exhausted { error: e, attempts: attempt });
                }
                warn!(%what, attempt, max = policy.attempts, error = %e, "attempt failed, retrying");
                sleep(policy.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(n: u32) -> RetryPolicy { RetryPolicy::new(n, Duration::from_millis(1)) }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, Exhausted<String>> = with_retry(policy(3), "t", |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n < 3 { Err(format!("fail {n}")) } else { Ok(n) } }
        })
        .await;
        assert_eq!(out.unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let out: Result<(), Exhausted<String>> = with_retry(policy(2), "t", |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;
        assert_eq!(out.unwrap_err().attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<(), Exhausted<String>> = with_retry(policy(5), "t", |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("fatal".to_string()) }
        })
        .await;
        assert_eq!(out.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts, 1);
    }
}
