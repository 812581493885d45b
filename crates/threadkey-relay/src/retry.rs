//! Bounded retry with backoff.
//!
//! Wraps every call into the offline mailbox and across RPC bridges. A
//! policy of `retries` and `delays` yields `max(retries + 1, delays.len() + 1)`
//! attempts; before attempt `i + 1` the executor waits
//! `delays[min(i - 1, delays.len() - 1)]`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shutdown::ShutdownSignal;

/// Retry budget and backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub retries: u32,
    pub delays_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            delays_ms: vec![500, 1500],
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            retries,
            delays_ms: delays.into_iter().map(|d| d.as_millis() as u64).collect(),
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            retries: 0,
            delays_ms: Vec::new(),
        }
    }

    /// Total number of attempts this policy allows.
    pub fn total_attempts(&self) -> usize {
        (self.retries as usize + 1).max(self.delays_ms.len() + 1)
    }

    /// Delay between attempt `attempt` (1-based) and the next one.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        if attempt == 0 || self.delays_ms.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempt - 1).min(self.delays_ms.len() - 1);
        Duration::from_millis(self.delays_ms[idx])
    }
}

/// Outcome of a cancellable retry loop that did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error.
    Exhausted(E),
    /// The shutdown signal fired first.
    Cancelled,
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. A warning is logged before each
/// retry, never after the final failure, whose error is returned.
pub async fn retry_async<T, E, F, Fut>(label: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let total = policy.total_attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= total => return Err(err),
            Err(err) => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    operation = label,
                    attempt,
                    total,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// [`retry_async`] that gives up as soon as `signal` fires.
pub async fn retry_until_closed<T, E, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    signal: &ShutdownSignal,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let total = policy.total_attempts();
    let mut attempt = 1;
    loop {
        if signal.is_triggered() {
            return Err(RetryError::Cancelled);
        }

        let outcome = tokio::select! {
            outcome = op(attempt) => outcome,
            _ = signal.wait() => return Err(RetryError::Cancelled),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= total => return Err(RetryError::Exhausted(err)),
            Err(err) => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    operation = label,
                    attempt,
                    total,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = signal.wait() => return Err(RetryError::Cancelled),
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn flaky(fail_times: usize, calls: Arc<AtomicUsize>) -> impl FnMut(usize) -> std::future::Ready<Result<u32, String>> {
        move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < fail_times {
                Err(format!("failure {n}"))
            } else {
                Ok(7)
            })
        }
    }

    #[test]
    fn test_total_attempts() {
        assert_eq!(RetryPolicy::new(2, []).total_attempts(), 3);
        assert_eq!(
            RetryPolicy::new(0, [Duration::from_millis(1); 4]).total_attempts(),
            5
        );
        assert_eq!(RetryPolicy::none().total_attempts(), 1);
    }

    #[test]
    fn test_delay_schedule_clamps_to_last() {
        let policy = RetryPolicy::new(5, [Duration::from_millis(10), Duration::from_millis(20)]);
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(5), Duration::from_millis(20));
        assert_eq!(RetryPolicy::new(3, []).delay_after(1), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_n_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(0, [Duration::from_millis(10); 3]);

        let value = retry_async("flaky", &policy, flaky(3, calls.clone()))
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(1, [Duration::from_millis(10), Duration::from_millis(20)]);
        let start = tokio::time::Instant::now();

        let err = retry_async("always", &policy, flaky(usize::MAX, calls.clone()))
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err, "failure 2");
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_by_shutdown() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(0, [Duration::from_secs(60); 5]);

        let task = {
            let calls = calls.clone();
            tokio::spawn(async move {
                retry_until_closed("cancel", &policy, &signal, flaky(usize::MAX, calls)).await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_until_closed_exhausts_like_retry_async() {
        let shutdown = Shutdown::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(2, []);

        let outcome =
            retry_until_closed("plain", &policy, &shutdown.signal(), flaky(usize::MAX, calls.clone()))
                .await;
        assert!(matches!(outcome, Err(RetryError::Exhausted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn test_schedule_follows_policy(
            retries in 0u32..8,
            delays in prop::collection::vec(0u64..1_000, 0..8),
        ) {
            let policy = RetryPolicy { retries, delays_ms: delays.clone() };
            let total = policy.total_attempts();
            prop_assert_eq!(total, (retries as usize + 1).max(delays.len() + 1));

            for attempt in 1..total {
                let expected = if delays.is_empty() {
                    0
                } else {
                    delays[(attempt - 1).min(delays.len() - 1)]
                };
                prop_assert_eq!(policy.delay_after(attempt), Duration::from_millis(expected));
            }
        }

        #[test]
        fn test_recovers_within_delay_budget(
            retries in 0u32..4,
            delays in prop::collection::vec(1u64..50, 1..6),
            seed in any::<usize>(),
        ) {
            let failures = seed % (delays.len() + 1);
            let policy = RetryPolicy { retries, delays_ms: delays };
            let calls = Arc::new(AtomicUsize::new(0));

            let value = paused_runtime()
                .block_on(retry_async("recover", &policy, flaky(failures, calls.clone())))
                .unwrap();
            prop_assert_eq!(value, 7);
            prop_assert_eq!(calls.load(Ordering::SeqCst), failures + 1);
        }

        #[test]
        fn test_always_failing_uses_whole_budget(
            retries in 0u32..6,
            delays in prop::collection::vec(1u64..50, 0..6),
        ) {
            let policy = RetryPolicy { retries, delays_ms: delays };
            let calls = Arc::new(AtomicUsize::new(0));

            let err = paused_runtime()
                .block_on(retry_async("exhaust", &policy, flaky(usize::MAX, calls.clone())))
                .unwrap_err();
            let total = policy.total_attempts();
            prop_assert_eq!(calls.load(Ordering::SeqCst), total);
            prop_assert_eq!(err, format!("failure {}", total - 1));
        }
    }
}
