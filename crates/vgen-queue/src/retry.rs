//! Retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};

/// Backoff policy: the n-th retry waits `initial_delay * 2^(n-1)`, capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries (not including the initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),
    Failed { error: E, attempts: u32 },
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success(_))
    }

    /// Convert into a `Result`, keeping the attempt count on failure.
    pub fn into_result(self) -> Result<T, (E, u32)> {
        match self {
            RetryResult::Success(value) => Ok(value),
            RetryResult::Failed { error, attempts } => Err((error, attempts)),
        }
    }
}

/// Run `operation` until it succeeds or `policy.max_retries` retries are spent.
///
/// `name` labels log lines and the retry metrics.
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    name: &str,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_async_if(policy, name, operation, |_| true).await
}

/// Like [`retry_async`], but gives up at once on errors `should_retry` rejects.
pub async fn retry_async_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    name: &str,
    mut operation: F,
    should_retry: P,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retry = 0u32;

    loop {
        match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) if retry < policy.max_retries && should_retry(&e) => {
                retry += 1;
                let delay = policy.delay_for_retry(retry);
                debug!("{} attempt {} failed, retrying in {:?}: {}", name, retry, delay, e);
                counter!("vgen_queue_task_retries_total", "queue" => name.to_string()).increment(1);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!("{} failed after {} attempts: {}", name, retry + 1, e);
                counter!("vgen_queue_task_failures_total", "queue" => name.to_string())
                    .increment(1);
                return RetryResult::Failed {
                    error: e,
                    attempts: retry + 1,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy =
            RetryPolicy::new(5, Duration::from_secs(1)).with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(40), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let started = Instant::now();

        let result = retry_async(&policy, "test", || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("flaky")
            } else {
                Ok(7)
            }
        })
        .await;

        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let result: RetryResult<(), &str> =
            retry_async(&policy, "test", || async { Err("down") }).await;

        match result.into_result() {
            Err((error, attempts)) => {
                assert_eq!(error, "down");
                assert_eq!(attempts, 3);
            }
            Ok(()) => panic!("expected failure"),
        }
    }
}
