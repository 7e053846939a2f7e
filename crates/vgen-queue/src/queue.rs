//! Concurrency- and rate-capped task queue.
//!
//! Two independent limits apply to every attempt of every task:
//! - at most `concurrency` attempts run at once
//! - at most `interval_cap` attempts start within any window of `interval`
//!
//! Failed attempts are retried with exponential backoff. A task does not
//! hold a concurrency slot while it waits for its next retry.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info};

use vgen_models::{JobId, ProgressEvent};

use crate::error::{QueueError, QueueResult};
use crate::progress::ProgressBus;
use crate::retry::{retry_async_if, RetryPolicy, RetryResult};

/// Queue limits and retry policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Attempts allowed to run at the same time
    pub concurrency: usize,
    /// Attempts allowed to start within one interval
    pub interval_cap: usize,
    /// Length of the rolling start window
    pub interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            interval_cap: 6,
            interval: Duration::from_millis(10_000),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Create from the `IMAGE_QUEUE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let millis = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            concurrency: std::env::var("IMAGE_QUEUE_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.concurrency),
            interval_cap: std::env::var("IMAGE_QUEUE_INTERVAL_CAP")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.interval_cap),
            interval: millis("IMAGE_QUEUE_INTERVAL_MS", defaults.interval),
            retry: RetryPolicy {
                max_retries: std::env::var("IMAGE_QUEUE_MAX_RETRIES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.retry.max_retries),
                initial_delay: millis("IMAGE_QUEUE_INITIAL_DELAY_MS", defaults.retry.initial_delay),
                max_delay: millis("IMAGE_QUEUE_MAX_DELAY_MS", defaults.retry.max_delay),
            },
        }
    }
}

/// Rate-limited queue shared by every job calling one provider.
pub struct RateLimitedQueue {
    name: String,
    config: QueueConfig,
    running: Arc<Semaphore>,
    /// Start times within the current window, oldest first
    starts: Mutex<VecDeque<Instant>>,
    bus: Option<ProgressBus>,
}

impl RateLimitedQueue {
    /// Create a new queue. `name` labels logs and metrics.
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            name: name.into(),
            running: Arc::new(Semaphore::new(concurrency)),
            starts: Mutex::new(VecDeque::with_capacity(config.interval_cap)),
            config,
            bus: None,
        }
    }

    /// Publish per-item failure events to `bus`.
    pub fn with_progress_bus(mut self, bus: ProgressBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Run `task` under the queue limits, retrying failures.
    ///
    /// `task` is called once per attempt. Returns the first success, or the
    /// last error once retries are exhausted.
    pub async fn enqueue<F, Fut, T, E>(&self, task: F) -> QueueResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        self.enqueue_if(task, |_| true).await
    }

    /// Like [`enqueue`](Self::enqueue), but only errors accepted by
    /// `should_retry` are retried. Any other error fails the task at once
    /// without taking another start slot.
    pub async fn enqueue_if<F, Fut, T, E, P>(&self, task: F, should_retry: P) -> QueueResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
        P: Fn(&E) -> bool,
    {
        let task = &task;
        let result = retry_async_if(
            &self.config.retry,
            &self.name,
            || async move { self.run_attempt(task).await },
            |e| match e {
                AttemptError::Task(source) => should_retry(source),
                AttemptError::Closed => false,
            },
        )
        .await;

        match result {
            RetryResult::Success(value) => Ok(value),
            RetryResult::Failed {
                error: AttemptError::Task(source),
                attempts,
            } => Err(QueueError::RetriesExhausted { attempts, source }),
            RetryResult::Failed {
                error: AttemptError::Closed,
                ..
            } => Err(QueueError::Closed),
        }
    }

    /// Like [`enqueue_if`](Self::enqueue_if), and publishes a failure event
    /// for `job_id` when the task fails.
    ///
    /// The event is informational; the caller decides whether the job fails.
    pub async fn enqueue_for_job<F, Fut, T, E, P>(
        &self,
        job_id: &JobId,
        stage: &str,
        task: F,
        should_retry: P,
    ) -> QueueResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
        P: Fn(&E) -> bool,
    {
        let result = self.enqueue_if(task, should_retry).await;

        if let (Err(e), Some(bus)) = (&result, &self.bus) {
            bus.publish(
                ProgressEvent::info(job_id, stage, format!("Work item failed: {}", e))
                    .with_detail("failedAttempts", u64::from(e.attempts())),
            )
            .await;
        }

        result
    }

    async fn run_attempt<F, Fut, T, E>(&self, task: &F) -> Result<T, AttemptError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let _permit = self
            .running
            .acquire()
            .await
            .map_err(|_| AttemptError::Closed)?;
        self.wait_for_start_slot().await;

        task().await.map_err(AttemptError::Task)
    }

    /// Wait until starting now keeps the window under `interval_cap`, then
    /// record the start.
    async fn wait_for_start_slot(&self) {
        let cap = self.config.interval_cap.max(1);
        let interval = self.config.interval;

        loop {
            let wait = {
                let mut starts = self.starts.lock();
                let now = Instant::now();
                while starts
                    .front()
                    .is_some_and(|start| now.duration_since(*start) >= interval)
                {
                    starts.pop_front();
                }

                if starts.len() < cap {
                    starts.push_back(now);
                    return;
                }

                match starts.front() {
                    Some(oldest) => (*oldest + interval).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            debug!(queue = self.name.as_str(), "Interval cap reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Close the queue. Pending and future tasks fail with `Closed`.
    pub fn close(&self) {
        info!(queue = self.name.as_str(), "Closing queue");
        self.running.close();
    }
}

/// Outcome of one attempt, before retry bookkeeping.
#[derive(Debug)]
enum AttemptError<E> {
    Task(E),
    Closed,
}

impl<E: std::fmt::Display> std::fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Task(e) => write!(f, "{}", e),
            AttemptError::Closed => write!(f, "queue closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("provider error: {0}")]
    struct TestError(&'static str);

    fn config(concurrency: usize, interval_cap: usize, interval: Duration) -> QueueConfig {
        QueueConfig {
            concurrency,
            interval_cap,
            interval,
            retry: RetryPolicy::new(3, Duration::from_secs(1)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_window_and_concurrency() {
        let queue = RateLimitedQueue::new("images", config(1, 6, Duration::from_secs(10)));
        let starts = Mutex::new(Vec::new());
        let running = AtomicUsize::new(0);
        let max_running = AtomicUsize::new(0);
        let (starts_ref, running, max_running) = (&starts, &running, &max_running);

        let tasks = (0..20).map(|_| {
            queue.enqueue(move || async move {
                starts_ref.lock().push(Instant::now());
                let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now_running, Ordering::SeqCst);
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
        });
        let results = join_all(tasks).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(max_running.load(Ordering::SeqCst), 1);

        let mut starts = starts.into_inner();
        starts.sort();
        assert_eq!(starts.len(), 20);
        for window in starts.windows(7) {
            assert!(window[6].duration_since(window[0]) >= Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_with_slow_tasks() {
        let queue = RateLimitedQueue::new("slow", config(2, 100, Duration::from_secs(1)));
        let running = AtomicUsize::new(0);
        let max_running = AtomicUsize::new(0);
        let (running, max_running_ref) = (&running, &max_running);

        let tasks = (0..6).map(|_| {
            queue.enqueue(move || async move {
                let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running_ref.fetch_max(now_running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
        });
        join_all(tasks).await;

        assert_eq!(max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retry() {
        let queue = RateLimitedQueue::new("flaky", config(1, 100, Duration::from_secs(1)));
        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let started = Instant::now();

        let value = queue
            .enqueue(move || async move {
                if attempts_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError("429"))
                } else {
                    Ok("image-url")
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "image-url");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_publish_failure_event() {
        let bus = ProgressBus::new();
        let queue = RateLimitedQueue::new("images", config(1, 100, Duration::from_secs(1)))
            .with_progress_bus(bus.clone());
        let job_id = JobId::from_string("job-1");
        let mut events = bus.subscribe(&job_id).await;

        let err = queue
            .enqueue_for_job(
                &job_id,
                "IMAGES",
                || async { Err::<(), _>(TestError("down")) },
                |_| true,
            )
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 4);
        assert!(matches!(err, QueueError::RetriesExhausted { .. }));

        let event = events.next().await.unwrap();
        assert_eq!(event.stage, "IMAGES");
        assert_eq!(event.details.get("failedAttempts"), Some(&4));
        assert!(!event.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let queue = RateLimitedQueue::new("images", config(1, 100, Duration::from_secs(1)));
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let started = Instant::now();

        let err = queue
            .enqueue_if(
                move || async move {
                    calls_ref.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError("401 unauthorized"))
                },
                |e| e.0.starts_with("429"),
            )
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_still_retried_under_predicate() {
        let queue = RateLimitedQueue::new("images", config(1, 100, Duration::from_secs(1)));
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let value = queue
            .enqueue_if(
                move || async move {
                    if calls_ref.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TestError("429 slow down"))
                    } else {
                        Ok(7)
                    }
                },
                |e| e.0.starts_with("429"),
            )
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_tasks() {
        let queue = RateLimitedQueue::new("closed", QueueConfig::default());
        queue.close();

        let err = queue
            .enqueue(|| async { Ok::<_, TestError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }
}
