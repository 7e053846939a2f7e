//! Rate-limited work queue and progress bus.
//!
//! - [`RateLimitedQueue`] bounds concurrency and start rate of calls to
//!   quota-limited providers and retries failures with exponential backoff.
//! - [`ProgressBus`] fans out per-job progress events and replays the latest
//!   snapshot to late subscribers.

pub mod error;
pub mod progress;
pub mod queue;
pub mod retry;

pub use error::{QueueError, QueueResult};
pub use progress::{ProgressBus, ProgressSubscription};
pub use queue::{QueueConfig, RateLimitedQueue};
pub use retry::{retry_async, RetryPolicy, RetryResult};
