//! Queue error types.

use thiserror::Error;

pub type QueueResult<T, E> = Result<T, QueueError<E>>;

/// Failure of an enqueued task. `E` is the task's own error type.
#[derive(Debug, Error)]
pub enum QueueError<E>
where
    E: std::error::Error + 'static,
{
    #[error("Task failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("Queue is closed")]
    Closed,
}

impl<E> QueueError<E>
where
    E: std::error::Error + 'static,
{
    /// The task's final error, if the task ran at all.
    pub fn into_source(self) -> Option<E> {
        match self {
            QueueError::RetriesExhausted { source, .. } => Some(source),
            QueueError::Closed => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            QueueError::RetriesExhausted { attempts, .. } => *attempts,
            QueueError::Closed => 0,
        }
    }
}
