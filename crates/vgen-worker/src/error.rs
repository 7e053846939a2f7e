//! Worker error types.

use std::sync::Arc;

use thiserror::Error;

use vgen_providers::ProviderError;
use vgen_queue::QueueError;
use vgen_storage::StorageError;
use vgen_store::StoreError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: String, seconds: u64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("No progress after {0} passes")]
    MaxIterationsExceeded(u32),

    #[error("Render already in progress for job {0}")]
    DuplicateRender(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Job not ready: {0}")]
    NotReady(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure of a render another caller started, shared with every waiter.
    #[error(transparent)]
    Shared(Arc<WorkerError>),
}

impl WorkerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    pub fn timeout(stage: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            stage: stage.into(),
            seconds: timeout.as_secs(),
        }
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Validation(_) => "validation",
            WorkerError::Provider(_) => "provider",
            WorkerError::Timeout { .. } => "timeout",
            WorkerError::Store(_) => "store",
            WorkerError::MaxIterationsExceeded(_) => "max_iterations",
            WorkerError::DuplicateRender(_) => "duplicate_render",
            WorkerError::Storage(_) => "storage",
            WorkerError::NotReady(_) => "not_ready",
            WorkerError::Io(_) => "io",
            WorkerError::Shared(inner) => inner.kind(),
        }
    }

    /// Check if re-invoking the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Provider(e) => e.is_retryable(),
            WorkerError::Store(_) | WorkerError::Storage(_) | WorkerError::Io(_) => true,
            WorkerError::Shared(inner) => inner.is_retryable(),
            _ => false,
        }
    }
}

impl From<validator::ValidationErrors> for WorkerError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

impl From<QueueError<ProviderError>> for WorkerError {
    fn from(error: QueueError<ProviderError>) -> Self {
        match error {
            QueueError::RetriesExhausted { source, .. } => Self::Provider(source),
            QueueError::Closed => {
                Self::Provider(ProviderError::ServiceUnavailable("work queue closed".to_string()))
            }
        }
    }
}
