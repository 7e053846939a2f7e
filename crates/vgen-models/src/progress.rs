//! Progress events relayed to subscribers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Stage label for the final event of a successful job.
pub const STAGE_COMPLETE: &str = "COMPLETE";

/// Stage label for rendering events.
pub const STAGE_RENDER: &str = "RENDER";

/// Outcome carried by a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Info,
    Success,
    Error,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Info => "info",
            ProgressStatus::Success => "success",
            ProgressStatus::Error => "error",
        }
    }
}

/// A single progress update for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// Stage label, e.g. "SCRIPT" or "RENDER"
    pub stage: String,
    pub message: String,
    pub status: ProgressStatus,
    /// Overall completion, 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Free-form numeric counters (frames rendered, images done, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, u64>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    fn build(
        job_id: &JobId,
        stage: impl Into<String>,
        message: impl Into<String>,
        status: ProgressStatus,
    ) -> Self {
        Self {
            job_id: job_id.clone(),
            stage: stage.into(),
            message: message.into(),
            status,
            progress: None,
            details: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create an informational event.
    pub fn info(job_id: &JobId, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(job_id, stage, message, ProgressStatus::Info)
    }

    /// Create a success event.
    pub fn success(job_id: &JobId, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(job_id, stage, message, ProgressStatus::Success)
    }

    /// Create an error event.
    pub fn error(job_id: &JobId, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(job_id, stage, message, ProgressStatus::Error)
    }

    /// Final event of a finished job.
    pub fn complete(job_id: &JobId, message: impl Into<String>) -> Self {
        Self::success(job_id, STAGE_COMPLETE, message).with_progress(100)
    }

    /// Set overall progress, clamped to 100.
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    /// Attach a numeric counter.
    pub fn with_detail(mut self, key: impl Into<String>, value: u64) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Whether no further events are expected after this one.
    pub fn is_terminal(&self) -> bool {
        self.status == ProgressStatus::Error
            || (self.status == ProgressStatus::Success && self.stage == STAGE_COMPLETE)
    }
}
