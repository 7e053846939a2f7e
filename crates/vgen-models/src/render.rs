//! Render status records and renderer input payloads.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, JobRecord, Scene};

/// Render lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl RenderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderStatus::Pending => "pending",
            RenderStatus::Completed => "completed",
            RenderStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RenderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Render state of a job's video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderStatusRecord {
    pub job_id: JobId,
    pub status: RenderStatus,
    /// Output file location once completed
    #[serde(default)]
    pub path: Option<String>,
    /// Object storage URL when the render was uploaded
    #[serde(default)]
    pub remote_url: Option<String>,
    /// Updated whenever the asset is served
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RenderStatusRecord {
    /// Create a record for a render that is starting now.
    pub fn pending(job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: RenderStatus::Pending,
            path: None,
            remote_url: None,
            last_accessed: now,
            error: None,
            updated_at: now,
        }
    }

    /// Mark the render completed at `path`.
    pub fn complete(&mut self, path: impl Into<String>, remote_url: Option<String>) {
        let now = Utc::now();
        self.status = RenderStatus::Completed;
        self.path = Some(path.into());
        self.remote_url = remote_url;
        self.error = None;
        self.last_accessed = now;
        self.updated_at = now;
    }

    /// Mark the render failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = RenderStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Record an access to the rendered asset.
    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    /// Whether the asset has not been accessed within `max_age`.
    pub fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_accessed > max_age
    }

    /// Whether a pending render has gone quiet for longer than `timeout`.
    ///
    /// Such records belong to a render whose process died and may be taken over.
    pub fn is_abandoned(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.status == RenderStatus::Pending && now - self.updated_at > timeout
    }
}

/// Input payload handed to the external renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderInputs {
    pub job_id: JobId,
    pub duration_ms: u64,
    pub style: String,
    pub scenes: Vec<Scene>,
    pub images: Vec<String>,
    pub speech_url: String,
    #[serde(default)]
    pub captions_url: Option<String>,
}

impl RenderInputs {
    /// Assemble renderer inputs from a finished job.
    ///
    /// Returns `None` while any required artifact is missing.
    pub fn from_record(record: &JobRecord) -> Option<Self> {
        if !record.is_complete() {
            return None;
        }
        let script = record.script.as_ref()?;
        let speech = record.speech.as_ref()?;

        Some(Self {
            job_id: record.job_id.clone(),
            duration_ms: record.config.duration_ms,
            style: record.config.style.clone(),
            scenes: script.scenes.clone(),
            images: record.images[..script.scenes.len()].to_vec(),
            speech_url: speech.signed_url.clone(),
            captions_url: record.captions.as_ref().map(|c| c.signed_url.clone()),
        })
    }

    /// Replace the asset URLs, e.g. with freshly signed ones.
    pub fn with_asset_urls(mut self, speech_url: String, captions_url: Option<String>) -> Self {
        self.speech_url = speech_url;
        self.captions_url = captions_url;
        self
    }
}
