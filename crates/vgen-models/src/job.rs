//! Job identity and generation requests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use validator::Validate;

/// Number of hex characters kept from the request digest.
const JOB_ID_HEX_LEN: usize = 32;

/// Unique identifier for a generation job.
///
/// Ids are stable per logical configuration and owner, so repeated
/// requests for the same video resolve to the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Derive the job id for a request from its configuration and owner.
    pub fn for_request(config: &GenerationConfig, owner: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(config.topic.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(config.duration_ms.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(config.style.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(owner.as_bytes());

        let hex: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Self(hex[..JOB_ID_HEX_LEN].to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to generate a short video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Subject of the video
    #[validate(length(min = 1, max = 500, message = "topic must be 1-500 characters"))]
    pub topic: String,

    /// Target duration in milliseconds
    #[validate(range(
        min = 5_000,
        max = 600_000,
        message = "duration must be between 5 seconds and 10 minutes"
    ))]
    pub duration_ms: u64,

    /// Visual style passed to the script and image generators (e.g. "anime")
    #[validate(length(min = 1, max = 64, message = "style must be 1-64 characters"))]
    pub style: String,
}

impl GenerationConfig {
    pub fn new(topic: impl Into<String>, duration_ms: u64, style: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            duration_ms,
            style: style.into(),
        }
    }
}
