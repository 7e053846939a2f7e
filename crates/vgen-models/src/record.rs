//! Job records, stages and partial updates.
//!
//! A [`JobRecord`] is the durable state of one generation job. Stages
//! produce a [`JobPatch`] which is merged into the record; callers never
//! replace a record wholesale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GenerationConfig, JobId};

/// Job processing status.
///
/// Statuses other than `Failed` form a strictly advancing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    ScriptReady,
    SpeechReady,
    ImagesReady,
    CaptionsReady,
    Complete,
    Failed,
}

impl JobStatus {
    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::ScriptReady => "script_ready",
            JobStatus::SpeechReady => "speech_ready",
            JobStatus::ImagesReady => "images_ready",
            JobStatus::CaptionsReady => "captions_ready",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    /// Position in the stage order. `Failed` has no position.
    fn rank(&self) -> Option<u8> {
        match self {
            JobStatus::Pending => Some(0),
            JobStatus::ScriptReady => Some(1),
            JobStatus::SpeechReady => Some(2),
            JobStatus::ImagesReady => Some(3),
            JobStatus::CaptionsReady => Some(4),
            JobStatus::Complete => Some(5),
            JobStatus::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` respects the advancing pointer.
    ///
    /// `Failed` is reachable from anywhere, and a failed job may resume
    /// at any stage status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (None, Some(_)) => true,
            (Some(current), Some(next)) => next > current,
        }
    }

    /// Check if this is a terminal state for the current attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of pipeline work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Script,
    Speech,
    Images,
    Captions,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 4] = [Stage::Script, Stage::Speech, Stage::Images, Stage::Captions];

    /// Status reached when the stage completes. Captions complete the job.
    pub fn target_status(&self) -> JobStatus {
        match self {
            Stage::Script => JobStatus::ScriptReady,
            Stage::Speech => JobStatus::SpeechReady,
            Stage::Images => JobStatus::ImagesReady,
            Stage::Captions => JobStatus::Complete,
        }
    }

    /// Index into per-stage tables.
    pub fn index(&self) -> usize {
        match self {
            Stage::Script => 0,
            Stage::Speech => 1,
            Stage::Images => 2,
            Stage::Captions => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Script => "script",
            Stage::Speech => "speech",
            Stage::Images => "images",
            Stage::Captions => "captions",
        }
    }

    /// Label used in progress events.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Script => "SCRIPT",
            Stage::Speech => "SPEECH",
            Stage::Images => "IMAGES",
            Stage::Captions => "CAPTIONS",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One scene of a generated script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    /// Prompt sent to the image generator
    pub image_prompt: String,
    /// Narration for the scene
    pub text_content: String,
}

/// Generated script: an ordered scene list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub script_id: String,
    pub scenes: Vec<Scene>,
}

impl Script {
    pub fn new(scenes: Vec<Scene>) -> Self {
        Self {
            script_id: uuid::Uuid::new_v4().to_string(),
            scenes,
        }
    }

    /// Full narration text, scenes joined in order.
    pub fn narration(&self) -> String {
        self.scenes
            .iter()
            .map(|s| s.text_content.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Synthesized narration audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechAsset {
    /// Object storage key
    pub key: String,
    /// Primary URL
    pub url: String,
    /// Short-lived signed URL
    pub signed_url: String,
}

/// A single caption word with its timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionWord {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Uploaded word-level captions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionsAsset {
    pub key: String,
    pub url: String,
    pub signed_url: String,
    pub word_count: u32,
}

/// Durable state of a generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub owner: String,
    pub config: GenerationConfig,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub script: Option<Script>,
    #[serde(default)]
    pub speech: Option<SpeechAsset>,
    /// Image URLs, one per scene. Only ever grows.
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub captions: Option<CaptionsAsset>,
    /// Set when the caption provider returned no words and the job completed without captions
    #[serde(default)]
    pub captions_skipped: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a fresh pending record.
    pub fn new(job_id: JobId, owner: impl Into<String>, config: GenerationConfig) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            owner: owner.into(),
            config,
            status: JobStatus::Pending,
            script: None,
            speech: None,
            images: Vec::new(),
            captions: None,
            captions_skipped: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of scenes in the script, zero before the script exists.
    pub fn scene_count(&self) -> usize {
        self.script.as_ref().map(|s| s.scenes.len()).unwrap_or(0)
    }

    /// Whether every scene has an image.
    pub fn images_complete(&self) -> bool {
        self.script.is_some() && self.images.len() >= self.scene_count()
    }

    /// Scenes that still need an image, in order.
    pub fn missing_image_scenes(&self) -> &[Scene] {
        match &self.script {
            Some(script) if self.images.len() < script.scenes.len() => {
                &script.scenes[self.images.len()..]
            }
            _ => &[],
        }
    }

    /// Whether a stage still has work to do given the current artifacts.
    pub fn is_missing(&self, stage: Stage) -> bool {
        match stage {
            Stage::Script => self.script.is_none(),
            Stage::Speech => self.script.is_some() && self.speech.is_none(),
            Stage::Images => self.speech.is_some() && !self.images_complete(),
            Stage::Captions => {
                self.speech.is_some()
                    && self.images_complete()
                    && self.captions.is_none()
                    && !self.captions_skipped
            }
        }
    }

    /// Stages with work remaining, in execution order.
    pub fn missing_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.is_missing(*stage))
            .collect()
    }

    /// Whether all artifacts needed for rendering are in place.
    pub fn is_complete(&self) -> bool {
        self.status == JobStatus::Complete && self.missing_stages().is_empty()
    }

    /// Merge a partial update into this record.
    pub fn apply(&mut self, patch: JobPatch) {
        if let Some(script) = patch.script {
            self.script = Some(script);
        }
        if let Some(speech) = patch.speech {
            self.speech = Some(speech);
        }
        self.images.extend(patch.new_images);
        if let Some(captions) = patch.captions {
            self.captions = Some(captions);
        }
        if patch.captions_skipped {
            self.captions_skipped = true;
        }
        if let Some(status) = patch.status {
            if self.status.can_transition_to(status) {
                self.status = status;
            }
        }
        if patch.clear_error {
            self.error = None;
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update to a [`JobRecord`]. Only the fields set are changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<Script>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech: Option<SpeechAsset>,
    /// Images appended after the existing ones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captions: Option<CaptionsAsset>,
    #[serde(default)]
    pub captions_skipped: bool,
    #[serde(default)]
    pub clear_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobPatch {
    /// Advance to `status` and clear any previous error.
    pub fn advance(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            clear_error: true,
            ..Default::default()
        }
    }

    /// Add a status advance (and error reset) to an artifact patch.
    pub fn advancing(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self.clear_error = true;
        self
    }

    /// Mark the job failed with `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_script(mut self, script: Script) -> Self {
        self.script = Some(script);
        self
    }

    pub fn with_speech(mut self, speech: SpeechAsset) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.new_images = images;
        self
    }

    pub fn with_captions(mut self, captions: CaptionsAsset) -> Self {
        self.captions = Some(captions);
        self
    }

    pub fn with_captions_skipped(mut self) -> Self {
        self.captions_skipped = true;
        self
    }

    /// Combine a failure with whatever partial artifacts `self` carries.
    pub fn into_failed(mut self, message: impl Into<String>) -> Self {
        self.status = Some(JobStatus::Failed);
        self.error = Some(message.into());
        self.clear_error = false;
        self
    }

    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == JobPatch::default()
    }
}
