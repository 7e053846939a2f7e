//! Contracts for the external generators and the renderer.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use vgen_models::{CaptionWord, GenerationConfig, RenderInputs, Scene};

use crate::error::ProviderResult;

/// Writes the narration script for a topic.
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    /// Return the ordered scene list for `config`.
    async fn generate_script(&self, config: &GenerationConfig) -> ProviderResult<Vec<Scene>>;
}

/// Text-to-speech.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Return base64 encoded audio for `text`.
    async fn synthesize(&self, text: &str) -> ProviderResult<String>;
}

/// Image generation.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Return one or more image URLs for `prompt`.
    async fn generate_image(&self, prompt: &str, style: &str) -> ProviderResult<Vec<String>>;
}

/// Word-level caption extraction.
#[async_trait]
pub trait CaptionGenerator: Send + Sync {
    /// Return timed words for the audio at `audio_url`. May be empty.
    async fn generate_captions(&self, audio_url: &str) -> ProviderResult<Vec<CaptionWord>>;
}

/// One render job handed to a [`Renderer`].
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub composition_id: String,
    pub inputs: RenderInputs,
    pub output_path: PathBuf,
}

/// Progress reported by the renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderProgress {
    /// Fractional completion, 0.0 to 1.0
    pub progress: f64,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub rendered_frames: u64,
    #[serde(default)]
    pub encoded_frames: u64,
}

impl RenderProgress {
    /// Completion clamped into 0.0..=1.0.
    pub fn fraction(&self) -> f64 {
        if self.progress.is_finite() {
            self.progress.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Opaque video renderer.
///
/// Implementations send progress on `progress` while running and return the
/// path of the finished file. Dropping the future must stop the render.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        request: RenderRequest,
        progress: mpsc::UnboundedSender<RenderProgress>,
    ) -> ProviderResult<PathBuf>;
}
