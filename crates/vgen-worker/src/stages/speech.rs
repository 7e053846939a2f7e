//! Speech stage: narration audio stored in object storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use tracing::info;

use vgen_models::{JobPatch, JobRecord, SpeechAsset, Stage};
use vgen_providers::{ProviderError, SpeechSynthesizer};
use vgen_storage::{content_types, ObjectStorage};

use super::{StageExecutor, StageResult};
use crate::error::{WorkerError, WorkerResult};

pub struct SpeechStage {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    storage: Arc<dyn ObjectStorage>,
    signed_url_ttl: Duration,
}

impl SpeechStage {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        storage: Arc<dyn ObjectStorage>,
        signed_url_ttl: Duration,
    ) -> Self {
        Self {
            synthesizer,
            storage,
            signed_url_ttl,
        }
    }

    fn key(record: &JobRecord) -> String {
        format!("speech/{}.mp3", record.job_id)
    }

    async fn synthesize(&self, record: &JobRecord) -> WorkerResult<SpeechAsset> {
        let script = record
            .script
            .as_ref()
            .ok_or_else(|| WorkerError::not_ready("speech requires a script"))?;

        let encoded = self.synthesizer.synthesize(&script.narration()).await?;
        let audio = BASE64_STANDARD.decode(encoded.trim()).map_err(|e| {
            ProviderError::invalid_response(format!("speech audio is not valid base64: {}", e))
        })?;

        let key = Self::key(record);
        let size = audio.len();
        let url = self.storage.put(&key, audio, content_types::AUDIO_MPEG).await?;
        let signed_url = self.storage.signed_url(&key, self.signed_url_ttl).await?;

        info!(job_id = %record.job_id, bytes = size, "Narration stored");
        Ok(SpeechAsset {
            key,
            url,
            signed_url,
        })
    }
}

#[async_trait]
impl StageExecutor for SpeechStage {
    fn stage(&self) -> Stage {
        Stage::Speech
    }

    async fn execute(&self, record: &JobRecord) -> StageResult {
        let speech = self.synthesize(record).await?;
        Ok(JobPatch::default().with_speech(speech))
    }
}
