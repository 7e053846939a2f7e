//! Captions stage: word timings for the narration.
//!
//! An empty caption result is a soft failure by default: the job completes
//! with `captions_skipped` set. With `captions_required` it fails instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use vgen_models::{CaptionsAsset, JobPatch, JobRecord, Stage};
use vgen_providers::{CaptionGenerator, ProviderError};
use vgen_storage::{content_types, ObjectStorage};

use super::{StageExecutor, StageResult};
use crate::error::{WorkerError, WorkerResult};

pub struct CaptionsStage {
    generator: Arc<dyn CaptionGenerator>,
    storage: Arc<dyn ObjectStorage>,
    signed_url_ttl: Duration,
    required: bool,
}

impl CaptionsStage {
    pub fn new(
        generator: Arc<dyn CaptionGenerator>,
        storage: Arc<dyn ObjectStorage>,
        signed_url_ttl: Duration,
        required: bool,
    ) -> Self {
        Self {
            generator,
            storage,
            signed_url_ttl,
            required,
        }
    }

    async fn captions(&self, record: &JobRecord) -> WorkerResult<JobPatch> {
        let speech = record
            .speech
            .as_ref()
            .ok_or_else(|| WorkerError::not_ready("captions require narration audio"))?;

        // The URL signed by the speech stage may have expired if the job resumed later
        let audio_url = self.storage.signed_url(&speech.key, self.signed_url_ttl).await?;
        let words = self.generator.generate_captions(&audio_url).await?;

        if words.is_empty() {
            if self.required {
                return Err(ProviderError::invalid_response("caption generator returned no words").into());
            }
            warn!(job_id = %record.job_id, "No caption data, completing without captions");
            return Ok(JobPatch::default().with_captions_skipped());
        }

        let key = format!("captions/{}.json", record.job_id);
        let word_count = words.len() as u32;
        let body = serde_json::to_vec(&words).map_err(|e| {
            ProviderError::invalid_response(format!("caption words not serializable: {}", e))
        })?;

        let url = self.storage.put(&key, body, content_types::JSON).await?;
        let signed_url = self.storage.signed_url(&key, self.signed_url_ttl).await?;

        info!(job_id = %record.job_id, words = word_count, "Captions stored");
        Ok(JobPatch::default().with_captions(CaptionsAsset {
            key,
            url,
            signed_url,
            word_count,
        }))
    }
}

#[async_trait]
impl StageExecutor for CaptionsStage {
    fn stage(&self) -> Stage {
        Stage::Captions
    }

    async fn execute(&self, record: &JobRecord) -> StageResult {
        Ok(self.captions(record).await?)
    }
}
