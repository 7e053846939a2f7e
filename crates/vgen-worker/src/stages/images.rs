//! Images stage: one image per scene, through the rate-limited queue.
//!
//! Only the missing suffix of scenes is requested, so a resumed job
//! continues from `images.len()`. Requests run concurrently under the queue
//! limits; the contiguous prefix of successes is kept even when a later
//! image fails, so images never need to be generated twice.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use vgen_models::{JobPatch, JobRecord, ProgressEvent, Stage};
use vgen_providers::{ImageGenerator, ProviderError};
use vgen_queue::{ProgressBus, RateLimitedQueue};

use super::{progress_range, StageExecutor, StageFailure, StageResult};
use crate::error::WorkerError;

pub struct ImagesStage {
    generator: Arc<dyn ImageGenerator>,
    queue: Arc<RateLimitedQueue>,
    bus: ProgressBus,
    batch_size: Option<usize>,
}

impl ImagesStage {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        queue: Arc<RateLimitedQueue>,
        bus: ProgressBus,
        batch_size: Option<usize>,
    ) -> Self {
        Self {
            generator,
            queue,
            bus,
            batch_size,
        }
    }

    async fn generate_one(&self, prompt: &str, style: &str) -> Result<String, ProviderError> {
        let urls = self.generator.generate_image(prompt, style).await?;
        urls.into_iter()
            .next()
            .ok_or_else(|| ProviderError::invalid_response("image generator returned no URLs"))
    }
}

#[async_trait]
impl StageExecutor for ImagesStage {
    fn stage(&self) -> Stage {
        Stage::Images
    }

    async fn execute(&self, record: &JobRecord) -> StageResult {
        let missing = record.missing_image_scenes();
        let batch = match self.batch_size {
            Some(size) => &missing[..missing.len().min(size)],
            None => missing,
        };

        let total = record.scene_count();
        let already_done = record.images.len();
        let (start, end) = progress_range(Stage::Images);
        let completed = AtomicUsize::new(already_done);
        let style = record.config.style.as_str();

        debug!(
            job_id = %record.job_id,
            existing = already_done,
            requested = batch.len(),
            "Requesting images"
        );

        let requests = batch.iter().map(|scene| {
            let completed = &completed;
            async move {
                let result = self
                    .queue
                    .enqueue_for_job(
                        &record.job_id,
                        Stage::Images.label(),
                        || self.generate_one(&scene.image_prompt, style),
                        ProviderError::is_retryable,
                    )
                    .await;

                if result.is_ok() {
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    let span = usize::from(end - start);
                    let progress = start as usize + span * done / total.max(1);
                    self.bus
                        .publish(
                            ProgressEvent::info(
                                &record.job_id,
                                Stage::Images.label(),
                                format!("Generated image {}/{}", done, total),
                            )
                            .with_progress(progress as u8)
                            .with_detail("imagesCompleted", done as u64)
                            .with_detail("imagesTotal", total as u64),
                        )
                        .await;
                }
                result
            }
        });
        let results = join_all(requests).await;

        let mut images = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(url) if first_error.is_none() => images.push(url),
                // Successes after a gap cannot be stored without breaking scene order
                Ok(_) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            None => {
                info!(job_id = %record.job_id, generated = images.len(), "Image batch complete");
                Ok(JobPatch::default().with_images(images))
            }
            Some(error) => {
                warn!(
                    job_id = %record.job_id,
                    kept = images.len(),
                    "Image generation failed: {}", error
                );
                Err(StageFailure::with_partial(
                    WorkerError::from(error),
                    JobPatch::default().with_images(images),
                ))
            }
        }
    }
}
