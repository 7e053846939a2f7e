//! Stage pipeline: drives a job through script, speech, images and captions.
//!
//! Each run re-derives the missing stages from the stored record after
//! every stage, so a run resumes from the last persisted checkpoint and a
//! stage that needs several passes (partial image batches) simply comes up
//! again. Stage failures are persisted before they are returned and always
//! produce exactly one error event.

use std::time::{Duration, Instant};

use tracing::Instrument;
use validator::Validate;

use vgen_models::{GenerationConfig, JobId, JobPatch, JobRecord, JobStatus, ProgressEvent, Stage};
use vgen_queue::ProgressBus;
use vgen_store::JobRepository;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::stages::{progress_range, start_message, StageFailure, StageTable};

/// Pipeline limits.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub stage_timeout: Duration,
    pub max_stalled_passes: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(300),
            max_stalled_passes: 3,
        }
    }
}

impl From<&WorkerConfig> for PipelineConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            stage_timeout: config.stage_timeout,
            max_stalled_passes: config.max_stalled_passes,
        }
    }
}

/// Runs the stage state machine. Callers keep one run per job id at a time.
pub struct StagePipeline {
    jobs: JobRepository,
    bus: ProgressBus,
    stages: StageTable,
    config: PipelineConfig,
}

impl StagePipeline {
    pub fn new(jobs: JobRepository, bus: ProgressBus, stages: StageTable, config: PipelineConfig) -> Self {
        Self {
            jobs,
            bus,
            stages,
            config,
        }
    }

    /// Run every missing stage for the job and return the final record.
    pub async fn run(
        &self,
        job_id: &JobId,
        config: &GenerationConfig,
        owner: &str,
    ) -> WorkerResult<JobRecord> {
        let logger = JobLogger::new(job_id, "generation");
        let span = logger.create_span();
        self.run_inner(job_id, config, owner, &logger)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        job_id: &JobId,
        config: &GenerationConfig,
        owner: &str,
        logger: &JobLogger,
    ) -> WorkerResult<JobRecord> {
        if let Err(e) = config.validate() {
            let error = WorkerError::from(e);
            self.publish_failure(job_id, "VALIDATION", &error).await;
            return Err(error);
        }

        let mut record = match self.jobs.create_if_absent(job_id, owner, config).await {
            Ok(record) => record,
            Err(e) => {
                let error = WorkerError::from(e);
                self.publish_failure(job_id, "STORE", &error).await;
                return Err(error);
            }
        };

        logger.log_start(&format!(
            "status={} missing={:?}",
            record.status,
            record.missing_stages()
        ));

        let mut stalled_passes = 0u32;

        while let Some(stage) = record.missing_stages().first().copied() {
            let (start, end) = progress_range(stage);
            self.bus
                .publish(
                    ProgressEvent::info(job_id, stage.label(), start_message(stage))
                        .with_progress(start),
                )
                .await;

            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                self.config.stage_timeout,
                self.stages.get(stage).execute(&record),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(StageFailure::from(WorkerError::timeout(
                    stage.as_str(),
                    self.config.stage_timeout,
                ))),
            };

            let patch = match outcome {
                Ok(patch) => patch,
                Err(failure) => {
                    return Err(self.fail(job_id, stage, failure, logger).await);
                }
            };

            let images_before = record.images.len();
            let mut preview = record.clone();
            preview.apply(patch.clone());
            let stage_done = !preview.is_missing(stage);
            let patch = if stage_done {
                patch.advancing(stage.target_status())
            } else {
                patch
            };

            record = match self.jobs.save(job_id, patch).await {
                Ok(record) => record,
                Err(e) => {
                    return Err(self.fail(job_id, stage, WorkerError::from(e).into(), logger).await);
                }
            };

            if stage_done {
                stalled_passes = 0;
                metrics::record_stage_completed(stage.as_str(), started.elapsed().as_secs_f64());
                logger.log_progress(&format!("{} complete, status={}", stage, record.status));
                self.bus
                    .publish(self.success_event(&record, stage).with_progress(end))
                    .await;
            } else if record.images.len() > images_before {
                stalled_passes = 0;
                logger.log_progress(&format!(
                    "{} partial, {}/{} images",
                    stage,
                    record.images.len(),
                    record.scene_count()
                ));
            } else {
                stalled_passes += 1;
                logger.log_warning(&format!("{} made no progress ({} passes)", stage, stalled_passes));
                if stalled_passes >= self.config.max_stalled_passes {
                    let error = WorkerError::MaxIterationsExceeded(stalled_passes);
                    return Err(self.fail(job_id, stage, error.into(), logger).await);
                }
            }
        }

        if record.status != JobStatus::Complete {
            // All artifacts present but an earlier attempt ended in `failed`
            record = match self.jobs.save(job_id, JobPatch::advance(JobStatus::Complete)).await {
                Ok(record) => record,
                Err(e) => {
                    let error = WorkerError::from(e);
                    return Err(self.fail(job_id, Stage::Captions, error.into(), logger).await);
                }
            };
            self.bus
                .publish(
                    ProgressEvent::success(job_id, Stage::Captions.label(), "All assets ready")
                        .with_progress(50),
                )
                .await;
        }

        metrics::record_job_completed();
        logger.log_completion(&format!("{} images", record.images.len()));
        Ok(record)
    }

    fn success_event(&self, record: &JobRecord, stage: Stage) -> ProgressEvent {
        let job_id = &record.job_id;
        match stage {
            Stage::Script => ProgressEvent::success(job_id, stage.label(), "Script ready")
                .with_detail("scenes", record.scene_count() as u64),
            Stage::Speech => ProgressEvent::success(job_id, stage.label(), "Narration ready"),
            Stage::Images => ProgressEvent::success(job_id, stage.label(), "Images ready")
                .with_detail("imagesCompleted", record.images.len() as u64),
            Stage::Captions if record.captions_skipped => ProgressEvent::success(
                job_id,
                stage.label(),
                "No captions available, continuing without them",
            ),
            Stage::Captions => {
                let words = record.captions.as_ref().map_or(0, |c| c.word_count);
                ProgressEvent::success(job_id, stage.label(), "Captions ready")
                    .with_detail("words", u64::from(words))
            }
        }
    }

    /// Persist a stage failure and its checkpoint, then announce it.
    async fn fail(
        &self,
        job_id: &JobId,
        stage: Stage,
        failure: StageFailure,
        logger: &JobLogger,
    ) -> WorkerError {
        let StageFailure { error, partial } = failure;
        let message = error.to_string();
        logger.log_error(&format!("{} failed: {}", stage, message));

        let patch = partial.unwrap_or_default().into_failed(message.as_str());
        if let Err(e) = self.jobs.save(job_id, patch).await {
            logger.log_warning(&format!("could not persist failure: {}", e));
        }

        metrics::record_stage_failed(stage.as_str(), error.kind());
        self.publish_failure(job_id, stage.label(), &error).await;
        error
    }

    async fn publish_failure(&self, job_id: &JobId, stage: &str, error: &WorkerError) {
        metrics::record_job_failed(error.kind());
        self.bus
            .publish(ProgressEvent::error(job_id, stage, error.to_string()))
            .await;
    }
}
