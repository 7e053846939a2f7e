//! Generation service: the surface the rest of the system talks to.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use validator::Validate;

use vgen_models::{GenerationConfig, JobId, JobRecord, ProgressEvent, RenderInputs};
use vgen_providers::Renderer;
use vgen_queue::{ProgressBus, ProgressSubscription, QueueConfig, RateLimitedQueue};
use vgen_storage::ObjectStorage;
use vgen_store::{JobRepository, RenderRepository, StatusStore};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::{PipelineConfig, StagePipeline};
use crate::render::{RenderCoordinator, RenderedFile};
use crate::stages::{Providers, StageTable};

/// Handle to a generation run started in the background.
pub type GenerationHandle = JoinHandle<WorkerResult<JobRecord>>;

/// Entry point for generation, progress, rendering and cleanup.
pub struct GenerationService {
    config: WorkerConfig,
    jobs: JobRepository,
    bus: ProgressBus,
    storage: Arc<dyn ObjectStorage>,
    image_queue: Arc<RateLimitedQueue>,
    pipeline: Arc<StagePipeline>,
    coordinator: Arc<RenderCoordinator>,
    /// Jobs with a pipeline run in this process
    running: Arc<Mutex<HashSet<JobId>>>,
}

impl GenerationService {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn StatusStore>,
        storage: Arc<dyn ObjectStorage>,
        providers: Providers,
        renderer: Arc<dyn Renderer>,
        queue_config: QueueConfig,
    ) -> Self {
        let bus = ProgressBus::with_store(store.clone(), config.snapshot_ttl);
        let image_queue = Arc::new(
            RateLimitedQueue::new("images", queue_config).with_progress_bus(bus.clone()),
        );
        let jobs = JobRepository::new(store.clone());

        let stages = StageTable::new(
            providers,
            storage.clone(),
            image_queue.clone(),
            bus.clone(),
            &config,
        );
        let pipeline = StagePipeline::new(
            jobs.clone(),
            bus.clone(),
            stages,
            PipelineConfig::from(&config),
        );

        let mut coordinator =
            RenderCoordinator::new(RenderRepository::new(store), bus.clone(), renderer, &config);
        if config.render_upload {
            coordinator = coordinator.with_upload(storage.clone());
        }

        Self {
            config,
            jobs,
            bus,
            storage,
            image_queue,
            pipeline: Arc::new(pipeline),
            coordinator: Arc::new(coordinator),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn progress_bus(&self) -> &ProgressBus {
        &self.bus
    }

    pub fn jobs(&self) -> &JobRepository {
        &self.jobs
    }

    /// Whether a pipeline run for `job_id` is active in this process.
    pub fn is_running(&self, job_id: &JobId) -> bool {
        self.running.lock().contains(job_id)
    }

    /// Start generating a job in the background.
    ///
    /// Invalid configs are rejected immediately. Returns `None` when a run
    /// for `job_id` is already active; its progress is on the same bus.
    pub async fn start_generation(
        &self,
        job_id: JobId,
        config: GenerationConfig,
        owner: impl Into<String>,
    ) -> WorkerResult<Option<GenerationHandle>> {
        if let Err(e) = config.validate() {
            let error = WorkerError::from(e);
            self.bus
                .publish(ProgressEvent::error(&job_id, "VALIDATION", error.to_string()))
                .await;
            return Err(error);
        }

        let Some(guard) = RunningGuard::acquire(&self.running, &job_id) else {
            info!(job_id = %job_id, "Generation already running, not starting another");
            return Ok(None);
        };

        let pipeline = Arc::clone(&self.pipeline);
        let owner = owner.into();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let result = pipeline.run(&job_id, &config, &owner).await;
            if let Err(e) = &result {
                warn!(job_id = %job_id, "Generation failed: {}", e);
            }
            result
        });

        Ok(Some(handle))
    }

    /// Subscribe to a job's progress, starting from its latest event.
    pub async fn subscribe_progress(&self, job_id: &JobId) -> ProgressSubscription {
        self.bus.subscribe(job_id).await
    }

    /// Render a completed job's video.
    pub async fn render_video(&self, job_id: &JobId) -> WorkerResult<PathBuf> {
        let record = self
            .jobs
            .load(job_id)
            .await?
            .ok_or_else(|| WorkerError::not_ready(format!("job {} does not exist", job_id)))?;

        let inputs = RenderInputs::from_record(&record).ok_or_else(|| {
            WorkerError::not_ready(format!("job {} is {}", job_id, record.status))
        })?;
        let inputs = self.refresh_asset_urls(&record, inputs).await?;

        self.coordinator.render(job_id, inputs).await
    }

    /// Re-sign the speech and captions URLs stored on the record.
    ///
    /// The stored URLs were signed when the stage ran and may have expired.
    /// The new ones stay valid for at least the render timeout.
    async fn refresh_asset_urls(
        &self,
        record: &JobRecord,
        inputs: RenderInputs,
    ) -> WorkerResult<RenderInputs> {
        let ttl = self.config.signed_url_ttl.max(self.config.render_timeout);

        let Some(speech) = record.speech.as_ref() else {
            return Ok(inputs);
        };
        let speech_url = self.storage.signed_url(&speech.key, ttl).await?;
        let captions_url = match record.captions.as_ref() {
            Some(captions) => Some(self.storage.signed_url(&captions.key, ttl).await?),
            None => None,
        };

        Ok(inputs.with_asset_urls(speech_url, captions_url))
    }

    /// Open a job's rendered video, if there is one.
    pub async fn get_rendered_file(&self, job_id: &JobId) -> WorkerResult<Option<RenderedFile>> {
        self.coordinator.get_file(job_id).await
    }

    /// Evict renders not accessed within `max_age`.
    pub async fn cleanup_old_renders(&self, max_age: Duration) -> WorkerResult<usize> {
        self.coordinator.cleanup(max_age).await
    }

    /// Periodically evict old renders and idle progress entries.
    pub fn spawn_cleanup_loop(&self) -> JoinHandle<()> {
        let coordinator = Arc::clone(&self.coordinator);
        let bus = self.bus.clone();
        let retention = self.config.render_retention;
        let snapshot_ttl = self.config.snapshot_ttl;
        let period = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match coordinator.cleanup(retention).await {
                    Ok(evicted) => debug!(evicted, "Render cleanup pass finished"),
                    Err(e) => warn!("Render cleanup failed: {}", e),
                }
                let idle = bus.evict_idle(snapshot_ttl);
                if idle > 0 {
                    debug!(idle, "Released idle progress entries");
                }
            }
        })
    }

    /// Stop accepting image work. Queued image requests fail.
    pub fn shutdown(&self) {
        self.image_queue.close();
    }
}

/// Marks a job as running until dropped.
struct RunningGuard {
    running: Arc<Mutex<HashSet<JobId>>>,
    job_id: JobId,
}

impl RunningGuard {
    fn acquire(running: &Arc<Mutex<HashSet<JobId>>>, job_id: &JobId) -> Option<Self> {
        if !running.lock().insert(job_id.clone()) {
            return None;
        }
        Some(Self {
            running: Arc::clone(running),
            job_id: job_id.clone(),
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.job_id);
    }
}
