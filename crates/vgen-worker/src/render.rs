//! Render coordinator.
//!
//! Renders each job's video at most once and re-serves it afterwards.
//!
//! Deduplication happens at two levels:
//! - in process, concurrent callers for one job share a single render task
//!   and all receive its result
//! - across processes, a fresh `pending` render record means another worker
//!   owns the render and the caller gets [`WorkerError::DuplicateRender`]
//!
//! The cross-process check is a read followed by a write, so it narrows the
//! window for duplicate renders without closing it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn, Instrument};

use vgen_models::progress::STAGE_RENDER;
use vgen_models::{JobId, ProgressEvent, RenderInputs, RenderStatus, RenderStatusRecord};
use vgen_providers::{RenderProgress, RenderRequest, Renderer};
use vgen_queue::ProgressBus;
use vgen_storage::{content_types, ObjectStorage};
use vgen_store::RenderRepository;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;

/// Progress at which rendering starts; generation covers the lower half.
const RENDER_PROGRESS_START: u8 = 50;

/// Outcome of a render, shared with every caller waiting on it.
type RenderOutcome = Result<PathBuf, Arc<WorkerError>>;

/// A rendered video opened for streaming.
#[derive(Debug)]
pub struct RenderedFile {
    pub path: PathBuf,
    pub file: tokio::fs::File,
    pub size: u64,
}

/// Coordinates renders and owns render status records.
pub struct RenderCoordinator {
    renders: RenderRepository,
    bus: ProgressBus,
    renderer: Arc<dyn Renderer>,
    /// Set when finished renders are also uploaded
    upload: Option<Arc<dyn ObjectStorage>>,
    render_dir: PathBuf,
    composition_id: String,
    render_timeout: Duration,
    in_flight: Mutex<HashMap<JobId, broadcast::Sender<RenderOutcome>>>,
}

impl RenderCoordinator {
    pub fn new(
        renders: RenderRepository,
        bus: ProgressBus,
        renderer: Arc<dyn Renderer>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            renders,
            bus,
            renderer,
            upload: None,
            render_dir: config.render_dir.clone(),
            composition_id: config.composition_id.clone(),
            render_timeout: config.render_timeout,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Upload finished renders to `storage` as well.
    pub fn with_upload(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.upload = Some(storage);
        self
    }

    fn output_path(&self, job_id: &JobId) -> PathBuf {
        self.render_dir.join(format!("{}.mp4", job_id))
    }

    fn remote_key(job_id: &JobId) -> String {
        format!("renders/{}.mp4", job_id)
    }

    /// Pending records older than this belong to a dead render.
    fn abandon_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.render_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1))
    }

    /// Whether a render for `job_id` is running in this process.
    pub fn is_rendering(&self, job_id: &JobId) -> bool {
        self.in_flight.lock().contains_key(job_id)
    }

    /// Render the video for `job_id`, or return the existing output.
    ///
    /// Concurrent calls for the same job wait on one render. The render runs
    /// on its own task, so it completes even if every caller goes away.
    pub async fn render(self: &Arc<Self>, job_id: &JobId, inputs: RenderInputs) -> WorkerResult<PathBuf> {
        if let Some(path) = self.existing_output(job_id).await? {
            debug!(job_id = %job_id, path = %path.display(), "Serving existing render");
            metrics::record_render_deduplicated("existing");
            return Ok(path);
        }

        let mut outcome = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.entry(job_id.clone()) {
                Entry::Occupied(entry) => {
                    info!(job_id = %job_id, "Joining in-flight render");
                    metrics::record_render_deduplicated("in_flight");
                    entry.get().subscribe()
                }
                Entry::Vacant(entry) => {
                    let (sender, receiver) = broadcast::channel(1);
                    entry.insert(sender.clone());

                    let coordinator = Arc::clone(self);
                    let job_id = job_id.clone();
                    tokio::spawn(async move {
                        let result = coordinator.run_render(&job_id, inputs).await.map_err(Arc::new);
                        coordinator.in_flight.lock().remove(&job_id);
                        // No receivers left is fine; the record holds the result
                        let _ = sender.send(result);
                    });
                    receiver
                }
            }
        };

        match outcome.recv().await {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(e)) => Err(WorkerError::Shared(e)),
            Err(_) => Err(WorkerError::Io(std::io::Error::other(
                "render task ended without a result",
            ))),
        }
    }

    /// Path of a completed render whose file still exists.
    async fn existing_output(&self, job_id: &JobId) -> WorkerResult<Option<PathBuf>> {
        let Some(record) = self.renders.get(job_id).await? else {
            return Ok(None);
        };
        Ok(completed_file(&record).await)
    }

    async fn run_render(&self, job_id: &JobId, inputs: RenderInputs) -> WorkerResult<PathBuf> {
        let logger = JobLogger::new(job_id, "render");
        let span = logger.create_span();

        async {
            let mut record = match self.claim(job_id).await {
                Ok(Claim::Existing(path)) => {
                    metrics::record_render_deduplicated("existing");
                    return Ok(path);
                }
                Ok(Claim::Start(record)) => record,
                // Another worker owns the render; its events reach subscribers
                Err(e @ WorkerError::DuplicateRender(_)) => {
                    logger.log_warning(&e.to_string());
                    return Err(e);
                }
                Err(e) => return Err(self.fail(job_id, None, e, &logger).await),
            };

            metrics::record_render_started();
            logger.log_start(&format!("composition={}", self.composition_id));
            self.bus
                .publish(
                    ProgressEvent::info(job_id, STAGE_RENDER, "Rendering video")
                        .with_progress(RENDER_PROGRESS_START),
                )
                .await;

            let started = Instant::now();
            let (path, remote_url) = match self.execute(job_id, inputs).await {
                Ok(output) => output,
                Err(e) => return Err(self.fail(job_id, Some(record), e, &logger).await),
            };

            record.complete(path.to_string_lossy(), remote_url);
            if let Err(e) = self.renders.put(&record).await {
                return Err(self.fail(job_id, None, e.into(), &logger).await);
            }

            let elapsed = started.elapsed();
            metrics::record_render_completed(elapsed.as_secs_f64());
            logger.log_completion(&format!("{} in {:.1}s", path.display(), elapsed.as_secs_f64()));
            self.bus
                .publish(ProgressEvent::complete(job_id, "Video ready"))
                .await;

            Ok(path)
        }
        .instrument(span)
        .await
    }

    /// Decide whether this call performs the render and mark it pending.
    async fn claim(&self, job_id: &JobId) -> WorkerResult<Claim> {
        if let Some(existing) = self.renders.get(job_id).await? {
            if let Some(path) = completed_file(&existing).await {
                return Ok(Claim::Existing(path));
            }
            if existing.status == RenderStatus::Pending
                && !existing.is_abandoned(self.abandon_after(), Utc::now())
            {
                return Err(WorkerError::DuplicateRender(job_id.to_string()));
            }
            if existing.status == RenderStatus::Pending {
                warn!(job_id = %job_id, "Taking over abandoned render");
            }
        }

        let record = RenderStatusRecord::pending(job_id.clone());
        self.renders.put(&record).await?;
        Ok(Claim::Start(record))
    }

    /// Run the renderer under the render timeout and forward its progress.
    async fn execute(
        &self,
        job_id: &JobId,
        inputs: RenderInputs,
    ) -> WorkerResult<(PathBuf, Option<String>)> {
        tokio::fs::create_dir_all(&self.render_dir).await?;

        let request = RenderRequest {
            composition_id: self.composition_id.clone(),
            inputs,
            output_path: self.output_path(job_id),
        };
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let render = async {
            match tokio::time::timeout(self.render_timeout, self.renderer.render(request, progress_tx))
                .await
            {
                Ok(result) => result.map_err(WorkerError::from),
                Err(_) => Err(WorkerError::timeout("render", self.render_timeout)),
            }
        };
        tokio::pin!(render);

        // Progress is forwarded until the render itself resolves. A renderer
        // may leave senders behind (e.g. a reader task on an orphaned pipe),
        // so the channel closing is not a completion signal.
        let mut last = None;
        let result = loop {
            tokio::select! {
                result = &mut render => break result,
                Some(update) = progress_rx.recv() => {
                    self.forward_progress(job_id, update, &mut last).await;
                }
            }
        };
        while let Ok(update) = progress_rx.try_recv() {
            self.forward_progress(job_id, update, &mut last).await;
        }
        drop(progress_rx);
        let path = result?;

        let remote_url = match &self.upload {
            Some(storage) => self.upload_render(storage.as_ref(), job_id, &path).await,
            None => None,
        };

        Ok((path, remote_url))
    }

    async fn upload_render(
        &self,
        storage: &dyn ObjectStorage,
        job_id: &JobId,
        path: &Path,
    ) -> Option<String> {
        let key = Self::remote_key(job_id);
        match storage.put_file(&key, path, content_types::VIDEO_MP4).await {
            Ok(url) => {
                info!(job_id = %job_id, key = key.as_str(), "Uploaded render");
                Some(url)
            }
            Err(e) => {
                // The local file still serves the video
                warn!(job_id = %job_id, "Render upload failed: {}", e);
                None
            }
        }
    }

    /// Map renderer progress into the 50-99 range of overall progress.
    ///
    /// 100 is reserved for the final COMPLETE event. Updates that do not
    /// change the whole-number percentage are dropped.
    async fn forward_progress(&self, job_id: &JobId, update: RenderProgress, last: &mut Option<u8>) {
        let span = f64::from(100 - RENDER_PROGRESS_START);
        let overall = (f64::from(RENDER_PROGRESS_START) + update.fraction() * span).floor() as u8;
        let overall = overall.min(99);
        if *last == Some(overall) {
            return;
        }
        *last = Some(overall);

        let message = if update.stage.is_empty() {
            "Rendering video".to_string()
        } else {
            format!("Rendering video ({})", update.stage)
        };
        self.bus
            .publish(
                ProgressEvent::info(job_id, STAGE_RENDER, message)
                    .with_progress(overall)
                    .with_detail("renderedFrames", update.rendered_frames)
                    .with_detail("encodedFrames", update.encoded_frames),
            )
            .await;
    }

    /// Persist a render failure and publish its error event.
    async fn fail(
        &self,
        job_id: &JobId,
        record: Option<RenderStatusRecord>,
        error: WorkerError,
        logger: &JobLogger,
    ) -> WorkerError {
        let message = error.to_string();
        logger.log_error(&message);

        let mut record = record.unwrap_or_else(|| RenderStatusRecord::pending(job_id.clone()));
        record.fail(message.as_str());
        if let Err(e) = self.renders.put(&record).await {
            logger.log_warning(&format!("could not persist render failure: {}", e));
        }

        metrics::record_render_failed(error.kind());
        self.bus
            .publish(ProgressEvent::error(job_id, STAGE_RENDER, message))
            .await;
        error
    }

    /// Open the rendered file for streaming and record the access.
    ///
    /// Returns `None` when there is no completed render or its file is gone.
    pub async fn get_file(&self, job_id: &JobId) -> WorkerResult<Option<RenderedFile>> {
        let Some(mut record) = self.renders.get(job_id).await? else {
            return Ok(None);
        };
        if record.status != RenderStatus::Completed {
            return Ok(None);
        }
        let Some(path) = record.path.clone().map(PathBuf::from) else {
            return Ok(None);
        };

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(job_id = %job_id, path = %path.display(), "Rendered file missing");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        record.touch();
        self.renders.put(&record).await?;

        Ok(Some(RenderedFile { path, file, size }))
    }

    /// Evict renders not accessed within `max_age`. Returns how many were removed.
    ///
    /// Renders that are still running are never evicted.
    pub async fn cleanup(&self, max_age: Duration) -> WorkerResult<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| WorkerError::validation(format!("invalid max age: {}", e)))?;
        let abandon_after = self.abandon_after();
        let now = Utc::now();
        let mut evicted = 0;

        for record in self.renders.list().await? {
            if !record.is_expired(max_age, now) {
                continue;
            }
            if record.status == RenderStatus::Pending && !record.is_abandoned(abandon_after, now) {
                continue;
            }
            if self.is_rendering(&record.job_id) {
                continue;
            }

            if let Some(path) = &record.path {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(job_id = %record.job_id, path = path.as_str(), "Failed to remove render: {}", e);
                        continue;
                    }
                }
            }

            if let (Some(_), Some(storage)) = (&record.remote_url, &self.upload) {
                if let Err(e) = storage.delete(&Self::remote_key(&record.job_id)).await {
                    warn!(job_id = %record.job_id, "Failed to delete uploaded render: {}", e);
                }
            }

            if let Err(e) = self.renders.delete(&record.job_id).await {
                warn!(job_id = %record.job_id, "Failed to delete render record: {}", e);
                continue;
            }

            debug!(job_id = %record.job_id, "Evicted render");
            evicted += 1;
        }

        if evicted > 0 {
            metrics::record_renders_evicted(evicted);
            info!(evicted, "Render cleanup complete");
        }
        Ok(evicted)
    }
}

enum Claim {
    /// A completed render with a live file
    Existing(PathBuf),
    /// This call performs the render
    Start(RenderStatusRecord),
}

async fn completed_file(record: &RenderStatusRecord) -> Option<PathBuf> {
    if record.status != RenderStatus::Completed {
        return None;
    }
    let path = PathBuf::from(record.path.as_deref()?);
    match tokio::fs::try_exists(&path).await {
        Ok(true) => Some(path),
        _ => None,
    }
}
