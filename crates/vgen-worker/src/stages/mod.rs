//! Stage executors and the fixed stage table.
//!
//! Each stage reads the current [`JobRecord`] and returns a [`JobPatch`]
//! with the artifacts it produced. Executors never write the record; the
//! pipeline persists their output.

mod captions;
mod images;
mod script;
mod speech;

use std::sync::Arc;

use async_trait::async_trait;

use vgen_models::{JobPatch, JobRecord, Stage};
use vgen_providers::{CaptionGenerator, ImageGenerator, ScriptGenerator, SpeechSynthesizer};
use vgen_queue::{ProgressBus, RateLimitedQueue};
use vgen_storage::ObjectStorage;

use crate::config::WorkerConfig;
use crate::error::WorkerError;

pub use captions::CaptionsStage;
pub use images::ImagesStage;
pub use script::ScriptStage;
pub use speech::SpeechStage;

/// A stage failure, with any artifacts produced before it failed.
#[derive(Debug)]
pub struct StageFailure {
    pub error: WorkerError,
    /// Checkpoint to persist together with the failure
    pub partial: Option<JobPatch>,
}

impl StageFailure {
    pub fn with_partial(error: WorkerError, partial: JobPatch) -> Self {
        Self {
            error,
            partial: (!partial.is_empty()).then_some(partial),
        }
    }
}

impl From<WorkerError> for StageFailure {
    fn from(error: WorkerError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

pub type StageResult = Result<JobPatch, StageFailure>;

/// One pipeline stage.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Produce the stage's artifacts for `record`.
    async fn execute(&self, record: &JobRecord) -> StageResult;
}

/// Overall progress span (start, end) of a stage, out of 100.
///
/// Generation covers 0-50; rendering takes the upper half.
pub fn progress_range(stage: Stage) -> (u8, u8) {
    match stage {
        Stage::Script => (0, 10),
        Stage::Speech => (10, 20),
        Stage::Images => (20, 45),
        Stage::Captions => (45, 50),
    }
}

/// Human readable description of a stage starting.
pub fn start_message(stage: Stage) -> &'static str {
    match stage {
        Stage::Script => "Writing script",
        Stage::Speech => "Synthesizing narration",
        Stage::Images => "Generating images",
        Stage::Captions => "Generating captions",
    }
}

/// External generators used by the stages.
#[derive(Clone)]
pub struct Providers {
    pub script: Arc<dyn ScriptGenerator>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub images: Arc<dyn ImageGenerator>,
    pub captions: Arc<dyn CaptionGenerator>,
}

impl Providers {
    /// Use one client for every generator.
    pub fn from_client<C>(client: Arc<C>) -> Self
    where
        C: ScriptGenerator + SpeechSynthesizer + ImageGenerator + CaptionGenerator + 'static,
    {
        Self {
            script: client.clone(),
            speech: client.clone(),
            images: client.clone(),
            captions: client,
        }
    }
}

/// Stage executors indexed by [`Stage`], built once at start-up.
pub struct StageTable {
    executors: [Box<dyn StageExecutor>; 4],
}

impl StageTable {
    pub fn new(
        providers: Providers,
        storage: Arc<dyn ObjectStorage>,
        image_queue: Arc<RateLimitedQueue>,
        bus: ProgressBus,
        config: &WorkerConfig,
    ) -> Self {
        let executors: [Box<dyn StageExecutor>; 4] = [
            Box::new(ScriptStage::new(providers.script)),
            Box::new(SpeechStage::new(
                providers.speech,
                storage.clone(),
                config.signed_url_ttl,
            )),
            Box::new(ImagesStage::new(
                providers.images,
                image_queue,
                bus,
                config.image_batch_size,
            )),
            Box::new(CaptionsStage::new(
                providers.captions,
                storage,
                config.signed_url_ttl,
                config.captions_required,
            )),
        ];
        Self { executors }
    }

    /// Replace the executor for the stage `executor` handles.
    pub fn with_executor(mut self, executor: Box<dyn StageExecutor>) -> Self {
        let index = executor.stage().index();
        self.executors[index] = executor;
        self
    }

    pub fn get(&self, stage: Stage) -> &dyn StageExecutor {
        self.executors[stage.index()].as_ref()
    }
}
