//! Script stage: topic to ordered scene list.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use vgen_models::{JobPatch, JobRecord, Script, Stage};
use vgen_providers::{ProviderError, ScriptGenerator};

use super::{StageExecutor, StageResult};
use crate::error::WorkerError;

pub struct ScriptStage {
    generator: Arc<dyn ScriptGenerator>,
}

impl ScriptStage {
    pub fn new(generator: Arc<dyn ScriptGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl StageExecutor for ScriptStage {
    fn stage(&self) -> Stage {
        Stage::Script
    }

    async fn execute(&self, record: &JobRecord) -> StageResult {
        let scenes = self
            .generator
            .generate_script(&record.config)
            .await
            .map_err(WorkerError::from)?;

        if scenes.is_empty() {
            return Err(WorkerError::from(ProviderError::invalid_response(
                "script generator returned no scenes",
            ))
            .into());
        }

        let script = Script::new(scenes);
        info!(
            job_id = %record.job_id,
            script_id = script.script_id.as_str(),
            scenes = script.scenes.len(),
            "Script generated"
        );
        Ok(JobPatch::default().with_script(script))
    }
}
