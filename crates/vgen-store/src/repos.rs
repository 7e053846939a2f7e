//! Typed repositories for job records and render status records.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info, warn};

use vgen_models::{GenerationConfig, JobId, JobPatch, JobRecord, RenderStatusRecord};

use crate::error::{StoreError, StoreResult};
use crate::store::{get_json, set_json, StatusStore};

/// Repository for job records.
///
/// `save` is a merge-update: callers pass only the fields that changed.
#[derive(Clone)]
pub struct JobRepository {
    store: Arc<dyn StatusStore>,
}

impl JobRepository {
    /// Create a new job repository.
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    fn key(job_id: &JobId) -> String {
        format!("job:{}", job_id)
    }

    /// Load a job record.
    pub async fn load(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        get_json(self.store.as_ref(), &Self::key(job_id)).await
    }

    /// Load the record for `job_id`, creating a pending one if none exists.
    pub async fn create_if_absent(
        &self,
        job_id: &JobId,
        owner: &str,
        config: &GenerationConfig,
    ) -> StoreResult<JobRecord> {
        let record = JobRecord::new(job_id.clone(), owner, config.clone());
        let raw = serde_json::to_string(&record)?;

        if self.store.set_if_absent(&Self::key(job_id), &raw).await? {
            counter!("vgen_store_writes_total", "record" => "job").increment(1);
            info!(job_id = %job_id, "Created job record");
            return Ok(record);
        }

        debug!(job_id = %job_id, "Job record already exists");
        self.load(job_id)
            .await?
            .ok_or_else(|| StoreError::not_found(Self::key(job_id)))
    }

    /// Merge `patch` into the stored record and return the result.
    pub async fn save(&self, job_id: &JobId, patch: JobPatch) -> StoreResult<JobRecord> {
        let mut record = self
            .load(job_id)
            .await?
            .ok_or_else(|| StoreError::not_found(Self::key(job_id)))?;

        record.apply(patch);
        set_json(self.store.as_ref(), &Self::key(job_id), &record, None).await?;
        counter!("vgen_store_writes_total", "record" => "job").increment(1);

        debug!(job_id = %job_id, status = %record.status, "Saved job record");
        Ok(record)
    }
}

/// Repository for render status records.
#[derive(Clone)]
pub struct RenderRepository {
    store: Arc<dyn StatusStore>,
}

impl RenderRepository {
    const PREFIX: &'static str = "render:";

    /// Create a new render repository.
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    fn key(job_id: &JobId) -> String {
        format!("{}{}", Self::PREFIX, job_id)
    }

    /// Get the render record for a job.
    pub async fn get(&self, job_id: &JobId) -> StoreResult<Option<RenderStatusRecord>> {
        get_json(self.store.as_ref(), &Self::key(job_id)).await
    }

    /// Write a render record.
    pub async fn put(&self, record: &RenderStatusRecord) -> StoreResult<()> {
        set_json(self.store.as_ref(), &Self::key(&record.job_id), record, None).await?;
        counter!("vgen_store_writes_total", "record" => "render").increment(1);
        Ok(())
    }

    /// Delete the render record for a job.
    pub async fn delete(&self, job_id: &JobId) -> StoreResult<()> {
        self.store.delete(&Self::key(job_id)).await
    }

    /// List every render record. Unreadable entries are skipped.
    pub async fn list(&self) -> StoreResult<Vec<RenderStatusRecord>> {
        let keys = self.store.scan_prefix(Self::PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            match get_json::<RenderStatusRecord>(self.store.as_ref(), &key).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(key = key.as_str(), "Skipping unreadable render record: {}", e),
            }
        }

        Ok(records)
    }
}
