//! Object storage contract.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageResult;

/// Content types of the assets the pipeline stores.
pub mod content_types {
    pub const AUDIO_MPEG: &str = "audio/mpeg";
    pub const JSON: &str = "application/json";
    pub const VIDEO_MP4: &str = "video/mp4";
}

/// Blob store used for speech audio, captions and finished renders.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `data` under `key` and return its primary URL.
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<String>;

    /// Store a local file under `key` and return its primary URL.
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> StorageResult<String> {
        let data = tokio::fs::read(path).await?;
        self.put(key, data, content_type).await
    }

    /// Fetch an object's bytes.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Generate a time-limited URL for reading `key`.
    async fn signed_url(&self, key: &str, ttl: Duration) -> StorageResult<String>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;
}
