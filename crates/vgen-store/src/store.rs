//! Status store contract.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreResult;

/// Stream of raw messages received on a pub/sub channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Keyed store with pub/sub.
///
/// Values are opaque strings; typed access goes through [`get_json`] and
/// [`set_json`]. Implementations must be safe to share across tasks.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Get a value, `None` when absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set a value only if the key is absent. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// List keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Publish a message. Publishing to a channel nobody listens on is a no-op.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream>;
}

/// Read and deserialize a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StatusStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value.
pub async fn set_json<T: Serialize>(
    store: &dyn StatusStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> StoreResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl).await
}
