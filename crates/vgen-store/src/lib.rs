//! Keyed status store with pub/sub.
//!
//! This crate provides:
//! - The [`StatusStore`] contract (get/set with TTL, set-if-absent, scan, pub/sub)
//! - An in-process [`MemoryStore`] and a Redis-backed [`RedisStore`]
//! - Typed repositories for job records and render status records

pub mod error;
pub mod memory;
pub mod redis_store;
pub mod repos;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use repos::{JobRepository, RenderRepository};
pub use store::{MessageStream, StatusStore};
