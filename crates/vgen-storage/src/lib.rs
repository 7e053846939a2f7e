//! Object storage for generated assets.
//!
//! This crate provides:
//! - The [`ObjectStorage`] contract (put/get/signed URL/delete)
//! - A Cloudflare R2 client over the S3 API
//! - An in-memory implementation for single-process use and tests

pub mod client;
pub mod error;
pub mod memory;
pub mod storage;

pub use client::{R2Client, R2Config};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryObjectStorage;
pub use storage::{content_types, ObjectStorage};
