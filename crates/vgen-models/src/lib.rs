//! Shared data models for the VGen short-video pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Job identity and generation requests
//! - Job records, stages and partial updates
//! - Render status records and renderer input payloads
//! - Progress events relayed to subscribers

pub mod job;
pub mod progress;
pub mod record;
pub mod render;

// Re-export common types
pub use job::{GenerationConfig, JobId};
pub use progress::{ProgressEvent, ProgressStatus};
pub use record::{
    CaptionWord, CaptionsAsset, JobPatch, JobRecord, JobStatus, Scene, Script, SpeechAsset, Stage,
};
pub use render::{RenderInputs, RenderStatus, RenderStatusRecord};
