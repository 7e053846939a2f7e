//! Short video generation worker.
//!
//! This crate provides:
//! - The stage pipeline (script, speech, images, captions) with resumable checkpoints
//! - The render coordinator with per-job deduplication and file eviction
//! - `GenerationService`, the boundary used by callers and the binary
//! - Worker configuration, error taxonomy, logging and metrics

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod render;
pub mod service;
pub mod stages;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use pipeline::{PipelineConfig, StagePipeline};
pub use render::{RenderCoordinator, RenderedFile};
pub use service::{GenerationHandle, GenerationService};
pub use stages::{Providers, StageExecutor, StageFailure, StageResult, StageTable};
