//! External generators and the video renderer.
//!
//! This crate provides:
//! - Contracts for the script, speech, image and caption generators
//! - The renderer contract and its progress reports
//! - `GatewayClient`, an HTTP client for a generation gateway
//! - `CommandRenderer`, which drives an external render process

pub mod error;
pub mod gateway;
pub mod renderer;
pub mod traits;

pub use error::{ProviderError, ProviderResult};
pub use gateway::{GatewayClient, GatewayConfig};
pub use renderer::{CommandRenderer, CommandRendererConfig};
pub use traits::{
    CaptionGenerator, ImageGenerator, RenderProgress, RenderRequest, Renderer, ScriptGenerator,
    SpeechSynthesizer,
};
