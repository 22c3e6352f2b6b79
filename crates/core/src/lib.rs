//! Streaming frame interpolation and upscaling core for reframe.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod media;
pub mod pause;
pub mod pipeline;
pub mod runtime;
pub mod scene_cut;
pub mod types;

pub use error::PipelineError;
