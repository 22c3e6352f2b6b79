//! Typed failures raised by the pipeline core.
//!
//! Operations return `anyhow::Result` and attach stage/frame context on the way
//! up; callers that need to branch on the failure kind downcast to
//! [`PipelineError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad architecture tag, factor, resolution or scene-cut method. Raised
    /// before any worker starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported backend '{requested}' (expected one of: cuda, pytorch, tensorrt, trt, vulkan, ncnn, cpu)")]
    UnsupportedBackend { requested: String },

    /// Decoder or encoder pipe closed or failed.
    #[error("{stage} stream failed: {message}")]
    StreamIo { stage: &'static str, message: String },

    #[error("frame shape mismatch: expected {expected} bytes, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("stream changed mid-run: expected {expected}, got {actual}")]
    UnsupportedStreamChange { expected: String, actual: String },

    /// Inference was requested while the engine's accelerator state was released.
    #[error("engine '{engine}' was used while unloaded")]
    EngineLifecycle { engine: String },
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn stream_io(stage: &'static str, message: impl std::fmt::Display) -> Self {
        Self::StreamIo {
            stage,
            message: message.to_string(),
        }
    }

    /// Fatal errors abort the run; stream errors only stop the affected loop
    /// and let peers drain.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::StreamIo { .. })
    }
}

/// Find the typed failure behind an `anyhow` chain, if any.
pub fn classify(error: &anyhow::Error) -> Option<&PipelineError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
}
