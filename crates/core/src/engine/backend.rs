//! Backend selection and ONNX Runtime session construction.
//!
//! [`BackendKind`] is resolved once from the user's string; [`build_session`]
//! turns it into an `ort::Session` with the matching execution providers and,
//! for TensorRT, a persistent engine cache.

use std::path::Path;
use std::str::FromStr;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::cache::CacheEntry;
use super::tensor::Precision;
use crate::error::PipelineError;

const VULKAN_UNAVAILABLE: &str =
    "the vulkan backend has no ONNX Runtime execution provider in this build; use cuda, tensorrt or cpu";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Eager accelerator path: ONNX Runtime CUDA EP.
    #[default]
    Cuda,
    /// Ahead-of-time compiled graphs: TensorRT EP with engine cache.
    Tensorrt,
    /// Portable GPU compute. The pinned ONNX Runtime has no execution provider
    /// for it, so sessions for this backend are refused.
    Vulkan,
    Cpu,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [Self::Cuda, Self::Tensorrt, Self::Vulkan, Self::Cpu];

    pub fn uses_compiled_graphs(&self) -> bool {
        matches!(self, Self::Tensorrt)
    }

    /// Reject backends this build recognizes but cannot run.
    pub fn ensure_runnable(self) -> Result<Self, PipelineError> {
        match self {
            Self::Vulkan => Err(PipelineError::configuration(VULKAN_UNAVAILABLE)),
            other => Ok(other),
        }
    }
}

impl FromStr for BackendKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "pytorch" => Ok(Self::Cuda),
            "tensorrt" | "trt" => Ok(Self::Tensorrt),
            "vulkan" | "ncnn" => Ok(Self::Vulkan),
            "cpu" => Ok(Self::Cpu),
            _ => Err(PipelineError::UnsupportedBackend {
                requested: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Vulkan => write!(f, "vulkan"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceSelector {
    #[default]
    Default,
    Cpu,
    Cuda(i32),
}

impl DeviceSelector {
    pub fn device_id(&self) -> i32 {
        match self {
            Self::Cuda(id) => *id,
            Self::Default | Self::Cpu => 0,
        }
    }
}

impl FromStr for DeviceSelector {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "" | "default" | "auto" => Ok(Self::Default),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse::<i32>().ok())
                .filter(|id| *id >= 0)
                .map(Self::Cuda)
                .ok_or_else(|| {
                    PipelineError::configuration(format!(
                        "unknown device '{s}' (expected default, cpu, cuda or cuda:N)"
                    ))
                }),
        }
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

/// Compiled-graph tuning. Ignored by every backend except TensorRT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendTuning {
    pub workspace_size_mb: Option<u64>,
    pub max_aux_streams: Option<u32>,
    pub optimization_level: u8,
}

impl Default for BackendTuning {
    fn default() -> Self {
        Self {
            workspace_size_mb: None,
            max_aux_streams: None,
            optimization_level: 3,
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: BackendKind,
    pub device: DeviceSelector,
    pub precision: Precision,
    pub tuning: &'a BackendTuning,
    pub compiled_cache: Option<&'a CacheEntry>,
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }

    stats
}

/// Build an `ort::Session` for `config.backend`.
///
/// - `Tensorrt`: TRT EP with engine caching in the compiled-graph cache
///   directory, CUDA EP as fallback.
/// - `Cuda`: CUDA EP only, failing if it cannot be registered.
/// - `Cpu`: ONNX Runtime's built-in CPU provider.
/// - `Vulkan`: refused with a configuration error.
///
/// A `cpu` device selector forces the CPU provider regardless of backend.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    config.backend.ensure_runnable()?;
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let backend = if config.device == DeviceSelector::Cpu && config.backend != BackendKind::Cpu {
        warn!(
            backend = %config.backend,
            "Device 'cpu' requested; using the CPU provider"
        );
        BackendKind::Cpu
    } else {
        config.backend
    };

    let session = match backend {
        BackendKind::Tensorrt => build_tensorrt_session(builder, config)?,
        BackendKind::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; session creation will fail");
            }

            debug!(backend = "cuda", device = %config.device, "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(config.device.device_id())
                    .build()
                    .error_on_failure()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        BackendKind::Vulkan => bail!(PipelineError::configuration(VULKAN_UNAVAILABLE)),
        BackendKind::Cpu => {
            debug!(backend = %backend, "Building session with CPU provider");

            builder.commit_from_file(config.model_path).with_context(|| {
                format!("Failed to load ONNX model: {}", config.model_path.display())
            })?
        }
    };

    Ok(session)
}

fn build_tensorrt_session(
    builder: ort::session::builder::SessionBuilder,
    config: &SessionConfig<'_>,
) -> Result<Session> {
    let entry = config
        .compiled_cache
        .context("TensorRT sessions need a compiled graph cache entry")?;
    let cache_dir = entry.dir.as_path();
    let cache_path = cache_dir.to_string_lossy().to_string();
    let before = cache_stats(cache_dir);
    let started = Instant::now();

    info!(
        cache_dir = %cache_dir.display(),
        cache_files = before.file_count,
        cache_bytes = before.total_bytes,
        lookup = ?entry.lookup,
        "Initializing TensorRT session (first run may take several minutes)"
    );

    let (stop_tx, stop_rx) = channel::<()>();
    let cache_dir_for_log = cache_dir.display().to_string();
    let progress_thread = thread::spawn(move || {
        let tick = Duration::from_secs(15);
        let mut elapsed = 15_u64;
        loop {
            match stop_rx.recv_timeout(tick) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    info!(
                        elapsed_secs = elapsed,
                        cache_dir = %cache_dir_for_log,
                        "TensorRT engine build still in progress"
                    );
                    elapsed += 15;
                }
            }
        }
    });

    let mut trt = TensorRTExecutionProvider::default()
        .with_device_id(config.device.device_id())
        .with_engine_cache(true)
        .with_engine_cache_path(&cache_path)
        .with_timing_cache(true)
        .with_fp16(config.precision == Precision::Float16)
        .with_builder_optimization_level(config.tuning.optimization_level);
    if let Some(mb) = config.tuning.workspace_size_mb {
        trt = trt.with_max_workspace_size((mb as usize) << 20);
    }
    if let Some(streams) = config.tuning.max_aux_streams {
        trt = trt.with_auxiliary_streams(streams.min(i8::MAX as u32) as i8);
    }

    // The CUDA EP keeps inference working when libnvinfer is missing.
    let session_result = builder
        .with_execution_providers([
            trt.build(),
            CUDAExecutionProvider::default()
                .with_device_id(config.device.device_id())
                .build(),
        ])
        .context("failed to register TensorRT execution providers")
        .and_then(|builder| {
            builder.commit_from_file(config.model_path).with_context(|| {
                format!("Failed to load ONNX model: {}", config.model_path.display())
            })
        });

    let _ = stop_tx.send(());
    let _ = progress_thread.join();

    let elapsed = started.elapsed().as_secs_f64();
    let after = cache_stats(cache_dir);
    match session_result {
        Ok(session) => {
            entry.commit()?;
            let cache_updated =
                after.file_count > before.file_count || after.total_bytes > before.total_bytes;
            info!(
                elapsed_secs = elapsed,
                cache_dir = %cache_dir.display(),
                cache_files = after.file_count,
                cache_bytes = after.total_bytes,
                cache_updated,
                "TensorRT session ready"
            );
            Ok(session)
        }
        Err(error_value) => {
            error!(
                elapsed_secs = elapsed,
                cache_dir = %cache_dir.display(),
                cache_files_before = before.file_count,
                cache_files_after = after.file_count,
                error = %format!("{error_value:#}"),
                "TensorRT session initialization failed"
            );
            Err(error_value)
        }
    }
}

/// Whether a backend can run on this machine, as reported by `reframe backends`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendAvailability {
    pub backend: BackendKind,
    pub available: bool,
    pub detail: String,
}

pub fn backend_availability(kind: BackendKind) -> BackendAvailability {
    let (available, detail) = match kind {
        BackendKind::Cuda => match CUDAExecutionProvider::default().is_available() {
            Ok(true) => (true, "CUDA execution provider registered".to_string()),
            Ok(false) => (false, "CUDA execution provider missing from ONNX Runtime".to_string()),
            Err(e) => (false, format!("ONNX Runtime unavailable: {e}")),
        },
        BackendKind::Tensorrt => {
            let provider = TensorRTExecutionProvider::default().is_available();
            let version = crate::runtime::tensorrt_version();
            match (provider, version) {
                (Ok(true), Some(version)) => (true, format!("TensorRT {version}")),
                (Ok(true), None) => (
                    false,
                    "TensorRT provider present but libnvinfer was not found".to_string(),
                ),
                (Ok(false), _) => (
                    false,
                    "TensorRT execution provider missing from ONNX Runtime".to_string(),
                ),
                (Err(e), _) => (false, format!("ONNX Runtime unavailable: {e}")),
            }
        }
        BackendKind::Vulkan => (
            false,
            "no Vulkan execution provider in this ONNX Runtime build".to_string(),
        ),
        BackendKind::Cpu => (true, "built into ONNX Runtime".to_string()),
    };

    BackendAvailability {
        backend: kind,
        available,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str() {
        for (input, expected) in [
            ("cuda", BackendKind::Cuda),
            ("PyTorch", BackendKind::Cuda),
            ("tensorrt", BackendKind::Tensorrt),
            ("TRT", BackendKind::Tensorrt),
            ("vulkan", BackendKind::Vulkan),
            ("ncnn", BackendKind::Vulkan),
            ("cpu", BackendKind::Cpu),
        ] {
            assert_eq!(input.parse::<BackendKind>().expect(input), expected);
        }
    }

    #[test]
    fn test_unknown_backend_is_unsupported() {
        let err = "directml".parse::<BackendKind>().expect_err("unknown backend");
        assert!(matches!(
            err,
            PipelineError::UnsupportedBackend { ref requested } if requested == "directml"
        ));
        assert!("".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_display_round_trips() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.to_string().parse::<BackendKind>().expect("parse"), kind);
        }
    }

    #[test]
    fn test_device_selector_parse() {
        assert_eq!("default".parse::<DeviceSelector>().expect("default"), DeviceSelector::Default);
        assert_eq!("cpu".parse::<DeviceSelector>().expect("cpu"), DeviceSelector::Cpu);
        assert_eq!("cuda".parse::<DeviceSelector>().expect("cuda"), DeviceSelector::Cuda(0));
        assert_eq!("CUDA:1".parse::<DeviceSelector>().expect("cuda:1"), DeviceSelector::Cuda(1));
        assert!("cuda:x".parse::<DeviceSelector>().is_err());
        assert!("opencl".parse::<DeviceSelector>().is_err());
    }

    #[test]
    fn test_tuning_defaults() {
        let tuning = BackendTuning::default();
        assert_eq!(tuning.optimization_level, 3);
        assert!(tuning.workspace_size_mb.is_none());
    }

    #[test]
    fn test_cache_stats_counts_nested_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("nested")).expect("mkdir");
        std::fs::write(temp.path().join("a.engine"), b"1234").expect("write");
        std::fs::write(temp.path().join("nested/b.profile"), b"12").expect("write");
        let stats = cache_stats(temp.path());
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_bytes, 6);
    }

    #[test]
    fn test_cpu_available_and_vulkan_reported_missing() {
        assert!(backend_availability(BackendKind::Cpu).available);
        let vulkan = backend_availability(BackendKind::Vulkan);
        assert!(!vulkan.available);
        assert!(vulkan.detail.contains("no Vulkan execution provider"));
    }

    #[test]
    fn test_vulkan_is_refused_not_downgraded() {
        let err = BackendKind::Vulkan.ensure_runnable().expect_err("vulkan");
        assert!(matches!(err, PipelineError::Configuration(_)));
        for kind in [BackendKind::Cuda, BackendKind::Tensorrt, BackendKind::Cpu] {
            assert_eq!(kind.ensure_runnable().expect("runnable"), kind);
        }
    }

    #[test]
    fn test_unsupported_message_lists_every_accepted_name() {
        let message = "directml".parse::<BackendKind>().expect_err("unknown").to_string();
        for name in ["cuda", "pytorch", "tensorrt", "trt", "vulkan", "ncnn", "cpu"] {
            assert!(name.parse::<BackendKind>().is_ok(), "{name} should parse");
            assert!(message.contains(name), "{name} missing from '{message}'");
        }
    }
}
