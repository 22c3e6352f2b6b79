use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::channel::DEFAULT_CHANNEL_CAPACITY;
use crate::engine::backend::{BackendKind, BackendTuning, DeviceSelector};
use crate::engine::tensor::Precision;
use crate::pipeline::PipelineConfig;
use crate::scene_cut::{SceneCutMethod, DEFAULT_SENSITIVITY};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "REFRAME_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub pipeline: PipelineSection,
    pub inference: InferenceConfig,
    pub scene_detect: SceneDetectConfig,
    pub encoder: EncoderSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub engine_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineSection {
    pub channel_capacity: usize,
    pub pause_poll_ms: u64,
    pub render_idle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: String,
    pub device: String,
    pub precision: Precision,
    pub trt_optimization_level: u8,
    /// MiB; unset leaves the TensorRT default.
    pub trt_workspace_size: Option<u64>,
    pub trt_max_aux_streams: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SceneDetectConfig {
    pub method: SceneCutMethod,
    pub sensitivity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EncoderSection {
    pub codec: String,
    pub crf: u32,
    pub pixel_format: String,
    pub preset: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            engine_cache_dir: PathBuf::from("engine_cache"),
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            pause_poll_ms: 1000,
            render_idle_ms: 1000,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default().to_string(),
            device: DeviceSelector::default().to_string(),
            precision: Precision::default(),
            trt_optimization_level: BackendTuning::default().optimization_level,
            trt_workspace_size: None,
            trt_max_aux_streams: None,
        }
    }
}

impl Default for SceneDetectConfig {
    fn default() -> Self {
        Self {
            method: SceneCutMethod::default(),
            sensitivity: DEFAULT_SENSITIVITY,
        }
    }
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            crf: 18,
            pixel_format: "yuv420p".to_string(),
            preset: None,
        }
    }
}

impl PipelineSection {
    pub fn to_pipeline_config(&self, factor: f64) -> PipelineConfig {
        PipelineConfig {
            channel_capacity: self.channel_capacity.max(1),
            factor,
            pause_poll: Duration::from_millis(self.pause_poll_ms.max(1)),
            render_idle: Duration::from_millis(self.render_idle_ms.max(1)),
        }
    }
}

impl InferenceConfig {
    pub fn tuning(&self) -> BackendTuning {
        BackendTuning {
            workspace_size_mb: self.trt_workspace_size,
            max_aux_streams: self.trt_max_aux_streams,
            optimization_level: self.trt_optimization_level,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// CLI override, then `REFRAME_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` and write a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
