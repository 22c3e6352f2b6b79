//! Inference engines: interpolation and upscaling behind one lifecycle-aware
//! wrapper.
//!
//! An [`InferenceEngine`] owns a backend-specific [`ModelRuntime`] and its
//! Loaded/Unloaded state behind a single mutex. Callers take an
//! [`EngineLease`] for each inference so a concurrent hot-unload waits for the
//! call in flight instead of pulling the session out from under it.

pub mod backend;
pub mod cache;
pub mod onnx;
pub mod tensor;
pub mod timestep;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::types::Frame;

use backend::{BackendKind, BackendTuning, DeviceSelector};
use tensor::{PaddedTensor, PaddingPlan, Precision};
use timestep::{classify_timestep, TimestepKind};

/// What a model can do. Each engine has exactly one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Interpolate,
    Upscale,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interpolate => write!(f, "interpolate"),
            Self::Upscale => write!(f, "upscale"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArch {
    Rife46,
    Rife47,
    Rife413,
    Rife420,
    Rife421,
    Upscale,
}

impl ModelArch {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Upscale => Capability::Upscale,
            _ => Capability::Interpolate,
        }
    }
}

impl FromStr for ModelArch {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| *c != '.' && *c != '_' && *c != '-')
            .collect();
        match normalized.as_str() {
            "rife46" => Ok(Self::Rife46),
            "rife47" => Ok(Self::Rife47),
            "rife413" => Ok(Self::Rife413),
            "rife420" => Ok(Self::Rife420),
            "rife421" => Ok(Self::Rife421),
            "upscale" | "sr" => Ok(Self::Upscale),
            _ => Err(PipelineError::configuration(format!(
                "unknown model architecture '{s}' (expected rife46, rife47, rife413, rife420, rife421 or upscale)"
            ))),
        }
    }
}

impl std::fmt::Display for ModelArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Rife46 => "rife46",
            Self::Rife47 => "rife47",
            Self::Rife413 => "rife413",
            Self::Rife420 => "rife420",
            Self::Rife421 => "rife421",
            Self::Upscale => "upscale",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineLifecycleState {
    Loaded,
    Unloaded,
}

/// Backend-specific model execution. Tensors passed in are already padded to
/// the owning engine's plan.
pub trait ModelRuntime: Send {
    fn interpolate(
        &mut self,
        _first: &PaddedTensor,
        _second: &PaddedTensor,
        _timestep: f32,
    ) -> Result<PaddedTensor> {
        bail!("this model does not support interpolation")
    }

    fn upscale(&mut self, _input: &PaddedTensor) -> Result<PaddedTensor> {
        bail!("this model does not support upscaling")
    }

    /// Integer spatial scale of the model's output (1 for interpolators).
    fn scale(&self) -> u32 {
        1
    }

    /// Drop accelerator-side state (sessions, device buffers).
    fn release(&mut self) -> Result<()>;

    /// Rebuild what `release` dropped.
    fn acquire(&mut self) -> Result<()>;
}

struct EngineInner {
    runtime: Box<dyn ModelRuntime>,
    state: EngineLifecycleState,
}

pub struct InferenceEngine {
    name: String,
    capability: Capability,
    plan: PaddingPlan,
    precision: Precision,
    ensemble: bool,
    scale: u32,
    inner: Mutex<EngineInner>,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .field("plan", &self.plan)
            .field("precision", &self.precision)
            .field("ensemble", &self.ensemble)
            .field("scale", &self.scale)
            .finish()
    }
}

impl InferenceEngine {
    /// Wrap an already-loaded runtime.
    pub fn from_runtime(
        name: impl Into<String>,
        capability: Capability,
        plan: PaddingPlan,
        precision: Precision,
        ensemble: bool,
        runtime: Box<dyn ModelRuntime>,
    ) -> Self {
        let scale = match capability {
            Capability::Interpolate => 1,
            Capability::Upscale => runtime.scale().max(1),
        };
        Self {
            name: name.into(),
            capability,
            plan,
            precision,
            ensemble,
            scale,
            inner: Mutex::new(EngineInner {
                runtime,
                state: EngineLifecycleState::Loaded,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn plan(&self) -> &PaddingPlan {
        &self.plan
    }

    pub fn output_plan(&self) -> PaddingPlan {
        self.plan.scaled(self.scale)
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn is_ensemble(&self) -> bool {
        self.ensemble
    }

    pub fn state(&self) -> EngineLifecycleState {
        self.lock().state
    }

    pub fn frame_to_tensor(&self, frame: &Frame) -> Result<PaddedTensor> {
        tensor::frame_to_padded(frame, &self.plan, self.precision)
    }

    pub fn tensor_to_frame(&self, tensor: &PaddedTensor) -> Result<Frame> {
        tensor::padded_to_frame(tensor)
    }

    /// Lock the engine for one inference. `None` while unloaded.
    pub fn lease(&self) -> Option<EngineLease<'_>> {
        let guard = self.lock();
        if guard.state == EngineLifecycleState::Loaded {
            Some(EngineLease {
                engine: self,
                guard,
            })
        } else {
            None
        }
    }

    pub fn interpolate(
        &self,
        first: &PaddedTensor,
        second: &PaddedTensor,
        timestep: f32,
    ) -> Result<PaddedTensor> {
        self.lease_or_err()?.interpolate(first, second, timestep)
    }

    pub fn upscale(&self, input: &PaddedTensor) -> Result<PaddedTensor> {
        self.lease_or_err()?.upscale(input)
    }

    /// Release accelerator resources. Returns `false` if already unloaded.
    pub fn hot_unload(&self) -> Result<bool> {
        let mut guard = self.lock();
        if guard.state == EngineLifecycleState::Unloaded {
            debug!(engine = %self.name, "Engine already unloaded");
            return Ok(false);
        }

        let started = Instant::now();
        guard
            .runtime
            .release()
            .with_context(|| format!("failed to unload engine '{}'", self.name))?;
        guard.state = EngineLifecycleState::Unloaded;

        info!(engine = %self.name, "Engine unloaded");
        debug!(
            engine = %self.name,
            elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Engine unload timing"
        );
        Ok(true)
    }

    /// Reacquire accelerator resources. Returns `false` if already loaded.
    pub fn hot_reload(&self) -> Result<bool> {
        let mut guard = self.lock();
        if guard.state == EngineLifecycleState::Loaded {
            debug!(engine = %self.name, "Engine already loaded");
            return Ok(false);
        }

        let started = Instant::now();
        guard
            .runtime
            .acquire()
            .with_context(|| format!("failed to reload engine '{}'", self.name))?;
        guard.state = EngineLifecycleState::Loaded;

        info!(engine = %self.name, "Engine reloaded");
        debug!(
            engine = %self.name,
            elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Engine reload timing"
        );
        Ok(true)
    }

    fn lease_or_err(&self) -> Result<EngineLease<'_>> {
        self.lease().ok_or_else(|| {
            PipelineError::EngineLifecycle {
                engine: self.name.clone(),
            }
            .into()
        })
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        // A panic mid-inference leaves the runtime usable for unload.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive access to a loaded engine for the duration of one call.
pub struct EngineLease<'a> {
    engine: &'a InferenceEngine,
    guard: MutexGuard<'a, EngineInner>,
}

impl EngineLease<'_> {
    pub fn interpolate(
        &mut self,
        first: &PaddedTensor,
        second: &PaddedTensor,
        timestep: f32,
    ) -> Result<PaddedTensor> {
        self.require(Capability::Interpolate)?;
        self.check_input(first)?;
        self.check_input(second)?;

        match classify_timestep(timestep) {
            TimestepKind::CopyFirst => return Ok(first.clone()),
            TimestepKind::CopySecond => return Ok(second.clone()),
            TimestepKind::Synthesize => {}
        }

        let runtime = &mut self.guard.runtime;
        let forward = runtime.interpolate(first, second, timestep)?;
        let output = if self.engine.ensemble {
            let backward = runtime.interpolate(second, first, 1.0 - timestep)?;
            forward.mean_with(&backward)?
        } else {
            forward
        };

        self.check_output(&output, &self.engine.plan)?;
        Ok(output)
    }

    pub fn upscale(&mut self, input: &PaddedTensor) -> Result<PaddedTensor> {
        self.require(Capability::Upscale)?;
        self.check_input(input)?;

        let output = self.guard.runtime.upscale(input)?;
        self.check_output(&output, &self.engine.output_plan())?;
        Ok(output)
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if self.engine.capability != capability {
            bail!(
                "engine '{}' does not support {capability} (it is an {} engine)",
                self.engine.name,
                self.engine.capability
            );
        }
        Ok(())
    }

    fn check_input(&self, tensor: &PaddedTensor) -> Result<()> {
        let plan = &self.engine.plan;
        if tensor.padded_width() != plan.padded_width()
            || tensor.padded_height() != plan.padded_height()
        {
            return Err(PipelineError::ShapeMismatch {
                expected: tensor_len(plan.padded_width(), plan.padded_height()),
                actual: tensor_len(tensor.padded_width(), tensor.padded_height()),
            })
            .with_context(|| format!("input tensor for engine '{}'", self.engine.name));
        }
        Ok(())
    }

    fn check_output(&self, tensor: &PaddedTensor, plan: &PaddingPlan) -> Result<()> {
        if tensor.padded_width() != plan.padded_width()
            || tensor.padded_height() != plan.padded_height()
            || tensor.width() != plan.width()
            || tensor.height() != plan.height()
        {
            bail!(
                "engine '{}' produced a {}x{} tensor, expected {}x{}",
                self.engine.name,
                tensor.padded_width(),
                tensor.padded_height(),
                plan.padded_width(),
                plan.padded_height()
            );
        }
        Ok(())
    }
}

fn tensor_len(width: u32, height: u32) -> usize {
    3 * width as usize * height as usize
}

/// Everything needed to construct an engine from a model file.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_path: PathBuf,
    pub arch: String,
    pub width: u32,
    pub height: u32,
    pub backend: String,
    pub device: String,
    pub precision: Precision,
    pub uhd: bool,
    pub ensemble: bool,
    pub tuning: BackendTuning,
    /// Root of the compiled-graph cache. Defaults to `engine_cache` next to the model.
    pub cache_dir: Option<PathBuf>,
    /// Upscale in overlapping tiles of this many pixels instead of whole frames.
    pub tile_size: Option<u32>,
}

impl EngineConfig {
    pub fn new(model_path: impl Into<PathBuf>, arch: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            model_path: model_path.into(),
            arch: arch.into(),
            width,
            height,
            backend: BackendKind::default().to_string(),
            device: DeviceSelector::default().to_string(),
            precision: Precision::default(),
            uhd: false,
            ensemble: false,
            tuning: BackendTuning::default(),
            cache_dir: None,
            tile_size: None,
        }
    }
}

/// Parsed and validated construction parameters.
#[derive(Debug, Clone)]
pub struct ResolvedEngineConfig {
    pub model_path: PathBuf,
    pub arch: ModelArch,
    pub backend: BackendKind,
    pub device: DeviceSelector,
    pub precision: Precision,
    pub plan: PaddingPlan,
    pub uhd: bool,
    pub ensemble: bool,
    pub tuning: BackendTuning,
    pub cache_dir: PathBuf,
    /// Upscale tile side, aligned to the upscale padding tile.
    pub tile_size: Option<u32>,
}

impl EngineConfig {
    /// Validate every field without touching the model file.
    pub fn resolve(&self) -> Result<ResolvedEngineConfig> {
        let backend = self.backend.parse::<BackendKind>()?.ensure_runnable()?;
        let arch: ModelArch = self.arch.parse()?;
        let device: DeviceSelector = self.device.parse()?;

        let tile = match arch.capability() {
            Capability::Interpolate => tensor::interpolation_tile(self.uhd),
            Capability::Upscale => tensor::UPSCALE_TILE,
        };
        let plan = PaddingPlan::new(self.width, self.height, tile)?;

        if self.ensemble && arch.capability() == Capability::Upscale {
            bail!(PipelineError::configuration(
                "ensemble mode only applies to interpolation models"
            ));
        }

        let tile_size = match (self.tile_size, arch.capability()) {
            (None, _) => None,
            (Some(0), _) => bail!(PipelineError::configuration("tile size must be non-zero")),
            (Some(_), Capability::Interpolate) => bail!(PipelineError::configuration(
                "tiling only applies to upscale models"
            )),
            (Some(size), Capability::Upscale) => {
                Some(size.div_ceil(tensor::UPSCALE_TILE) * tensor::UPSCALE_TILE)
            }
        };

        let cache_dir = self.cache_dir.clone().unwrap_or_else(|| {
            self.model_path
                .parent()
                .map(|dir| dir.join("engine_cache"))
                .unwrap_or_else(|| PathBuf::from("engine_cache"))
        });

        Ok(ResolvedEngineConfig {
            model_path: self.model_path.clone(),
            arch,
            backend,
            device,
            precision: self.precision,
            plan,
            uhd: self.uhd,
            ensemble: self.ensemble,
            tuning: self.tuning.clone(),
            cache_dir,
            tile_size,
        })
    }
}

/// Resolve `config`, load the model and return a Loaded engine.
pub fn build_engine(config: &EngineConfig) -> Result<InferenceEngine> {
    let resolved = config.resolve()?;
    let capability = resolved.arch.capability();

    info!(
        model = %resolved.model_path.display(),
        arch = %resolved.arch,
        backend = %resolved.backend,
        device = %resolved.device,
        precision = %resolved.precision,
        width = resolved.plan.width(),
        height = resolved.plan.height(),
        padded = %format!("{}x{}", resolved.plan.padded_width(), resolved.plan.padded_height()),
        ensemble = resolved.ensemble,
        uhd = resolved.uhd,
        tile_size = ?resolved.tile_size,
        "Building inference engine"
    );

    let runtime: Box<dyn ModelRuntime> = match capability {
        Capability::Interpolate => Box::new(onnx::OnnxInterpolator::load(&resolved)?),
        Capability::Upscale => Box::new(onnx::OnnxUpscaler::load(&resolved)?),
    };

    let name = format!("{}:{}", capability, resolved.arch);
    Ok(InferenceEngine::from_runtime(
        name,
        capability,
        resolved.plan,
        resolved.precision,
        resolved.ensemble,
        runtime,
    ))
}
