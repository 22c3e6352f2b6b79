//! ONNX Runtime model runtimes for RIFE-style interpolation and single-image
//! super-resolution.
//!
//! Two interpolation model layouts are supported:
//! - **Three-input**: separate `img0`, `img1`, `timestep` tensors
//! - **Concatenated**: a single `input` tensor of shape `[1, 7, H, W]`, channels
//!   `[img0_rgb(3) + img1_rgb(3) + timestep_broadcast(1)]`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4, ArrayD, Ix4};
use ort::session::Session;
use ort::value::{DynValue, Tensor};
use tracing::{debug, info};

use super::backend::{build_session, BackendKind, BackendTuning, DeviceSelector, SessionConfig};
use super::cache::{CacheEntry, CompiledGraphCache, CompiledGraphKey};
use super::tensor::{self, PaddedTensor, Precision};
use super::{ModelRuntime, ResolvedEngineConfig};

const INPUT_IMG0: &str = "img0";
const INPUT_IMG1: &str = "img1";
const INPUT_TIMESTEP: &str = "timestep";
const INPUT_CONCAT: &str = "input";
const OUTPUT_NAME: &str = "output";

/// Side length of the sample image used when the model does not declare a
/// static output shape.
const SCALE_SAMPLE_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    ThreeInput,
    Concatenated,
}

/// Everything needed to (re)open a session after a hot-unload.
struct SessionSource {
    model_path: PathBuf,
    backend: BackendKind,
    device: DeviceSelector,
    precision: Precision,
    tuning: BackendTuning,
    compiled_cache: Option<CacheEntry>,
}

impl SessionSource {
    fn new(resolved: &ResolvedEngineConfig) -> Result<Self> {
        let compiled_cache = if resolved.backend.uses_compiled_graphs() {
            let key = compiled_graph_key(resolved);
            Some(CompiledGraphCache::new(&resolved.cache_dir).prepare(&key)?)
        } else {
            None
        };

        Ok(Self {
            model_path: resolved.model_path.clone(),
            backend: resolved.backend,
            device: resolved.device,
            precision: resolved.precision,
            tuning: resolved.tuning.clone(),
            compiled_cache,
        })
    }

    fn open(&self) -> Result<Session> {
        if !self.model_path.is_file() {
            bail!("model file not found: {}", self.model_path.display());
        }
        build_session(&SessionConfig {
            model_path: &self.model_path,
            backend: self.backend,
            device: self.device,
            precision: self.precision,
            tuning: &self.tuning,
            compiled_cache: self.compiled_cache.as_ref(),
        })
    }

    fn uses_iobinding(&self) -> bool {
        self.backend != BackendKind::Cpu && self.device != DeviceSelector::Cpu
    }
}

/// Spatial extent of the tensors the session is fed: the padded frame, or one
/// tile window when upscaling in tiles.
fn model_input_extent(resolved: &ResolvedEngineConfig) -> (u32, u32) {
    let plan = &resolved.plan;
    match resolved.tile_size {
        Some(tile) => (
            tensor::tile_window(plan.padded_width() as usize, tile as usize, tensor::TILE_OVERLAP)
                as u32,
            tensor::tile_window(plan.padded_height() as usize, tile as usize, tensor::TILE_OVERLAP)
                as u32,
        ),
        None => (plan.padded_width(), plan.padded_height()),
    }
}

fn compiled_graph_key(resolved: &ResolvedEngineConfig) -> CompiledGraphKey {
    let (padded_width, padded_height) = model_input_extent(resolved);
    let model = resolved
        .model_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    CompiledGraphKey {
        model,
        padded_width,
        padded_height,
        precision: resolved.precision,
        internal_scale_pct: (tensor::internal_scale(resolved.uhd) * 100.0).round() as u32,
        ensemble: resolved.ensemble,
        device_name: crate::runtime::device_name(resolved.device.device_id())
            .unwrap_or_else(|| "unknown".to_string()),
        compiler_version: crate::runtime::tensorrt_version()
            .unwrap_or_else(|| "unknown".to_string()),
        workspace_size_mb: resolved.tuning.workspace_size_mb,
        max_aux_streams: resolved.tuning.max_aux_streams,
        optimization_level: resolved.tuning.optimization_level,
    }
}

fn input_is_fp16(session: &Session) -> bool {
    match session.inputs().first().map(|input| input.dtype()) {
        Some(ort::value::ValueType::Tensor { ty, .. }) => {
            *ty == ort::tensor::TensorElementType::Float16
        }
        _ => false,
    }
}

fn to_input_value(array: &Array4<f32>, fp16: bool) -> Result<DynValue> {
    if fp16 {
        let contiguous = array.as_standard_layout();
        let f32_slice = contiguous
            .as_slice()
            .context("input must be contiguous for f16 conversion")?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);
        let fp16_array = ArrayD::from_shape_vec(array.shape().to_vec(), fp16_data)?;
        Ok(Tensor::from_array(fp16_array)?.into_dyn())
    } else {
        Ok(Tensor::from_array(array.clone())?.into_dyn())
    }
}

fn extract_output(value: &DynValue, fp16: bool) -> Result<Array4<f32>> {
    let output = if fp16 {
        let view = value.try_extract_array::<f16>()?;
        let contiguous = view.as_standard_layout();
        let halves = contiguous
            .as_slice()
            .context("standard layout must be contiguous")?;
        let mut f32_data = vec![0.0f32; halves.len()];
        halves.convert_to_f32_slice(&mut f32_data);
        ArrayD::from_shape_vec(view.shape().to_vec(), f32_data)?
    } else {
        value.try_extract_array::<f32>()?.to_owned()
    };
    output
        .into_dimensionality::<Ix4>()
        .context("model output is not a 4-D tensor")
}

fn run_bound(
    session: &mut Session,
    inputs: &[(&str, &DynValue)],
    fp16: bool,
) -> Result<Array4<f32>> {
    let mut binding = session.create_binding()?;
    for (name, value) in inputs {
        binding.bind_input(*name, *value)?;
    }
    binding.bind_output_to_device(OUTPUT_NAME, &session.allocator().memory_info())?;
    let outputs = session.run_binding(&binding)?;
    extract_output(&outputs[OUTPUT_NAME], fp16)
}

pub struct OnnxInterpolator {
    source: SessionSource,
    session: Option<Session>,
    format: ModelFormat,
    fp16_io: bool,
    /// Reusable [1,7,H,W] buffer for the concatenated layout.
    concat_buf: Option<Array4<f32>>,
}

impl OnnxInterpolator {
    pub fn load(resolved: &ResolvedEngineConfig) -> Result<Self> {
        let source = SessionSource::new(resolved)?;
        let session = source.open()?;
        let format = detect_model_format(&session);
        let fp16_io = input_is_fp16(&session);
        debug!(format = ?format, fp16_io, "Detected interpolation model layout");

        Ok(Self {
            source,
            session: Some(session),
            format,
            fp16_io,
            concat_buf: None,
        })
    }

    pub fn format(&self) -> ModelFormat {
        self.format
    }
}

fn detect_model_format(session: &Session) -> ModelFormat {
    let inputs = session.inputs();
    if inputs.len() == 1 && inputs[0].name() == INPUT_CONCAT {
        ModelFormat::Concatenated
    } else {
        ModelFormat::ThreeInput
    }
}

impl ModelRuntime for OnnxInterpolator {
    fn interpolate(
        &mut self,
        first: &PaddedTensor,
        second: &PaddedTensor,
        timestep: f32,
    ) -> Result<PaddedTensor> {
        let iobinding = self.source.uses_iobinding() && !self.fp16_io;
        let fp16 = self.fp16_io;
        let session = self
            .session
            .as_mut()
            .context("interpolation session is not loaded")?;

        let started = std::time::Instant::now();
        let output = match self.format {
            ModelFormat::Concatenated => {
                let img0 = first.data();
                let (h, w) = (img0.shape()[2], img0.shape()[3]);
                let target_shape = [1, 7, h, w];
                let mut concat = match self.concat_buf.take() {
                    Some(arr) if arr.shape() == target_shape => arr,
                    _ => Array4::<f32>::zeros(target_shape),
                };
                concat.slice_mut(s![.., 0..3, .., ..]).assign(img0);
                concat.slice_mut(s![.., 3..6, .., ..]).assign(second.data());
                concat.slice_mut(s![.., 6..7, .., ..]).fill(timestep);

                let input = to_input_value(&concat, fp16)?;
                self.concat_buf = Some(concat);

                if iobinding {
                    run_bound(session, &[(INPUT_CONCAT, &input)], fp16)?
                } else {
                    let outputs = session.run(ort::inputs![INPUT_CONCAT => &input])?;
                    extract_output(&outputs[OUTPUT_NAME], fp16)?
                }
            }
            ModelFormat::ThreeInput => {
                let img0 = to_input_value(first.data(), fp16)?;
                let img1 = to_input_value(second.data(), fp16)?;
                let ts = to_input_value(&Array4::from_elem((1, 1, 1, 1), timestep), fp16)?;

                if iobinding {
                    run_bound(
                        session,
                        &[(INPUT_IMG0, &img0), (INPUT_IMG1, &img1), (INPUT_TIMESTEP, &ts)],
                        fp16,
                    )?
                } else {
                    let outputs = session.run(ort::inputs![
                        INPUT_IMG0 => &img0,
                        INPUT_IMG1 => &img1,
                        INPUT_TIMESTEP => &ts
                    ])?;
                    extract_output(&outputs[OUTPUT_NAME], fp16)?
                }
            }
        };

        debug!(
            session_run_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            timestep,
            "Interpolation inference"
        );

        let expected = first.data().shape();
        if output.shape()[2..] != expected[2..] {
            bail!(
                "interpolation output {:?} does not match input {:?}",
                output.shape(),
                expected
            );
        }
        // Only RGB planes are meaningful.
        let output = output.slice(s![.., 0..3, .., ..]).to_owned();
        PaddedTensor::new(output, first.width(), first.height(), first.precision())
    }

    fn release(&mut self) -> Result<()> {
        self.session = None;
        self.concat_buf = None;
        Ok(())
    }

    fn acquire(&mut self) -> Result<()> {
        if self.session.is_none() {
            self.session = Some(self.source.open()?);
        }
        Ok(())
    }
}

pub struct OnnxUpscaler {
    source: SessionSource,
    session: Option<Session>,
    input_name: String,
    output_name: String,
    fp16_io: bool,
    scale: u32,
    tile_size: Option<u32>,
}

impl OnnxUpscaler {
    pub fn load(resolved: &ResolvedEngineConfig) -> Result<Self> {
        let source = SessionSource::new(resolved)?;
        let mut session = source.open()?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .context("upscale model declares no inputs")?;
        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .context("upscale model declares no outputs")?;
        let fp16_io = input_is_fp16(&session);

        let scale = match declared_scale(&session) {
            Some(scale) => scale,
            None => measure_scale(&mut session, &input_name, &output_name, fp16_io)?,
        };

        info!(
            %input_name,
            %output_name,
            fp16_io,
            scale,
            tile_size = ?resolved.tile_size,
            "Detected upscale model IO"
        );

        Ok(Self {
            source,
            session: Some(session),
            input_name,
            output_name,
            fp16_io,
            scale,
            tile_size: resolved.tile_size,
        })
    }
}

/// Ratio of static output to input height, when both are declared.
fn declared_scale(session: &Session) -> Option<u32> {
    let dims = |value_type: &ort::value::ValueType| match value_type {
        ort::value::ValueType::Tensor { shape, .. } if shape.len() == 4 => {
            Some((shape[2], shape[3]))
        }
        _ => None,
    };
    let (in_h, in_w) = dims(session.inputs().first()?.dtype())?;
    let (out_h, out_w) = dims(session.outputs().first()?.dtype())?;
    if in_h <= 0 || out_h <= 0 || in_w <= 0 || out_w <= 0 || out_h % in_h != 0 {
        return None;
    }
    let scale = (out_h / in_h) as u32;
    (out_w / in_w == out_h / in_h).then_some(scale)
}

fn measure_scale(
    session: &mut Session,
    input_name: &str,
    output_name: &str,
    fp16: bool,
) -> Result<u32> {
    let sample = Array4::<f32>::zeros((1, 3, SCALE_SAMPLE_SIZE, SCALE_SAMPLE_SIZE));
    let input = to_input_value(&sample, fp16)?;
    let outputs = session.run(ort::inputs![input_name => &input])?;
    let output = extract_output(&outputs[output_name], fp16)?;
    let out_h = output.shape()[2];
    if out_h == 0 || out_h % SCALE_SAMPLE_SIZE != 0 {
        bail!("could not determine upscale factor: sample output height {out_h}");
    }
    Ok((out_h / SCALE_SAMPLE_SIZE) as u32)
}

struct UpscaleIo<'a> {
    input_name: &'a str,
    output_name: &'a str,
    fp16: bool,
    iobinding: bool,
}

impl UpscaleIo<'_> {
    fn run(&self, session: &mut Session, array: &Array4<f32>) -> Result<Array4<f32>> {
        let value = to_input_value(array, self.fp16)?;
        if self.iobinding && self.output_name == OUTPUT_NAME {
            run_bound(session, &[(self.input_name, &value)], self.fp16)
        } else {
            let outputs = session.run(ort::inputs![self.input_name => &value])?;
            extract_output(&outputs[self.output_name], self.fp16)
        }
    }
}

impl ModelRuntime for OnnxUpscaler {
    fn upscale(&mut self, input: &PaddedTensor) -> Result<PaddedTensor> {
        let io = UpscaleIo {
            input_name: &self.input_name,
            output_name: &self.output_name,
            fp16: self.fp16_io,
            iobinding: self.source.uses_iobinding() && !self.fp16_io,
        };
        let scale = self.scale;
        let session = self
            .session
            .as_mut()
            .context("upscale session is not loaded")?;

        let started = std::time::Instant::now();
        let output = match self.tile_size {
            Some(tile) => tensor::upscale_tiled(input.data(), scale as usize, tile as usize, |window| {
                io.run(session, window)
            })?,
            None => io.run(session, input.data())?,
        };

        debug!(
            session_run_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            tiled = self.tile_size.is_some(),
            "Upscale inference"
        );

        PaddedTensor::new(
            output,
            input.width() * scale,
            input.height() * scale,
            input.precision(),
        )
    }

    fn scale(&self) -> u32 {
        self.scale
    }

    fn release(&mut self) -> Result<()> {
        self.session = None;
        Ok(())
    }

    fn acquire(&mut self) -> Result<()> {
        if self.session.is_none() {
            self.session = Some(self.source.open()?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;

    #[test]
    fn test_compiled_graph_key_reflects_engine_geometry() {
        let mut config = EngineConfig::new("/models/rife_v4.6.onnx", "rife46", 1920, 1080);
        config.backend = "tensorrt".to_string();
        config.uhd = true;
        let resolved = config.resolve().expect("resolve");
        let key = compiled_graph_key(&resolved);
        assert_eq!(key.model, "rife_v4.6.onnx");
        assert_eq!((key.padded_width, key.padded_height), (1920, 1088));
        assert_eq!(key.internal_scale_pct, 50);
        assert_eq!(key.optimization_level, 3);
    }

    #[test]
    fn test_compiled_graph_key_uses_tile_window_when_tiling() {
        let mut config = EngineConfig::new("/models/sr.onnx", "upscale", 1920, 1080);
        config.backend = "tensorrt".to_string();
        config.tile_size = Some(256);
        let resolved = config.resolve().expect("resolve");
        let key = compiled_graph_key(&resolved);
        assert_eq!((key.padded_width, key.padded_height), (272, 272));

        config.tile_size = None;
        let whole = compiled_graph_key(&config.resolve().expect("resolve"));
        assert_eq!((whole.padded_width, whole.padded_height), (1920, 1080));
        assert_ne!(
            key.dir_name().expect("dir name"),
            whole.dir_name().expect("dir name")
        );
    }

    #[test]
    fn test_iobinding_disabled_for_cpu() {
        let mut config = EngineConfig::new("model.onnx", "rife46", 64, 64);
        config.backend = "cpu".to_string();
        let resolved = config.resolve().expect("resolve");
        let source = SessionSource::new(&resolved).expect("source");
        assert!(!source.uses_iobinding());
        assert!(source.compiled_cache.is_none());
    }

    #[test]
    fn test_missing_model_file_fails_to_open() {
        let mut config = EngineConfig::new("/nonexistent/model.onnx", "rife46", 64, 64);
        config.backend = "cpu".to_string();
        let resolved = config.resolve().expect("resolve");
        let source = SessionSource::new(&resolved).expect("source");
        let err = source.open().expect_err("missing file");
        assert!(err.to_string().contains("model file not found"));
    }

    #[test]
    #[ignore = "requires ONNX Runtime and a RIFE model in REFRAME_TEST_RIFE_MODEL"]
    fn test_rife_model_interpolates_gray_midpoint() {
        let model = std::env::var("REFRAME_TEST_RIFE_MODEL").expect("model path");
        let mut config = EngineConfig::new(model, "rife46", 64, 64);
        config.backend = "cpu".to_string();
        config.precision = Precision::Float32;
        let engine = crate::engine::build_engine(&config).expect("engine");

        let black = engine
            .frame_to_tensor(&crate::types::Frame::filled(64, 64, 3, 0))
            .expect("tensor");
        let white = engine
            .frame_to_tensor(&crate::types::Frame::filled(64, 64, 3, 255))
            .expect("tensor");
        let mid = engine.interpolate(&black, &white, 0.5).expect("interpolate");
        let frame = engine.tensor_to_frame(&mid).expect("frame");
        assert_eq!(frame.data().len(), 64 * 64 * 3);
    }
}
