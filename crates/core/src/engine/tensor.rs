//! Frame ↔ padded NCHW tensor conversion.
//!
//! Frames are scattered straight into a tile-aligned `[1, 3, H, W]` buffer and
//! the bottom/right padding is filled by replicating the last valid row and
//! column. Output tensors are cropped back to the valid region before being
//! gathered into interleaved RGB.

use std::str::FromStr;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::{frame_len, Frame, RGB_CHANNELS};

const INTERPOLATION_BASE_TILE: u32 = 32;
/// Super-resolution networks need 4-pixel alignment.
pub const UPSCALE_TILE: u32 = 4;
/// Context added on each side of an upscale tile and cropped after inference.
pub const TILE_OVERLAP: usize = 8;

/// Alignment tile for interpolation networks. UHD mode runs the flow estimator
/// at half internal scale, which never shrinks the tile below 32.
pub fn interpolation_tile(uhd: bool) -> u32 {
    let internal_scale = internal_scale(uhd);
    (INTERPOLATION_BASE_TILE as f64 / internal_scale)
        .round()
        .max(INTERPOLATION_BASE_TILE as f64) as u32
}

pub fn internal_scale(uhd: bool) -> f64 {
    if uhd {
        0.5
    } else {
        1.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Float16,
    Float32,
}

impl FromStr for Precision {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float16" | "fp16" | "half" => Ok(Self::Float16),
            "float32" | "fp32" | "float" => Ok(Self::Float32),
            other => Err(PipelineError::configuration(format!(
                "unknown precision '{other}' (expected float16 or float32)"
            ))),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float16 => write!(f, "float16"),
            Self::Float32 => write!(f, "float32"),
        }
    }
}

/// Valid and padded geometry for one engine, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingPlan {
    width: u32,
    height: u32,
    padded_width: u32,
    padded_height: u32,
    tile: u32,
}

impl PaddingPlan {
    pub fn new(width: u32, height: u32, tile: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(PipelineError::configuration(format!(
                "invalid frame resolution {width}x{height}"
            ))
            .into());
        }
        if tile == 0 {
            bail!("padding tile must be non-zero");
        }

        Ok(Self {
            width,
            height,
            padded_width: width.div_ceil(tile) * tile,
            padded_height: height.div_ceil(tile) * tile,
            tile,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn padded_width(&self) -> u32 {
        self.padded_width
    }

    pub fn padded_height(&self) -> u32 {
        self.padded_height
    }

    pub fn tile(&self) -> u32 {
        self.tile
    }

    pub fn is_aligned(&self) -> bool {
        self.width == self.padded_width && self.height == self.padded_height
    }

    pub fn frame_len(&self) -> usize {
        frame_len(self.width, self.height, RGB_CHANNELS)
    }

    /// Geometry of an upscaler's output for this input plan.
    pub fn scaled(&self, scale: u32) -> Self {
        Self {
            width: self.width * scale,
            height: self.height * scale,
            padded_width: self.padded_width * scale,
            padded_height: self.padded_height * scale,
            tile: self.tile * scale,
        }
    }
}

/// NCHW f32 tensor padded to an alignment tile. `width`/`height` are the valid
/// region; the array itself has the padded extent.
#[derive(Debug, Clone)]
pub struct PaddedTensor {
    data: Array4<f32>,
    width: u32,
    height: u32,
    precision: Precision,
}

impl PaddedTensor {
    pub fn new(data: Array4<f32>, width: u32, height: u32, precision: Precision) -> Result<Self> {
        let shape = data.shape();
        if shape[0] != 1 || shape[1] != RGB_CHANNELS as usize {
            bail!("expected a [1, 3, H, W] tensor, got {:?}", shape);
        }
        if shape[2] < height as usize || shape[3] < width as usize {
            bail!(
                "tensor extent {}x{} is smaller than the valid region {}x{}",
                shape[3],
                shape[2],
                width,
                height
            );
        }

        Ok(Self {
            data,
            width,
            height,
            precision,
        })
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn into_data(self) -> Array4<f32> {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn padded_width(&self) -> u32 {
        self.data.shape()[3] as u32
    }

    pub fn padded_height(&self) -> u32 {
        self.data.shape()[2] as u32
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Element-wise mean of two tensors with identical geometry.
    pub fn mean_with(&self, other: &PaddedTensor) -> Result<PaddedTensor> {
        if self.data.shape() != other.data.shape() {
            bail!(
                "cannot average tensors of shape {:?} and {:?}",
                self.data.shape(),
                other.data.shape()
            );
        }
        let data = (&self.data + &other.data) * 0.5;
        PaddedTensor::new(data, self.width, self.height, self.precision)
    }
}

/// Normalize `frame` into a padded tensor laid out by `plan`.
pub fn frame_to_padded(frame: &Frame, plan: &PaddingPlan, precision: Precision) -> Result<PaddedTensor> {
    if frame.width() != plan.width()
        || frame.height() != plan.height()
        || frame.channels() != RGB_CHANNELS
        || frame.data().len() != plan.frame_len()
    {
        return Err(PipelineError::ShapeMismatch {
            expected: plan.frame_len(),
            actual: frame.data().len(),
        })
        .with_context(|| {
            format!(
                "frame {} does not match engine geometry {}x{}x3",
                frame.dimensions(),
                plan.width(),
                plan.height()
            )
        });
    }

    let h = plan.height() as usize;
    let w = plan.width() as usize;
    let padded_h = plan.padded_height() as usize;
    let padded_w = plan.padded_width() as usize;
    let padded_hw = padded_h * padded_w;

    let mut nchw = Array4::<f32>::zeros((1, 3, padded_h, padded_w));
    let planes = nchw
        .as_slice_mut()
        .context("freshly allocated tensor is contiguous")?;
    let data = frame.data();

    // Planes laid out as [R: 0..padded_hw, G: padded_hw..2*padded_hw, B: ...]; row stride = padded_w.
    for y in 0..h {
        let row_src = y * w * 3;
        let row_dst = y * padded_w;
        for x in 0..w {
            let src = row_src + x * 3;
            planes[row_dst + x] = data[src] as f32 / 255.0;
            planes[padded_hw + row_dst + x] = data[src + 1] as f32 / 255.0;
            planes[2 * padded_hw + row_dst + x] = data[src + 2] as f32 / 255.0;
        }
    }

    replicate_edges(planes, h, w, padded_h, padded_w);

    if precision == Precision::Float16 {
        quantize_f16(planes);
    }

    PaddedTensor::new(nchw, plan.width(), plan.height(), precision)
}

/// Crop to the valid region and round back to interleaved u8 RGB.
pub fn padded_to_frame(tensor: &PaddedTensor) -> Result<Frame> {
    let h = tensor.height() as usize;
    let w = tensor.width() as usize;
    let cropped = tensor.data().slice(s![.., .., ..h, ..w]);
    let contiguous = cropped.as_standard_layout();
    let planes = contiguous
        .as_slice()
        .context("standard layout must be contiguous")?;

    let hw = h * w;
    let r_plane = &planes[..hw];
    let g_plane = &planes[hw..2 * hw];
    let b_plane = &planes[2 * hw..3 * hw];

    let mut rgb = vec![0u8; hw * 3];
    for (i, dst) in rgb.chunks_exact_mut(3).enumerate() {
        dst[0] = to_u8(r_plane[i]);
        dst[1] = to_u8(g_plane[i]);
        dst[2] = to_u8(b_plane[i]);
    }

    Ok(Frame::rgb(rgb, tensor.width(), tensor.height())?)
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0 + 0.5).clamp(0.0, 255.0) as u8
}

fn replicate_edges(planes: &mut [f32], h: usize, w: usize, padded_h: usize, padded_w: usize) {
    let padded_hw = padded_h * padded_w;
    for c in 0..3usize {
        let plane = &mut planes[c * padded_hw..(c + 1) * padded_hw];

        if padded_w > w {
            for y in 0..h {
                let row = y * padded_w;
                let edge = plane[row + w - 1];
                plane[row + w..row + padded_w].fill(edge);
            }
        }

        // Rows below the frame copy the last (already right-padded) row.
        let last_row = (h - 1) * padded_w;
        for y in h..padded_h {
            plane.copy_within(last_row..last_row + padded_w, y * padded_w);
        }
    }
}

/// One tile along an axis: the region `[start, end)` it contributes to the
/// output, read from a window `[window_start, window_start + window)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpan {
    pub start: usize,
    pub end: usize,
    pub window_start: usize,
    pub window: usize,
}

/// Cover `extent` with tiles of `tile`. Every window has the same length so a
/// compiled graph sees one input shape; windows are shifted inwards at the
/// borders instead of shrinking.
pub fn tile_spans(extent: usize, tile: usize, overlap: usize) -> Vec<TileSpan> {
    let tile = tile.max(1);
    let window = tile_window(extent, tile, overlap);
    (0..extent)
        .step_by(tile)
        .map(|start| TileSpan {
            start,
            end: (start + tile).min(extent),
            window_start: start.saturating_sub(overlap).min(extent - window),
            window,
        })
        .collect()
}

pub fn tile_window(extent: usize, tile: usize, overlap: usize) -> usize {
    (tile + 2 * overlap).min(extent)
}

/// Run `upscale` over overlapping windows of `input` and stitch the scaled
/// centres into one `[1, 3, H*scale, W*scale]` tensor.
pub fn upscale_tiled(
    input: &Array4<f32>,
    scale: usize,
    tile: usize,
    mut upscale: impl FnMut(&Array4<f32>) -> Result<Array4<f32>>,
) -> Result<Array4<f32>> {
    let (h, w) = (input.shape()[2], input.shape()[3]);
    let rows = tile_spans(h, tile, TILE_OVERLAP);
    let cols = tile_spans(w, tile, TILE_OVERLAP);
    let mut output = Array4::<f32>::zeros((1, 3, h * scale, w * scale));

    for row in &rows {
        for col in &cols {
            let window = input
                .slice(s![
                    ..,
                    ..,
                    row.window_start..row.window_start + row.window,
                    col.window_start..col.window_start + col.window
                ])
                .to_owned();
            let scaled = upscale(&window)?;
            let shape = scaled.shape();
            if shape[1] < 3 || shape[2] != row.window * scale || shape[3] != col.window * scale {
                bail!(
                    "upscaled tile has shape {:?}, expected [1, 3, {}, {}]",
                    shape,
                    row.window * scale,
                    col.window * scale
                );
            }

            let y0 = (row.start - row.window_start) * scale;
            let x0 = (col.start - col.window_start) * scale;
            let tile_h = (row.end - row.start) * scale;
            let tile_w = (col.end - col.start) * scale;
            output
                .slice_mut(s![
                    ..,
                    ..,
                    row.start * scale..row.end * scale,
                    col.start * scale..col.end * scale
                ])
                .assign(&scaled.slice(s![.., 0..3, y0..y0 + tile_h, x0..x0 + tile_w]));
        }
    }

    Ok(output)
}

/// Round every value through IEEE half precision in place.
pub fn quantize_f16(values: &mut [f32]) {
    let mut halves = vec![f16::ZERO; values.len()];
    halves.convert_from_f32_slice(values);
    halves.convert_to_f32_slice(values);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let data = (0..frame_len(width, height, 3))
            .map(|i| (i % 251) as u8)
            .collect();
        Frame::rgb(data, width, height).expect("valid frame")
    }

    #[test]
    fn test_interpolation_tile() {
        assert_eq!(interpolation_tile(false), 32);
        assert_eq!(interpolation_tile(true), 64);
    }

    #[test]
    fn test_padding_plan_rounds_up_to_tile() {
        let plan = PaddingPlan::new(1920, 1080, 32).expect("valid plan");
        assert_eq!(plan.padded_width(), 1920);
        assert_eq!(plan.padded_height(), 1088);
        assert!(!plan.is_aligned());

        let sr = PaddingPlan::new(722, 405, UPSCALE_TILE).expect("valid plan");
        assert_eq!((sr.padded_width(), sr.padded_height()), (724, 408));
        let out = sr.scaled(2);
        assert_eq!((out.width(), out.padded_height()), (1444, 816));
    }

    #[test]
    fn test_padding_plan_rejects_empty_resolution() {
        let err = PaddingPlan::new(0, 720, 32).expect_err("zero width");
        assert!(matches!(
            crate::error::classify(&err),
            Some(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_round_trip_restores_frame() {
        let frame = gradient_frame(50, 30);
        let plan = PaddingPlan::new(50, 30, 32).expect("valid plan");
        let tensor = frame_to_padded(&frame, &plan, Precision::Float32).expect("convert");
        assert_eq!(tensor.data().shape(), &[1, 3, 32, 64]);

        let restored = padded_to_frame(&tensor).expect("restore");
        assert_eq!(restored.dimensions(), frame.dimensions());
        assert_eq!(restored.data(), frame.data());
    }

    #[test]
    fn test_round_trip_float16_stays_within_one_level() {
        let frame = gradient_frame(33, 17);
        let plan = PaddingPlan::new(33, 17, 32).expect("valid plan");
        let tensor = frame_to_padded(&frame, &plan, Precision::Float16).expect("convert");
        let restored = padded_to_frame(&tensor).expect("restore");
        for (a, b) in frame.data().iter().zip(restored.data()) {
            assert!((*a as i32 - *b as i32).abs() <= 1, "mismatch: {a} vs {b}");
        }
    }

    #[test]
    fn test_padding_replicates_edges() {
        let frame = gradient_frame(30, 30);
        let plan = PaddingPlan::new(30, 30, 32).expect("valid plan");
        let tensor = frame_to_padded(&frame, &plan, Precision::Float32).expect("convert");
        let arr = tensor.data();
        for c in 0..3 {
            assert_eq!(arr[[0, c, 5, 31]], arr[[0, c, 5, 29]]);
            assert_eq!(arr[[0, c, 31, 7]], arr[[0, c, 29, 7]]);
            assert_eq!(arr[[0, c, 31, 31]], arr[[0, c, 29, 29]]);
        }
    }

    #[test]
    fn test_wrong_frame_size_is_shape_mismatch() {
        let plan = PaddingPlan::new(64, 64, 32).expect("valid plan");
        let frame = Frame::filled(32, 32, 3, 0);
        let err = frame_to_padded(&frame, &plan, Precision::Float32).expect_err("wrong size");
        assert!(matches!(
            crate::error::classify(&err),
            Some(PipelineError::ShapeMismatch {
                expected: 12288,
                actual: 3072
            })
        ));
    }

    #[test]
    fn test_to_u8_rounds_and_clamps() {
        assert_eq!(to_u8(1.5), 255);
        assert_eq!(to_u8(-0.5), 0);
        assert_eq!(to_u8(0.5), 128);
        assert_eq!(to_u8(128.0 / 255.0), 128);
    }

    #[test]
    fn test_mean_with_averages_values() {
        let a = PaddedTensor::new(Array4::from_elem((1, 3, 4, 4), 0.2), 4, 4, Precision::Float32)
            .expect("tensor");
        let b = PaddedTensor::new(Array4::from_elem((1, 3, 4, 4), 0.6), 4, 4, Precision::Float32)
            .expect("tensor");
        let mean = a.mean_with(&b).expect("same shape");
        assert!((mean.data()[[0, 1, 2, 3]] - 0.4).abs() < 1e-6);
    }

    fn nearest(scale: usize) -> impl FnMut(&Array4<f32>) -> Result<Array4<f32>> {
        move |src| {
            let (h, w) = (src.shape()[2], src.shape()[3]);
            Ok(Array4::from_shape_fn((1, 3, h * scale, w * scale), |(n, c, y, x)| {
                src[[n, c, y / scale, x / scale]]
            }))
        }
    }

    #[test]
    fn test_tile_spans_cover_extent_with_fixed_windows() {
        let spans = tile_spans(100, 32, TILE_OVERLAP);
        assert_eq!(spans.len(), 4);
        assert_eq!(spans.last().map(|s| (s.start, s.end)), Some((96, 100)));
        for span in &spans {
            assert_eq!(span.window, 48);
            assert!(span.window_start <= span.start);
            assert!(span.window_start + span.window >= span.end);
            assert!(span.window_start + span.window <= 100);
        }
        assert_eq!(spans[0].window_start, 0);
        assert_eq!(spans[1].window_start, 24);
        assert_eq!(spans[3].window_start, 52);
    }

    #[test]
    fn test_tile_larger_than_extent_is_one_window() {
        let spans = tile_spans(20, 64, TILE_OVERLAP);
        assert_eq!(
            spans,
            vec![TileSpan {
                start: 0,
                end: 20,
                window_start: 0,
                window: 20
            }]
        );
    }

    #[test]
    fn test_tiled_upscale_matches_whole_frame() {
        let input = Array4::from_shape_fn((1, 3, 24, 40), |(_, c, y, x)| {
            (c * 1000 + y * 40 + x) as f32 / 4000.0
        });
        let whole = nearest(2)(&input).expect("whole frame");

        let mut windows = Vec::new();
        let tiled = upscale_tiled(&input, 2, 8, |window| {
            windows.push((window.shape()[2], window.shape()[3]));
            nearest(2)(window)
        })
        .expect("tiled");

        assert_eq!(tiled, whole);
        assert_eq!(windows.len(), 3 * 5);
        assert!(windows.iter().all(|dims| *dims == (24, 24)));
    }

    #[test]
    fn test_tiled_upscale_rejects_wrong_scale() {
        let input = Array4::<f32>::zeros((1, 3, 16, 16));
        let err = upscale_tiled(&input, 2, 8, nearest(3)).expect_err("scale mismatch");
        assert!(err.to_string().contains("upscaled tile has shape"));
    }

    #[test]
    fn test_precision_parse() {
        assert_eq!("fp16".parse::<Precision>().expect("fp16"), Precision::Float16);
        assert_eq!("Float32".parse::<Precision>().expect("float32"), Precision::Float32);
        assert!("int8".parse::<Precision>().is_err());
    }
}
