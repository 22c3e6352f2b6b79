//! Scene-cut detection.
//!
//! A [`SceneCutOracle`] sees every source frame once, in order, and answers
//! whether a hard cut separates it from the previous one. Interpolating across
//! a cut produces ghosting, so the render loop holds the earlier frame instead.

use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::types::{Frame, RGB_CHANNELS};

const DOWNSCALE_WIDTH: usize = 160;
const DOWNSCALE_HEIGHT: usize = 90;

pub const DEFAULT_SENSITIVITY: f64 = 3.0;
const MIN_THRESHOLD: f64 = 0.01;

pub trait SceneCutOracle: Send {
    /// Whether `frame` starts a new scene relative to the previously seen frame.
    fn detect(&mut self, frame: &Frame) -> Result<bool>;
}

impl<F> SceneCutOracle for F
where
    F: FnMut(&Frame) -> Result<bool> + Send,
{
    fn detect(&mut self, frame: &Frame) -> Result<bool> {
        self(frame)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneCutMethod {
    None,
    /// Difference of whole-frame average luma.
    Luma,
    /// Mean absolute difference of downscaled luma planes.
    #[default]
    Content,
}

impl SceneCutMethod {
    /// Metric value that sensitivity 0 maps to.
    fn max_threshold(&self) -> f64 {
        match self {
            Self::None => 1.0,
            Self::Luma => 0.43,
            Self::Content => 0.2,
        }
    }
}

impl FromStr for SceneCutMethod {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "luma" => Ok(Self::Luma),
            "content" | "pyscenedetect" => Ok(Self::Content),
            other => Err(PipelineError::configuration(format!(
                "unknown scene detection method '{other}' (expected none, luma or content)"
            ))),
        }
    }
}

impl std::fmt::Display for SceneCutMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Luma => write!(f, "luma"),
            Self::Content => write!(f, "content"),
        }
    }
}

/// Sensitivity in [0, 10]; higher values report more cuts.
pub fn threshold_for(method: SceneCutMethod, sensitivity: f64) -> f64 {
    let sensitivity = if sensitivity.is_finite() {
        sensitivity.clamp(0.0, 10.0)
    } else {
        DEFAULT_SENSITIVITY
    };
    (method.max_threshold() * (1.0 - sensitivity / 10.0)).max(MIN_THRESHOLD)
}

pub fn build_oracle(method: SceneCutMethod, sensitivity: f64) -> Box<dyn SceneCutOracle> {
    let threshold = threshold_for(method, sensitivity);
    debug!(%method, sensitivity, threshold, "Scene cut oracle configured");
    match method {
        SceneCutMethod::None => Box::new(NoCutOracle),
        SceneCutMethod::Luma => Box::new(LumaCutOracle::new(threshold)),
        SceneCutMethod::Content => Box::new(ContentCutOracle::new(threshold)),
    }
}

pub struct NoCutOracle;

impl SceneCutOracle for NoCutOracle {
    fn detect(&mut self, _frame: &Frame) -> Result<bool> {
        Ok(false)
    }
}

pub struct LumaCutOracle {
    threshold: f64,
    previous: Option<f64>,
}

impl LumaCutOracle {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            previous: None,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl SceneCutOracle for LumaCutOracle {
    fn detect(&mut self, frame: &Frame) -> Result<bool> {
        let plane = downscaled_luma(frame)?;
        let luma = plane.iter().sum::<f64>() / plane.len().max(1) as f64;
        let cut = self
            .previous
            .replace(luma)
            .is_some_and(|previous| (previous - luma).abs() > self.threshold);
        Ok(cut)
    }
}

pub struct ContentCutOracle {
    threshold: f64,
    previous: Option<Vec<f64>>,
}

impl ContentCutOracle {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            previous: None,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl SceneCutOracle for ContentCutOracle {
    fn detect(&mut self, frame: &Frame) -> Result<bool> {
        let plane = downscaled_luma(frame)?;
        let cut = match &self.previous {
            Some(previous) if previous.len() == plane.len() => {
                let diff = previous
                    .iter()
                    .zip(&plane)
                    .map(|(a, b)| (a - b).abs())
                    .sum::<f64>()
                    / plane.len().max(1) as f64;
                diff > self.threshold
            }
            _ => false,
        };
        self.previous = Some(plane);
        Ok(cut)
    }
}

/// Area-average downscale to at most 160x90 and BT.601 luma per cell,
/// normalized to [0, 1].
fn downscaled_luma(frame: &Frame) -> Result<Vec<f64>> {
    if frame.channels() != RGB_CHANNELS {
        return Err(PipelineError::configuration(format!(
            "scene detection needs RGB frames, got {} channels",
            frame.channels()
        ))
        .into());
    }

    let data = frame.data();
    let src_w = frame.width() as usize;
    let src_h = frame.height() as usize;
    let dst_w = DOWNSCALE_WIDTH.min(src_w);
    let dst_h = DOWNSCALE_HEIGHT.min(src_h);

    let mut plane = Vec::with_capacity(dst_w * dst_h);
    for dst_y in 0..dst_h {
        let src_y0 = dst_y * src_h / dst_h;
        let src_y1 = ((dst_y + 1) * src_h / dst_h).min(src_h);

        for dst_x in 0..dst_w {
            let src_x0 = dst_x * src_w / dst_w;
            let src_x1 = ((dst_x + 1) * src_w / dst_w).min(src_w);

            let (mut r_sum, mut g_sum, mut b_sum, mut count) = (0u64, 0u64, 0u64, 0u64);
            for sy in src_y0..src_y1 {
                for sx in src_x0..src_x1 {
                    let idx = (sy * src_w + sx) * 3;
                    r_sum += data[idx] as u64;
                    g_sum += data[idx + 1] as u64;
                    b_sum += data[idx + 2] as u64;
                    count += 1;
                }
            }

            let luma = if count > 0 {
                let n = count as f64;
                (r_sum as f64 / n) * 0.299 + (g_sum as f64 / n) * 0.587 + (b_sum as f64 / n) * 0.114
            } else {
                0.0
            };
            plane.push(luma / 255.0);
        }
    }

    Ok(plane)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, r: u8, g: u8, b: u8) -> Frame {
        let mut data = vec![0u8; w as usize * h as usize * 3];
        for pixel in data.chunks_exact_mut(3) {
            pixel[0] = r;
            pixel[1] = g;
            pixel[2] = b;
        }
        Frame::rgb(data, w, h).expect("valid frame")
    }

    /// Left half white, right half black, or the mirror image.
    fn split(w: u32, h: u32, white_left: bool) -> Frame {
        let mut data = vec![0u8; w as usize * h as usize * 3];
        for y in 0..h as usize {
            for x in 0..w as usize {
                let left = x < w as usize / 2;
                if left == white_left {
                    let idx = (y * w as usize + x) * 3;
                    data[idx..idx + 3].fill(255);
                }
            }
        }
        Frame::rgb(data, w, h).expect("valid frame")
    }

    #[test]
    fn test_default_threshold_matches_luma_baseline() {
        let threshold = threshold_for(SceneCutMethod::Luma, DEFAULT_SENSITIVITY);
        assert!((threshold - 0.301).abs() < 1e-9);
    }

    #[test]
    fn test_sensitivity_is_clamped_and_floored() {
        assert!((threshold_for(SceneCutMethod::Content, 10.0) - MIN_THRESHOLD).abs() < 1e-12);
        assert!((threshold_for(SceneCutMethod::Content, 42.0) - MIN_THRESHOLD).abs() < 1e-12);
        assert!((threshold_for(SceneCutMethod::Content, -5.0) - 0.2).abs() < 1e-12);
        assert!(
            threshold_for(SceneCutMethod::Content, 8.0)
                < threshold_for(SceneCutMethod::Content, 2.0)
        );
    }

    #[test]
    fn test_first_frame_never_cuts() {
        let mut oracle = build_oracle(SceneCutMethod::Content, 10.0);
        assert!(!oracle.detect(&solid(64, 64, 255, 255, 255)).expect("detect"));
    }

    #[test]
    fn test_none_never_cuts() {
        let mut oracle = build_oracle(SceneCutMethod::None, 10.0);
        assert!(!oracle.detect(&solid(8, 8, 0, 0, 0)).expect("detect"));
        assert!(!oracle.detect(&solid(8, 8, 255, 255, 255)).expect("detect"));
    }

    #[test]
    fn test_luma_detects_black_to_white() {
        let mut oracle = LumaCutOracle::new(threshold_for(SceneCutMethod::Luma, 3.0));
        assert!(!oracle.detect(&solid(320, 180, 0, 0, 0)).expect("detect"));
        assert!(!oracle.detect(&solid(320, 180, 10, 10, 10)).expect("detect"));
        assert!(oracle.detect(&solid(320, 180, 255, 255, 255)).expect("detect"));
    }

    #[test]
    fn test_content_sees_rearranged_frames_luma_misses() {
        let a = split(64, 36, true);
        let b = split(64, 36, false);

        let mut luma = LumaCutOracle::new(threshold_for(SceneCutMethod::Luma, 3.0));
        luma.detect(&a).expect("detect");
        assert!(!luma.detect(&b).expect("detect"));

        let mut content = ContentCutOracle::new(threshold_for(SceneCutMethod::Content, 3.0));
        content.detect(&a).expect("detect");
        assert!(content.detect(&b).expect("detect"));
        assert!(!content.detect(&b).expect("detect"));
    }

    #[test]
    fn test_closure_oracle() {
        let mut seen = 0;
        let mut oracle = move |_frame: &Frame| -> Result<bool> {
            seen += 1;
            Ok(seen == 2)
        };
        let frame = solid(2, 2, 0, 0, 0);
        assert!(!SceneCutOracle::detect(&mut oracle, &frame).expect("detect"));
        assert!(SceneCutOracle::detect(&mut oracle, &frame).expect("detect"));
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(
            "pyscenedetect".parse::<SceneCutMethod>().expect("alias"),
            SceneCutMethod::Content
        );
        assert_eq!("NONE".parse::<SceneCutMethod>().expect("none"), SceneCutMethod::None);
        assert!(matches!(
            "histogram".parse::<SceneCutMethod>(),
            Err(PipelineError::Configuration(_))
        ));
        assert_eq!(SceneCutMethod::default(), SceneCutMethod::Content);
    }
}
