use anyhow::Result;

use crate::error::PipelineError;

/// Timesteps to synthesize between each pair of source frames for a (possibly
/// fractional) interpolation factor.
///
/// - 2× → t=0.5; 3× → t=0.333, 0.667
/// - 2.5× → ceil 3, max 0.6 → t=0.333, 0.6
#[derive(Debug, Clone, PartialEq)]
pub struct TimestepPlan {
    factor: f64,
    ceil_factor: u32,
    max_timestep: f64,
}

impl TimestepPlan {
    pub fn new(factor: f64) -> Result<Self> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(PipelineError::configuration(format!(
                "interpolation factor must be a finite value >= 1, got {factor}"
            ))
            .into());
        }

        Ok(Self {
            factor,
            ceil_factor: factor.ceil() as u32,
            max_timestep: (factor - 1.0) / factor,
        })
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn ceil_factor(&self) -> u32 {
        self.ceil_factor
    }

    pub fn max_timestep(&self) -> f64 {
        self.max_timestep
    }

    pub fn is_passthrough(&self) -> bool {
        self.ceil_factor <= 1
    }

    pub fn is_fractional(&self) -> bool {
        self.factor.fract() != 0.0
    }

    /// Number of frames emitted per source pair (the source plus intermediates).
    pub fn frames_per_pair(&self) -> u32 {
        self.ceil_factor
    }

    pub fn intermediates_per_pair(&self) -> usize {
        self.ceil_factor.saturating_sub(1) as usize
    }

    pub fn timesteps(&self) -> Vec<f32> {
        let n = self.ceil_factor;
        (1..n)
            .map(|i| (i as f64 / n as f64).min(self.max_timestep) as f32)
            .collect()
    }

    /// Total frames written for `input_frames` source frames.
    pub fn output_frame_count(&self, input_frames: u64) -> u64 {
        if input_frames == 0 {
            return 0;
        }
        (input_frames - 1) * self.ceil_factor as u64 + 1
    }
}

/// Where a timestep sits relative to the two source frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestepKind {
    CopyFirst,
    Synthesize,
    CopySecond,
}

pub fn classify_timestep(timestep: f32) -> TimestepKind {
    if timestep <= 0.0 {
        TimestepKind::CopyFirst
    } else if timestep >= 1.0 {
        TimestepKind::CopySecond
    } else {
        TimestepKind::Synthesize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-6)
    }

    #[test]
    fn test_timesteps_2x() {
        let plan = TimestepPlan::new(2.0).expect("valid factor");
        assert_eq!(plan.timesteps(), vec![0.5]);
        assert_eq!(plan.frames_per_pair(), 2);
    }

    #[test]
    fn test_timesteps_4x() {
        let plan = TimestepPlan::new(4.0).expect("valid factor");
        assert_eq!(plan.timesteps(), vec![0.25, 0.5, 0.75]);
        assert!((plan.max_timestep() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fractional_factor_clamps_last_timestep() {
        let plan = TimestepPlan::new(2.5).expect("valid factor");
        assert_eq!(plan.ceil_factor(), 3);
        assert!(plan.is_fractional());
        assert!(approx(&plan.timesteps(), &[1.0 / 3.0, 0.6]));
        assert!(plan.timesteps().iter().all(|&t| t < 1.0));
    }

    #[test]
    fn test_factor_one_is_passthrough() {
        let plan = TimestepPlan::new(1.0).expect("valid factor");
        assert!(plan.is_passthrough());
        assert!(plan.timesteps().is_empty());
        assert_eq!(plan.output_frame_count(10), 10);
    }

    #[test]
    fn test_output_frame_count() {
        let plan = TimestepPlan::new(2.0).expect("valid factor");
        assert_eq!(plan.output_frame_count(10), 19);
        assert_eq!(plan.output_frame_count(1), 1);
        assert_eq!(plan.output_frame_count(0), 0);
    }

    #[test]
    fn test_invalid_factors_rejected() {
        for factor in [0.5, 0.0, -2.0, f64::NAN, f64::INFINITY] {
            let err = TimestepPlan::new(factor).expect_err("invalid factor");
            assert!(matches!(
                crate::error::classify(&err),
                Some(PipelineError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_classify_timestep() {
        assert_eq!(classify_timestep(0.0), TimestepKind::CopyFirst);
        assert_eq!(classify_timestep(0.5), TimestepKind::Synthesize);
        assert_eq!(classify_timestep(1.0), TimestepKind::CopySecond);
    }
}
