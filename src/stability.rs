//! DC settling detection.
//!
//! Each channel of a short trace is fitted with an ordinary least-squares line
//! over time; the slope is read as the local drift rate (A/s) and the intercept
//! as the DC level. The policy decides how per-channel slopes combine into a
//! single verdict.

use crate::data::SampleBlock;
use crate::error::{AppResult, CharactError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How per-channel slopes are combined into a stability verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StabilityCriteria {
    /// Every channel's |slope| below the threshold.
    #[default]
    #[serde(alias = "All channels", alias = "all")]
    AllChannels,
    /// The flattest channel below the threshold.
    #[serde(alias = "One Channel", alias = "one")]
    OneChannel,
    /// Mean |slope| below the threshold.
    #[serde(alias = "Mean")]
    Mean,
}

impl fmt::Display for StabilityCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StabilityCriteria::AllChannels => write!(f, "All channels"),
            StabilityCriteria::OneChannel => write!(f, "One Channel"),
            StabilityCriteria::Mean => write!(f, "Mean"),
        }
    }
}

/// Outcome of one stability evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilityVerdict {
    /// Whether the policy considers the trace settled.
    pub stable: bool,
    /// Fitted slope per channel (units/s).
    pub slopes: Vec<f64>,
    /// Fitted intercept per channel, used as the DC level.
    pub levels: Vec<f64>,
}

/// Least-squares line `y = slope * t + intercept` with `t = i / fs`.
pub fn fit_line(samples: &[f64], fs: f64) -> AppResult<(f64, f64)> {
    let n = samples.len();
    if n < 2 {
        return Err(CharactError::Processing(format!(
            "line fit needs at least 2 samples, got {n}"
        )));
    }
    let dt = 1.0 / fs;
    let t_mean = dt * (n as f64 - 1.0) / 2.0;
    let y_mean = samples.iter().sum::<f64>() / n as f64;

    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, &y) in samples.iter().enumerate() {
        let dt_i = i as f64 * dt - t_mean;
        sxy += dt_i * (y - y_mean);
        sxx += dt_i * dt_i;
    }
    let slope = sxy / sxx;
    Ok((slope, y_mean - slope * t_mean))
}

/// Evaluate settling of every channel of `block` sampled at `fs`.
pub fn detect(
    block: &SampleBlock,
    fs: f64,
    max_slope: f64,
    criteria: StabilityCriteria,
) -> AppResult<StabilityVerdict> {
    let mut slopes = Vec::with_capacity(block.n_channels());
    let mut levels = Vec::with_capacity(block.n_channels());
    for column in block.deinterleave() {
        let (slope, level) = fit_line(&column, fs)?;
        slopes.push(slope);
        levels.push(level);
    }

    let abs: Vec<f64> = slopes.iter().map(|s| s.abs()).collect();
    let stable = match criteria {
        StabilityCriteria::AllChannels => abs.iter().all(|&s| max_slope > s),
        StabilityCriteria::OneChannel => max_slope > abs.iter().copied().fold(f64::INFINITY, f64::min),
        StabilityCriteria::Mean => max_slope > abs.iter().sum::<f64>() / abs.len() as f64,
    };

    Ok(StabilityVerdict {
        stable,
        slopes,
        levels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 1000.0;

    fn ramp_block(rates: &[f64], offsets: &[f64], n: usize) -> SampleBlock {
        let columns: Vec<Vec<f64>> = rates
            .iter()
            .zip(offsets)
            .map(|(&r, &o)| (0..n).map(|i| o + r * i as f64 / FS).collect())
            .collect();
        SampleBlock::from_columns(&columns).unwrap()
    }

    #[test]
    fn flat_signal_is_stable_under_every_policy() {
        let block = ramp_block(&[0.0, 0.0], &[1e-4, 2e-4], 100);
        for criteria in [
            StabilityCriteria::AllChannels,
            StabilityCriteria::OneChannel,
            StabilityCriteria::Mean,
        ] {
            let v = detect(&block, FS, 1e-8, criteria).unwrap();
            assert!(v.stable, "{criteria}");
            assert!((v.levels[1] - 2e-4).abs() < 1e-15);
        }
    }

    #[test]
    fn steep_everywhere_is_unstable_for_all_policy() {
        let block = ramp_block(&[1e-6, -2e-6], &[0.0, 0.0], 100);
        let v = detect(&block, FS, 1e-8, StabilityCriteria::AllChannels).unwrap();
        assert!(!v.stable);
        assert!((v.slopes[0] - 1e-6).abs() < 1e-15);
        assert!((v.slopes[1] + 2e-6).abs() < 1e-15);
    }

    #[test]
    fn one_flat_one_steep_splits_policies() {
        let block = ramp_block(&[0.0, 5e-6], &[1e-4, 1e-4], 200);
        let max_slope = 1e-6;
        assert!(detect(&block, FS, max_slope, StabilityCriteria::OneChannel)
            .unwrap()
            .stable);
        assert!(!detect(&block, FS, max_slope, StabilityCriteria::AllChannels)
            .unwrap()
            .stable);
        // mean |slope| = 2.5e-6 > 1e-6
        assert!(!detect(&block, FS, max_slope, StabilityCriteria::Mean)
            .unwrap()
            .stable);
        assert!(detect(&block, FS, 3e-6, StabilityCriteria::Mean).unwrap().stable);
    }

    #[test]
    fn intercept_is_level_at_first_sample() {
        let (slope, level) = fit_line(&[1.0, 2.0, 3.0, 4.0], 2.0).unwrap();
        assert!((slope - 2.0).abs() < 1e-12);
        assert!((level - 1.0).abs() < 1e-12);
    }

    #[test]
    fn single_sample_cannot_be_fitted() {
        assert!(fit_line(&[1.0], FS).is_err());
    }

    #[test]
    fn criteria_parse_from_legacy_labels() {
        #[derive(Deserialize)]
        struct W {
            c: StabilityCriteria,
        }
        let w: W = serde_json::from_str(r#"{"c":"One Channel"}"#).unwrap();
        assert_eq!(w.c, StabilityCriteria::OneChannel);
        let w: W = serde_json::from_str(r#"{"c":"mean"}"#).unwrap();
        assert_eq!(w.c, StabilityCriteria::Mean);
    }
}
