//! Immutable run plan.
//!
//! [`SweepConfig`] is produced once from validated [`Settings`] before a run
//! and never changes afterwards. The step catalog in [`steps`] expands it into
//! the ordered instruction list consumed by the characterization machine.

pub mod selection;
pub mod steps;

pub use selection::AcSelection;
pub use steps::{build_steps, Step, StepKind};

use crate::bode::BodePlan;
use crate::config::{DcSettings, PsdSettings, Settings};
use crate::data::fft::rfft_freqs;
use crate::error::{AppResult, CharactError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A bias sweep, either by point count or by step size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VoltageSweep {
    /// `points` evenly spaced values, both ends included.
    Points {
        /// First value (V)
        start: f64,
        /// Last value (V)
        stop: f64,
        /// Number of values
        points: usize,
    },
    /// Values `start, start + step, ...` strictly before `stop`.
    Step {
        /// First value (V)
        start: f64,
        /// Exclusive end (V)
        stop: f64,
        /// Increment (V)
        step: f64,
    },
}

impl VoltageSweep {
    /// Sweep values in order.
    pub fn values(&self) -> Vec<f64> {
        match *self {
            VoltageSweep::Points {
                start,
                stop,
                points,
            } => match points {
                0 => Vec::new(),
                1 => vec![start],
                n => {
                    let d = (stop - start) / (n - 1) as f64;
                    (0..n).map(|i| start + d * i as f64).collect()
                }
            },
            VoltageSweep::Step { start, stop, step } => {
                let n = ((stop - start) / step).ceil().max(0.0) as usize;
                (0..n).map(|i| start + step * i as f64).collect()
            }
        }
    }

    /// Number of sweep values.
    pub fn len(&self) -> usize {
        self.values().len()
    }

    /// Whether the sweep produces no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spacing between consecutive values (0 for a single point).
    pub fn step(&self) -> f64 {
        match *self {
            VoltageSweep::Points {
                start,
                stop,
                points,
            } if points > 1 => (stop - start) / (points - 1) as f64,
            VoltageSweep::Points { .. } => 0.0,
            VoltageSweep::Step { step, .. } => step,
        }
    }

    /// Reject non-finite bounds and sweeps without values.
    pub fn validate(&self, field: &str) -> AppResult<()> {
        let err = |msg: &str| CharactError::Configuration(format!("{field}: {msg}"));
        let (start, stop) = match *self {
            VoltageSweep::Points { start, stop, .. } | VoltageSweep::Step { start, stop, .. } => {
                (start, stop)
            }
        };
        if !start.is_finite() || !stop.is_finite() {
            return Err(err("start and stop must be finite"));
        }
        if let VoltageSweep::Step { step, .. } = *self {
            if !step.is_finite() || step == 0.0 {
                return Err(err("step must be finite and non-zero"));
            }
        }
        if self.is_empty() {
            return Err(err("sweep produces no values"));
        }
        Ok(())
    }
}

/// Noise acquisition parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsdPlan {
    /// Sampling rate (Hz)
    pub fs: f64,
    /// Segment length exponent
    pub n_fft: u32,
    /// Segments acquired
    pub n_avg: usize,
}

impl PsdPlan {
    /// Welch segment length, `2^n_fft`.
    pub fn nperseg(&self) -> usize {
        1usize << self.n_fft
    }

    /// Samples per channel of one PSD acquisition.
    pub fn n_samples(&self) -> usize {
        self.nperseg() * self.n_avg
    }

    /// PSD frequency axis.
    pub fn freqs(&self) -> Vec<f64> {
        rfft_freqs(self.nperseg(), self.fs)
    }

    /// Frequency resolution, the lowest non-zero PSD bin (Hz).
    pub fn fmin(&self) -> f64 {
        self.fs / self.nperseg() as f64
    }

    /// Duration of one acquisition (s).
    pub fn acq_time(&self) -> f64 {
        self.n_samples() as f64 / self.fs
    }
}

impl From<&PsdSettings> for PsdPlan {
    fn from(s: &PsdSettings) -> Self {
        Self {
            fs: s.fs,
            n_fft: s.n_fft,
            n_avg: s.n_avg,
        }
    }
}

/// AC part of the plan: which Vgs points get AC steps and with what.
#[derive(Debug, Clone)]
pub struct AcPlan {
    /// Selected Vgs indices
    pub selection: AcSelection,
    /// Vgs values at the selected indices
    pub vgs: Vec<f64>,
    /// PSD acquisition, when enabled
    pub psd: Option<PsdPlan>,
    /// Bode test signals, when enabled
    pub bode: Option<Arc<BodePlan>>,
}

/// Acquisition time estimate for a whole run (s).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcqTimeEstimate {
    /// Upper bound for all DC points (every point reaching its timeout)
    pub dc_s: f64,
    /// All AC steps
    pub ac_s: f64,
    /// `dc_s + ac_s`
    pub total_s: f64,
}

/// Immutable, validated plan of one characterization run.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Channel names in acquisition order
    pub channels: Vec<String>,
    /// Vgs values (V)
    pub vgs: Vec<f64>,
    /// Vds values (V)
    pub vds: Vec<f64>,
    /// DC stability parameters
    pub dc: DcSettings,
    /// Measure gate current after every DC point
    pub gate: bool,
    /// AC measurements, absent when neither PSD nor Bode is enabled
    pub ac: Option<AcPlan>,
}

impl SweepConfig {
    /// Freeze `settings` into a run plan, generating the Bode test signals.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        settings.validate()?;
        let sweep = &settings.sweep;
        let vgs = sweep.vgs.values();
        let vds = sweep.vds.values();

        let ac = if sweep.measure_psd || sweep.measure_bode {
            let selection = AcSelection::new(sweep.ac_selection.as_deref(), vgs.len())?;
            if selection.indices().is_empty() {
                warn!(expr = selection.expr(), "AC selection is empty, no AC steps");
            }
            let bode = if sweep.measure_bode {
                let mut rng = match settings.bode.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                Some(Arc::new(BodePlan::generate(&settings.bode, &mut rng)?))
            } else {
                None
            };
            Some(AcPlan {
                vgs: selection.indices().iter().map(|&i| vgs[i]).collect(),
                selection,
                psd: sweep.measure_psd.then(|| PsdPlan::from(&settings.psd)),
                bode,
            })
        } else {
            None
        };

        let cfg = Self {
            channels: settings.board.channel_names(),
            vgs,
            vds,
            dc: settings.dc,
            gate: sweep.measure_gate,
            ac,
        };
        let est = cfg.estimate();
        info!(
            n_vgs = cfg.vgs.len(),
            n_vds = cfg.vds.len(),
            n_ac = cfg.n_ac(),
            estimate_s = est.total_s,
            "Sweep plan ready"
        );
        Ok(cfg)
    }

    /// Number of Vgs points with AC measurements.
    pub fn n_ac(&self) -> usize {
        self.ac.as_ref().map_or(0, |a| a.selection.indices().len())
    }

    /// PSD plan, when PSD is measured.
    pub fn psd(&self) -> Option<&PsdPlan> {
        self.ac.as_ref().and_then(|a| a.psd.as_ref())
    }

    /// Bode plan, when Bode is measured.
    pub fn bode(&self) -> Option<&Arc<BodePlan>> {
        self.ac.as_ref().and_then(|a| a.bode.as_ref())
    }

    /// Replace the AC point selection; an invalid expression keeps the
    /// previous one.
    pub fn select_ac(&mut self, expr: &str) -> bool {
        let Some(ac) = self.ac.as_mut() else {
            warn!(expr, "No AC measurement enabled, selection ignored");
            return false;
        };
        if !ac.selection.update(expr) {
            return false;
        }
        ac.vgs = ac.selection.indices().iter().map(|&i| self.vgs[i]).collect();
        debug!(expr, n_ac = ac.vgs.len(), "AC selection replaced");
        true
    }

    /// Worst-case duration of the run.
    pub fn estimate(&self) -> AcqTimeEstimate {
        let n_points = (self.vgs.len() * self.vds.len()) as f64;
        let dc_s = n_points * self.dc.timeout_s;
        let per_ac = self.psd().map_or(0.0, PsdPlan::acq_time)
            + self
                .bode()
                .map_or(0.0, |b| b.acq_time(self.channels.len()));
        let ac_s = (self.n_ac() * self.vds.len()) as f64 * per_ac;
        AcqTimeEstimate {
            dc_s,
            ac_s,
            total_s: dc_s + ac_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;

    #[test]
    fn points_sweep_includes_both_ends() {
        let s = VoltageSweep::Points {
            start: 0.0,
            stop: 0.4,
            points: 5,
        };
        let v = s.values();
        assert_eq!(v.len(), 5);
        assert!((v[4] - 0.4).abs() < 1e-12);
        assert!((s.step() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn step_sweep_excludes_stop() {
        let s = VoltageSweep::Step {
            start: 0.0,
            stop: 0.3,
            step: 0.1,
        };
        assert_eq!(s.len(), 3);
        let down = VoltageSweep::Step {
            start: 0.5,
            stop: -0.25,
            step: -0.25,
        };
        assert_eq!(down.len(), 3);
    }

    #[test]
    fn empty_or_degenerate_sweeps_are_rejected() {
        let wrong_sign = VoltageSweep::Step {
            start: 0.0,
            stop: 1.0,
            step: -0.1,
        };
        assert!(wrong_sign.validate("vgs").is_err());
        let zero = VoltageSweep::Points {
            start: 0.0,
            stop: 1.0,
            points: 0,
        };
        assert!(zero.validate("vgs").is_err());
    }

    #[test]
    fn plan_from_sample_settings() {
        let mut settings = Settings::from_toml_str(SAMPLE).unwrap();
        settings.bode.seed = Some(7);
        let cfg = SweepConfig::from_settings(&settings).unwrap();
        assert_eq!(cfg.vgs.len(), 5);
        assert_eq!(cfg.vds.len(), 1);
        let ac = cfg.ac.as_ref().unwrap();
        assert_eq!(ac.selection.indices(), &[0, 2, 4]);
        assert!((ac.vgs[1] - 0.2).abs() < 1e-12);
        assert_eq!(cfg.psd().unwrap().nperseg(), 256);
        assert_eq!(cfg.bode().unwrap().signals.len(), 2);
    }

    #[test]
    fn estimate_adds_dc_and_ac_time() {
        let mut settings = Settings::from_toml_str(SAMPLE).unwrap();
        settings.sweep.measure_bode = false;
        let cfg = SweepConfig::from_settings(&settings).unwrap();
        let est = cfg.estimate();
        assert!((est.dc_s - 5.0 * 5.0).abs() < 1e-9);
        // 3 AC points, 256 * 2 samples at 1 kHz
        assert!((est.ac_s - 3.0 * 0.512).abs() < 1e-9);
        assert!((est.total_s - est.dc_s - est.ac_s).abs() < 1e-12);
    }

    #[test]
    fn psd_resolution() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let cfg = SweepConfig::from_settings(&settings).unwrap();
        let psd = cfg.psd().unwrap();
        assert!((psd.fmin() - 1000.0 / 256.0).abs() < 1e-12);
        assert!((psd.freqs()[1] - psd.fmin()).abs() < 1e-12);
    }

    #[test]
    fn reselecting_ac_points() {
        let mut settings = Settings::from_toml_str(SAMPLE).unwrap();
        settings.sweep.measure_bode = false;
        let mut cfg = SweepConfig::from_settings(&settings).unwrap();

        assert!(cfg.select_ac("1,3"));
        let ac = cfg.ac.as_ref().unwrap();
        assert_eq!(ac.selection.indices(), &[1, 3]);
        assert_eq!(ac.vgs, vec![cfg.vgs[1], cfg.vgs[3]]);
        assert_eq!(build_steps(&cfg).len(), 5 + 5 + 2);

        assert!(!cfg.select_ac("2:x"));
        assert_eq!(cfg.ac.as_ref().unwrap().selection.indices(), &[1, 3]);
        assert_eq!(cfg.n_ac(), 2);
    }

    #[test]
    fn no_ac_measurements_means_no_ac_plan() {
        let mut settings = Settings::from_toml_str(SAMPLE).unwrap();
        settings.sweep.measure_bode = false;
        settings.sweep.measure_psd = false;
        let cfg = SweepConfig::from_settings(&settings).unwrap();
        assert!(cfg.ac.is_none());
        assert_eq!(cfg.n_ac(), 0);
    }
}
