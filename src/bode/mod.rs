//! Bode (transconductance) test signals.
//!
//! A Bode measurement plays one or more multi-tone [`TestSignal`]s on the gate
//! output and extracts the complex gain of every AC channel at the tone bins.
//! The requested log-spaced band is split in two: tones below the split
//! frequency are acquired on all channels at once at the low rate, tones at or
//! above it one channel at a time at the high rate.

pub mod coherent;
pub mod synth;

pub use coherent::{coherent_sweep, logspace, CoherentSweep};
pub use synth::{AcquisitionMode, TestSignal};

use crate::config::BodeSettings;
use crate::error::{AppResult, CharactError};
use rand::Rng;
use tracing::info;

/// Every test signal of one Bode step, in acquisition order.
#[derive(Debug, Clone)]
pub struct BodePlan {
    /// Test signals, low band first.
    pub signals: Vec<TestSignal>,
}

impl BodePlan {
    /// Build the low/high band signals described by `settings`.
    pub fn generate<R: Rng + ?Sized>(settings: &BodeSettings, rng: &mut R) -> AppResult<Self> {
        let requested = logspace(settings.freq_min, settings.freq_max, settings.n_freqs);
        let (low, high): (Vec<f64>, Vec<f64>) = requested
            .into_iter()
            .partition(|&f| f < settings.freq_split);

        let mut signals = Vec::with_capacity(2);
        for (band, fs, mode) in [
            (low, settings.fs_low, AcquisitionMode::Parallel),
            (high, settings.fs_high, AcquisitionMode::Sequential),
        ] {
            if band.is_empty() {
                continue;
            }
            let sweep = coherent_sweep(&band, fs)?;
            let signal = TestSignal::generate(
                &sweep,
                settings.amp,
                settings.n_avg,
                settings.phase_optim,
                mode,
                rng,
            )?;
            info!(
                mode = ?mode,
                fs,
                n_fft = signal.n_fft,
                tones = signal.freqs.len(),
                vpp = signal.vpp,
                acq_time = signal.acq_time,
                "Test signal generated"
            );
            signals.push(signal);
        }

        if signals.is_empty() {
            return Err(CharactError::Configuration(
                "bode: no test signal could be generated".into(),
            ));
        }
        Ok(Self { signals })
    }

    /// Gain frequency axis: all signals' tones, stacked in acquisition order.
    pub fn freqs(&self) -> Vec<f64> {
        self.signals
            .iter()
            .flat_map(|s| s.freqs.iter().copied())
            .collect()
    }

    /// Number of rows of the stacked gain array.
    pub fn n_freqs(&self) -> usize {
        self.signals.iter().map(|s| s.freqs.len()).sum()
    }

    /// Playback time of one Bode step for `n_channels` AC inputs (s).
    pub fn acq_time(&self, n_channels: usize) -> f64 {
        self.signals
            .iter()
            .map(|s| match s.mode {
                AcquisitionMode::Parallel => s.acq_time,
                AcquisitionMode::Sequential => s.acq_time * n_channels as f64,
            })
            .sum()
    }

    /// Number of acquisitions one Bode step needs for `n_channels` AC inputs.
    pub fn n_acquisitions(&self, n_channels: usize) -> usize {
        self.signals
            .iter()
            .map(|s| match s.mode {
                AcquisitionMode::Parallel => 1,
                AcquisitionMode::Sequential => n_channels,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn settings() -> BodeSettings {
        BodeSettings {
            freq_min: 10.0,
            freq_max: 200.0,
            n_freqs: 8,
            freq_split: 50.0,
            fs_low: 1000.0,
            fs_high: 4000.0,
            n_avg: 1,
            ..BodeSettings::default()
        }
    }

    #[test]
    fn band_is_split_into_parallel_and_sequential_signals() {
        let plan = BodePlan::generate(&settings(), &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(plan.signals.len(), 2);
        assert_eq!(plan.signals[0].mode, AcquisitionMode::Parallel);
        assert_eq!(plan.signals[1].mode, AcquisitionMode::Sequential);
        assert!(plan.signals[0].freqs.iter().all(|&f| f < 55.0));
        assert!(plan.signals[1].freqs.iter().all(|&f| f > 45.0));
        assert_eq!(plan.freqs().len(), plan.n_freqs());
        assert_eq!(plan.n_acquisitions(3), 4);
    }

    #[test]
    fn sequential_time_scales_with_channels() {
        let plan = BodePlan::generate(&settings(), &mut StdRng::seed_from_u64(0)).unwrap();
        let t1 = plan.acq_time(1);
        let t2 = plan.acq_time(2);
        assert!((t2 - t1 - plan.signals[1].acq_time).abs() < 1e-12);
    }

    #[test]
    fn band_entirely_below_split_gives_one_signal() {
        let s = BodeSettings {
            freq_split: 1e3,
            ..settings()
        };
        let plan = BodePlan::generate(&s, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(plan.signals.len(), 1);
        assert_eq!(plan.signals[0].mode, AcquisitionMode::Parallel);
    }

    #[test]
    fn tone_at_split_is_acquired_sequentially() {
        let s = BodeSettings {
            freq_min: 50.0,
            n_freqs: 1,
            ..settings()
        };
        let plan = BodePlan::generate(&s, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(plan.signals.len(), 1);
        assert_eq!(plan.signals[0].mode, AcquisitionMode::Sequential);
        assert_eq!(plan.signals[0].fs, 4000.0);
    }
}
