//! Multi-tone test-signal synthesis.

use crate::bode::coherent::CoherentSweep;
use crate::data::fft::{averaged_fft, select_bins};
use crate::error::{AppResult, CharactError};
use num_complex::Complex64;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Random phase sets tried by the crest-factor search.
const PHASE_TRIALS: usize = 10;

/// How the AC inputs are sampled while a test signal plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionMode {
    /// All AC inputs in one acquisition.
    Parallel,
    /// One AC input per acquisition, the signal replayed for each.
    Sequential,
}

/// A synthesized multi-tone drive signal and its reference spectrum.
#[derive(Debug, Clone)]
pub struct TestSignal {
    /// Tone frequencies (Hz).
    pub freqs: Vec<f64>,
    /// Tone phases (rad).
    pub phases: Vec<f64>,
    /// FFT segment length.
    pub n_fft: usize,
    /// Output/input sampling rate (Hz).
    pub fs: f64,
    /// rFFT bin of every tone.
    pub fft_bins: Vec<usize>,
    /// Drive samples, `n_fft * n_avg` long.
    pub samples: Vec<f64>,
    /// Averaged-FFT value of the drive at every tone bin.
    pub fft_amps: Vec<Complex64>,
    /// Peak-to-peak amplitude (V).
    pub vpp: f64,
    /// Duration of one playback (s).
    pub acq_time: f64,
    /// Input sampling scheme.
    pub mode: AcquisitionMode,
}

fn render(freqs: &[f64], phases: &[f64], amp: f64, fs: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let t = i as f64 / fs;
            freqs
                .iter()
                .zip(phases)
                .map(|(&f, &p)| amp * (2.0 * PI * f * t + p).cos())
                .sum()
        })
        .collect()
}

fn peak_to_peak(samples: &[f64]) -> f64 {
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    max + min.abs()
}

impl TestSignal {
    /// Synthesize `sum(amp * cos(2*pi*f*t + phase))` over `n_fft * n_avg` samples.
    ///
    /// With `phase_optim` the phases are drawn at random a few times and the set
    /// with the smallest peak-to-peak excursion is kept; otherwise all phases are
    /// zero. The last sample is forced to zero so the output returns to rest.
    pub fn generate<R: Rng + ?Sized>(
        sweep: &CoherentSweep,
        amp: f64,
        n_avg: usize,
        phase_optim: bool,
        mode: AcquisitionMode,
        rng: &mut R,
    ) -> AppResult<Self> {
        let n = sweep.n_fft * n_avg.max(1);
        let n_tones = sweep.freqs.len();

        let phases = if phase_optim {
            let mut best: Option<(f64, Vec<f64>)> = None;
            for _ in 0..PHASE_TRIALS {
                let candidate: Vec<f64> = (0..n_tones).map(|_| rng.gen_range(-PI..PI)).collect();
                let vpp = peak_to_peak(&render(&sweep.freqs, &candidate, amp, sweep.fs, n));
                if best.as_ref().map_or(true, |(b, _)| vpp < *b) {
                    best = Some((vpp, candidate));
                }
            }
            best.map(|(_, p)| p).unwrap_or_else(|| vec![0.0; n_tones])
        } else {
            vec![0.0; n_tones]
        };

        let mut samples = render(&sweep.freqs, &phases, amp, sweep.fs, n);
        if let Some(last) = samples.last_mut() {
            *last = 0.0;
        }

        let spectrum = averaged_fft(&samples, sweep.n_fft)?;
        let fft_amps = select_bins(&spectrum, &sweep.fft_bins)?;

        Ok(Self {
            freqs: sweep.freqs.clone(),
            phases,
            n_fft: sweep.n_fft,
            fs: sweep.fs,
            fft_bins: sweep.fft_bins.clone(),
            vpp: peak_to_peak(&samples),
            acq_time: (n - 1) as f64 / sweep.fs,
            samples,
            fft_amps,
            mode,
        })
    }

    /// Number of samples in one playback.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the signal has no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Averaged-FFT value at every tone bin of a response recorded while this signal played.
    pub fn measure(&self, response: &[f64]) -> AppResult<Vec<Complex64>> {
        let spectrum = averaged_fft(response, self.n_fft)?;
        select_bins(&spectrum, &self.fft_bins)
    }

    /// Divide measured bin values by the drive bin values.
    pub fn normalize(&self, measured: &[Complex64]) -> AppResult<Vec<Complex64>> {
        if measured.len() != self.fft_amps.len() {
            return Err(CharactError::ShapeMismatch {
                what: "measured tone bins".into(),
                expected: self.fft_amps.len(),
                actual: measured.len(),
            });
        }
        Ok(measured
            .iter()
            .zip(&self.fft_amps)
            .map(|(m, d)| *m / *d)
            .collect())
    }

    /// Complex gain per tone of a response recorded while this signal played.
    pub fn gain_of(&self, response: &[f64]) -> AppResult<Vec<Complex64>> {
        self.normalize(&self.measure(response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bode::coherent::coherent_sweep;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sweep() -> CoherentSweep {
        coherent_sweep(&[20.0, 40.0, 80.0, 160.0], 2000.0).unwrap()
    }

    #[test]
    fn drive_bins_carry_tone_amplitude() {
        let mut rng = StdRng::seed_from_u64(1);
        let sig = TestSignal::generate(&sweep(), 0.01, 2, false, AcquisitionMode::Parallel, &mut rng)
            .unwrap();
        assert_eq!(sig.len(), sig.n_fft * 2);
        assert_eq!(*sig.samples.last().unwrap(), 0.0);
        // The zeroed last sample leaks a little; amplitudes stay close to `amp`.
        for a in &sig.fft_amps {
            assert!((a.norm() - 0.01).abs() < 1e-3, "{a}");
        }
    }

    #[test]
    fn scaled_response_yields_constant_gain() {
        let mut rng = StdRng::seed_from_u64(2);
        let sig = TestSignal::generate(&sweep(), 0.01, 1, true, AcquisitionMode::Sequential, &mut rng)
            .unwrap();
        let response: Vec<f64> = sig.samples.iter().map(|v| -2.5e-4 * v).collect();
        for g in sig.gain_of(&response).unwrap() {
            assert!((g.re + 2.5e-4).abs() < 1e-12 && g.im.abs() < 1e-12, "{g}");
        }
    }

    #[test]
    fn phase_search_is_reproducible_for_a_seed() {
        let a = TestSignal::generate(
            &sweep(),
            0.01,
            1,
            true,
            AcquisitionMode::Parallel,
            &mut StdRng::seed_from_u64(3),
        )
        .unwrap();
        let b = TestSignal::generate(
            &sweep(),
            0.01,
            1,
            true,
            AcquisitionMode::Parallel,
            &mut StdRng::seed_from_u64(3),
        )
        .unwrap();
        assert_eq!(a.phases, b.phases);
        assert!(a.phases.iter().all(|p| (-PI..PI).contains(p)));
        assert!(a.phases.iter().any(|p| *p != 0.0));
    }
}
