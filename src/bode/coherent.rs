//! Coherent frequency sweeps: tones that fall exactly on FFT bins.

use crate::data::fft::rfft_len;
use crate::error::{AppResult, CharactError};

/// Tone set aligned to the bins of an `n_fft`-sample FFT at `fs`.
#[derive(Debug, Clone, PartialEq)]
pub struct CoherentSweep {
    /// Tone frequencies (Hz), ascending.
    pub freqs: Vec<f64>,
    /// FFT segment length.
    pub n_fft: usize,
    /// Sampling rate (Hz).
    pub fs: f64,
    /// rFFT bin of every tone.
    pub fft_bins: Vec<usize>,
}

/// `n` log-spaced values between `start` and `stop` (inclusive).
pub fn logspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let (a, b) = (start.log10(), stop.log10());
            (0..n)
                .map(|i| 10f64.powf(a + (b - a) * i as f64 / (n - 1) as f64))
                .collect()
        }
    }
}

/// Snap the requested frequencies onto FFT bins at `fs`.
///
/// The segment length is `2^(round(log2(fs / f_min)) + 3)`, giving several
/// periods of the lowest tone per segment. Requested frequencies are log-spaced
/// again between the extremes, rounded to bins and deduplicated, so the result
/// may hold fewer tones than requested.
pub fn coherent_sweep(freqs: &[f64], fs: f64) -> AppResult<CoherentSweep> {
    let (f_min, f_max) = freqs
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &f| {
            (lo.min(f), hi.max(f))
        });
    if freqs.is_empty() || f_min <= 0.0 || !f_max.is_finite() {
        return Err(CharactError::Processing(
            "coherent sweep needs positive finite frequencies".into(),
        ));
    }

    let exponent = (fs / f_min).log2().round() + 3.0;
    let n_fft = 2usize.pow(exponent.max(1.0) as u32);
    let n_min = f_min * n_fft as f64 / fs;
    let n_max = f_max * n_fft as f64 / fs;
    let nyquist_bin = rfft_len(n_fft) - 1;

    let mut bins: Vec<usize> = logspace(n_min, n_max, freqs.len())
        .into_iter()
        .map(|b| b.round() as usize)
        .filter(|&b| b > 0 && b <= nyquist_bin)
        .collect();
    bins.sort_unstable();
    bins.dedup();
    if bins.is_empty() {
        return Err(CharactError::Processing(format!(
            "no coherent bins for {f_min}..{f_max} Hz at {fs} Hz"
        )));
    }

    let df = fs / n_fft as f64;
    Ok(CoherentSweep {
        freqs: bins.iter().map(|&b| b as f64 * df).collect(),
        n_fft,
        fs,
        fft_bins: bins,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logspace_hits_both_ends() {
        let v = logspace(1.0, 1000.0, 4);
        assert_eq!(v.len(), 4);
        assert!((v[0] - 1.0).abs() < 1e-12);
        assert!((v[1] - 10.0).abs() < 1e-9);
        assert!((v[3] - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn tones_sit_on_bins() {
        let req = logspace(1.0, 9.0, 10);
        let sw = coherent_sweep(&req, 30e3).unwrap();
        // log2(30000) = 14.87 -> 15 + 3
        assert_eq!(sw.n_fft, 1 << 18);
        let df = 30e3 / sw.n_fft as f64;
        for (f, b) in sw.freqs.iter().zip(&sw.fft_bins) {
            assert_eq!(*f, *b as f64 * df);
        }
        assert!(sw.fft_bins.windows(2).all(|w| w[0] < w[1]));
        assert!(sw.freqs[0] >= 0.9 && *sw.freqs.last().unwrap() <= 9.1);
    }

    #[test]
    fn crowded_low_bins_are_deduplicated() {
        let req = logspace(10.0, 12.0, 50);
        let sw = coherent_sweep(&req, 1000.0).unwrap();
        assert!(sw.freqs.len() < 50);
    }

    #[test]
    fn empty_request_is_rejected() {
        assert!(coherent_sweep(&[], 1000.0).is_err());
    }
}
