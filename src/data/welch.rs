//! Welch power spectral density estimator.
//!
//! Mean of modified periodograms over half-overlapping segments: periodic Hann
//! window, constant detrend per segment, one-sided density scaling (V²/Hz).

use crate::data::block::SampleBlock;
use crate::data::fft::{rfft_freqs, rfft_len};
use crate::error::{AppResult, CharactError};
use num_complex::Complex64;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// Periodic Hann window of length `n`.
pub fn hann_periodic(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos())
        .collect()
}

/// PSD of every channel of a block.
#[derive(Debug, Clone)]
pub struct PsdEstimate {
    /// Frequency axis (Hz), `nperseg / 2 + 1` bins.
    pub freqs: Vec<f64>,
    /// One PSD vector per channel, same length as `freqs`.
    pub psd: Vec<Vec<f64>>,
}

/// Welch estimate for a single trace.
pub fn welch(samples: &[f64], fs: f64, nperseg: usize) -> AppResult<(Vec<f64>, Vec<f64>)> {
    if nperseg < 2 {
        return Err(CharactError::Processing(format!(
            "Welch segment length must be >= 2, got {nperseg}"
        )));
    }
    if samples.len() < nperseg {
        return Err(CharactError::Processing(format!(
            "Welch needs at least {nperseg} samples, got {}",
            samples.len()
        )));
    }

    let noverlap = nperseg / 2;
    let step = nperseg - noverlap;
    let n_segments = (samples.len() - noverlap) / step;

    let window = hann_periodic(nperseg);
    let win_power: f64 = window.iter().map(|w| w * w).sum();
    let scale = 1.0 / (fs * win_power);
    let n_bins = rfft_len(nperseg);
    let fft = FftPlanner::<f64>::new().plan_fft_forward(nperseg);

    let mut psd = vec![0.0; n_bins];
    let mut buffer: Vec<Complex64> = Vec::with_capacity(nperseg);
    for s in 0..n_segments {
        let segment = &samples[s * step..s * step + nperseg];
        let mean = segment.iter().sum::<f64>() / nperseg as f64;
        buffer.clear();
        buffer.extend(
            segment
                .iter()
                .zip(&window)
                .map(|(&v, &w)| Complex64::new((v - mean) * w, 0.0)),
        );
        fft.process(&mut buffer);
        for (p, x) in psd.iter_mut().zip(&buffer[..n_bins]) {
            *p += x.norm_sqr() * scale;
        }
    }

    let last = if nperseg % 2 == 0 { n_bins - 1 } else { n_bins };
    for (k, p) in psd.iter_mut().enumerate() {
        *p /= n_segments as f64;
        if k > 0 && k < last {
            *p *= 2.0;
        }
    }

    Ok((rfft_freqs(nperseg, fs), psd))
}

/// Welch estimate over each channel of a block.
pub fn welch_block(block: &SampleBlock, fs: f64, nperseg: usize) -> AppResult<PsdEstimate> {
    let mut freqs = Vec::new();
    let mut psd = Vec::with_capacity(block.n_channels());
    for column in block.deinterleave() {
        let (f, p) = welch(&column, fs, nperseg)?;
        freqs = f;
        psd.push(p);
    }
    Ok(PsdEstimate { freqs, psd })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn white_noise_density_integrates_to_variance() {
        // Deterministic pseudo-noise: uniform LCG in [-0.5, 0.5).
        let mut state: u64 = 12345;
        let samples: Vec<f64> = (0..4096 * 8)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 11) as f64 / (1u64 << 53) as f64 - 0.5
            })
            .collect();
        let fs = 1000.0;
        let (freqs, psd) = welch(&samples, fs, 1024).unwrap();
        assert_eq!(freqs.len(), 513);
        let df = freqs[1] - freqs[0];
        let power: f64 = psd.iter().sum::<f64>() * df;
        let variance = 1.0 / 12.0;
        assert!((power - variance).abs() / variance < 0.05, "power {power}");
    }

    #[test]
    fn sinusoid_peaks_at_its_frequency() {
        let fs = 512.0;
        let samples: Vec<f64> = (0..2048)
            .map(|i| (2.0 * PI * 32.0 * i as f64 / fs).sin())
            .collect();
        let (freqs, psd) = welch(&samples, fs, 256).unwrap();
        let peak = psd
            .iter()
            .enumerate()
            .fold((0, 0.0), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc });
        assert_eq!(freqs[peak.0], 32.0);
    }

    #[test]
    fn constant_offset_is_removed() {
        let (_, psd) = welch(&[3.0; 512], 100.0, 128).unwrap();
        assert!(psd.iter().all(|p| p.abs() < 1e-20));
    }

    #[test]
    fn short_trace_is_rejected() {
        assert!(welch(&[0.0; 10], 100.0, 16).is_err());
    }
}
