//! Segment-averaged FFT used for Bode gain extraction.
//!
//! A flat sample buffer is split into `n_avg` consecutive segments of
//! `segment_len` samples. Each segment is transformed, scaled by
//! `2 / segment_len` (single-sided amplitude convention, applied to every bin
//! including DC and Nyquist) and the spectra are averaged.

use crate::error::{AppResult, CharactError};
use num_complex::Complex64;
use rustfft::FftPlanner;

/// Number of bins of a real-input FFT of length `n`.
pub fn rfft_len(n: usize) -> usize {
    n / 2 + 1
}

/// Frequencies of the real-input FFT bins for a segment of `n` samples at `fs`.
pub fn rfft_freqs(n: usize, fs: f64) -> Vec<f64> {
    let df = fs / n as f64;
    (0..rfft_len(n)).map(|k| k as f64 * df).collect()
}

/// Single-sided complex spectrum averaged over all segments of `samples`.
///
/// `samples.len()` must be a non-zero multiple of `segment_len`.
pub fn averaged_fft(samples: &[f64], segment_len: usize) -> AppResult<Vec<Complex64>> {
    if segment_len == 0 {
        return Err(CharactError::Processing("FFT segment length is zero".into()));
    }
    if samples.is_empty() || samples.len() % segment_len != 0 {
        return Err(CharactError::Processing(format!(
            "buffer of {} samples is not a multiple of the FFT segment length {}",
            samples.len(),
            segment_len
        )));
    }

    let n_avg = samples.len() / segment_len;
    let n_bins = rfft_len(segment_len);
    let fft = FftPlanner::<f64>::new().plan_fft_forward(segment_len);
    let scale = 2.0 / segment_len as f64;

    let mut acc = vec![Complex64::new(0.0, 0.0); n_bins];
    let mut buffer = Vec::with_capacity(segment_len);
    for segment in samples.chunks_exact(segment_len) {
        buffer.clear();
        buffer.extend(segment.iter().map(|&v| Complex64::new(v, 0.0)));
        fft.process(&mut buffer);
        for (a, b) in acc.iter_mut().zip(&buffer[..n_bins]) {
            *a += *b * scale;
        }
    }

    let n = n_avg as f64;
    Ok(acc.into_iter().map(|a| a / n).collect())
}

/// Pick the given bins out of a spectrum.
pub fn select_bins(spectrum: &[Complex64], bins: &[usize]) -> AppResult<Vec<Complex64>> {
    bins.iter()
        .map(|&b| {
            spectrum
                .get(b)
                .copied()
                .ok_or_else(|| CharactError::IndexOutOfRange {
                    what: "FFT bin".into(),
                    index: b,
                    len: spectrum.len(),
                })
        })
        .collect()
}
