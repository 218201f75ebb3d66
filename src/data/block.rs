//! Interleaved multi-channel sample blocks.

use crate::error::{AppResult, CharactError};

/// A block of samples delivered by one acquisition callback.
///
/// Samples are stored scan by scan (rows = time, columns = channel):
/// `[scan0_ch0, scan0_ch1, ..., scan1_ch0, scan1_ch1, ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    data: Vec<f64>,
    n_channels: usize,
}

impl SampleBlock {
    /// Build a block from interleaved data.
    pub fn new(data: Vec<f64>, n_channels: usize) -> AppResult<Self> {
        if n_channels == 0 {
            return Err(CharactError::Processing(
                "sample block needs at least one channel".into(),
            ));
        }
        if data.len() % n_channels != 0 {
            return Err(CharactError::ShapeMismatch {
                what: "interleaved sample block".into(),
                expected: n_channels * (data.len() / n_channels + 1),
                actual: data.len(),
            });
        }
        Ok(Self { data, n_channels })
    }

    /// Build a block from per-channel columns of equal length.
    pub fn from_columns(columns: &[Vec<f64>]) -> AppResult<Self> {
        let n_channels = columns.len();
        let n_scans = columns.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = columns.iter().find(|c| c.len() != n_scans) {
            return Err(CharactError::ShapeMismatch {
                what: "sample block column".into(),
                expected: n_scans,
                actual: bad.len(),
            });
        }
        let mut data = Vec::with_capacity(n_channels * n_scans);
        for scan in 0..n_scans {
            data.extend(columns.iter().map(|c| c[scan]));
        }
        Self::new(data, n_channels)
    }

    /// Number of channels per scan.
    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    /// Number of complete scans in this block.
    pub fn n_scans(&self) -> usize {
        self.data.len() / self.n_channels
    }

    /// Whether the block carries no scans.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw interleaved samples.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Get data for a specific channel.
    pub fn channel_data(&self, channel: usize) -> Vec<f64> {
        if channel >= self.n_channels {
            return Vec::new();
        }
        self.data
            .iter()
            .skip(channel)
            .step_by(self.n_channels)
            .copied()
            .collect()
    }

    /// Reshape data into per-channel vectors.
    pub fn deinterleave(&self) -> Vec<Vec<f64>> {
        let mut channels = vec![Vec::with_capacity(self.n_scans()); self.n_channels];
        for (i, &v) in self.data.iter().enumerate() {
            channels[i % self.n_channels].push(v);
        }
        channels
    }

    /// Mean of every channel.
    pub fn channel_means(&self) -> Vec<f64> {
        let n = self.n_scans();
        if n == 0 {
            return vec![f64::NAN; self.n_channels];
        }
        let mut acc = vec![0.0; self.n_channels];
        for (i, &v) in self.data.iter().enumerate() {
            acc[i % self.n_channels] += v;
        }
        acc.into_iter().map(|s| s / n as f64).collect()
    }

    /// Apply `f(channel, value)` to every sample in place.
    pub fn map_in_place(&mut self, mut f: impl FnMut(usize, f64) -> f64) {
        let n_channels = self.n_channels;
        for (i, v) in self.data.iter_mut().enumerate() {
            *v = f(i % n_channels, *v);
        }
    }

    /// Append the scans of another block with the same channel count.
    pub fn extend(&mut self, other: &SampleBlock) -> AppResult<()> {
        if other.n_channels != self.n_channels {
            return Err(CharactError::ShapeMismatch {
                what: "appended block channels".into(),
                expected: self.n_channels,
                actual: other.n_channels,
            });
        }
        self.data.extend_from_slice(&other.data);
        Ok(())
    }
}
