//! Result store.
//!
//! The characterization machine writes every finished measurement through
//! [`ResultSink`] and flushes right after. [`CharactFile`] is the JSON-backed
//! implementation used by the application.

pub mod charact_file;
pub mod grid;

pub use charact_file::CharactFile;
pub use grid::{Cell, Grid};

use crate::error::AppResult;
use num_complex::Complex64;

/// Write side of the result store.
///
/// Indices follow the step catalog: `i_vg`/`i_vd` address the full sweep,
/// `i_vg_ac` the position inside the AC selection. Channels are indices into
/// the run's channel list.
pub trait ResultSink: Send {
    /// DC level and slope of every channel at one bias point.
    fn record_dc(&mut self, i_vg: usize, i_vd: usize, ids: &[f64], slope: &[f64]) -> AppResult<()>;

    /// Mean gate current at one bias point.
    fn record_gate(&mut self, i_vg: usize, i_vd: usize, ig: f64) -> AppResult<()>;

    /// Noise spectrum of one channel; `freqs` must match the store's axis.
    fn record_psd(
        &mut self,
        channel: usize,
        i_vd: usize,
        i_vg_ac: usize,
        freqs: &[f64],
        psd: &[f64],
    ) -> AppResult<()>;

    /// Complex gain of one channel over the stacked Bode frequencies.
    fn record_bode(
        &mut self,
        channel: usize,
        i_vd: usize,
        i_vg_ac: usize,
        gain: &[Complex64],
    ) -> AppResult<()>;

    /// Persist everything recorded so far.
    fn flush(&mut self) -> AppResult<()>;
}
