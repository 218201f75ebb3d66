//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use gfet_charact::config::Settings;
use gfet_charact::error::AppResult;
use gfet_charact::hardware::{DeviceModel, SimulatedHardware};
use gfet_charact::storage::{CharactFile, ResultSink};
use gfet_charact::sweep::SweepConfig;
use num_complex::Complex64;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Two-channel board, 5 Vgs x 1 Vds, every measurement enabled.
pub const BOARD: &str = r#"
[board]
name = "MB41"
channels = [
  { name = "Ch01", dc_input = "ai0", ac_input = "ai8" },
  { name = "Ch02", dc_input = "ai1", ac_input = "ai9" },
]
gains = { dc = 1e4, ac = 1e6, gate = 1e6 }
outputs = { vs = "ao1", vds = "ao0", vg = "ao2" }

[board.switch]
douts = ["port0/line0", "port0/line1"]
gate_input = "ai7"
states = { dc = [false, false], ac = [true, false], gate = [false, true] }

[sweep]
vgs = { start = 0.0, stop = 0.4, points = 5 }
vds = { start = 0.05, stop = 0.05, points = 1 }
measure_gate = true
measure_psd = true
measure_bode = true
ac_selection = "0:5:2"

[dc]
criteria = "One Channel"
timeout_s = 5.0

[psd]
fs = 1000.0
n_fft = 8
n_avg = 2

[bode]
freq_min = 10.0
freq_max = 200.0
n_freqs = 8
freq_split = 50.0
fs_low = 1000.0
fs_high = 4000.0
n_avg = 1
seed = 3
"#;

pub fn settings() -> Settings {
    Settings::from_toml_str(BOARD).unwrap()
}

/// Settings with textual replacements applied to [`BOARD`].
pub fn settings_with(replacements: &[(&str, &str)]) -> Settings {
    let mut toml = BOARD.to_string();
    for (from, to) in replacements {
        assert!(toml.contains(from), "fixture has no '{from}'");
        toml = toml.replace(from, to);
    }
    Settings::from_toml_str(&toml).unwrap()
}

/// DC-only sweep: no gate, no AC.
pub fn dc_only() -> Settings {
    settings_with(&[
        ("measure_gate = true", "measure_gate = false"),
        ("measure_psd = true", "measure_psd = false"),
        ("measure_bode = true", "measure_bode = false"),
    ])
}

/// Noise-free devices that settle instantly.
pub fn quiet() -> DeviceModel {
    DeviceModel {
        noise_rms: 0.0,
        ac_noise_rms: 0.0,
        settle_fraction: 0.0,
        seed: Some(11),
        ..DeviceModel::default()
    }
}

/// Devices whose current keeps rising, never passing the stability test.
pub fn drifting() -> DeviceModel {
    DeviceModel {
        drift_per_s: 1e-6,
        ..quiet()
    }
}

pub fn hardware(settings: &Settings, model: DeviceModel) -> SimulatedHardware {
    SimulatedHardware::new(&settings.board, model, 1.0)
}

pub fn plan(settings: &Settings) -> SweepConfig {
    SweepConfig::from_settings(settings).unwrap()
}

/// One call on a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Dc { i_vg: usize, i_vd: usize },
    Gate { i_vg: usize, i_vd: usize },
    Psd { channel: usize, i_vd: usize, i_vg_ac: usize },
    Bode { channel: usize, i_vd: usize, i_vg_ac: usize },
    Flush,
}

/// [`CharactFile`] wrapper logging every call.
pub struct RecordingSink {
    pub file: CharactFile,
    pub calls: Arc<Mutex<Vec<SinkCall>>>,
}

impl RecordingSink {
    pub fn new(file: CharactFile) -> Self {
        Self {
            file,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().clone()
    }

    pub fn records(&self) -> Vec<SinkCall> {
        self.calls()
            .into_iter()
            .filter(|c| *c != SinkCall::Flush)
            .collect()
    }

    /// Whether any record call was repeated.
    pub fn has_duplicates(&self) -> bool {
        let records = self.records();
        let unique: HashSet<String> = records.iter().map(|c| format!("{c:?}")).collect();
        unique.len() != records.len()
    }
}

impl ResultSink for RecordingSink {
    fn record_dc(&mut self, i_vg: usize, i_vd: usize, ids: &[f64], slope: &[f64]) -> AppResult<()> {
        self.calls.lock().push(SinkCall::Dc { i_vg, i_vd });
        self.file.record_dc(i_vg, i_vd, ids, slope)
    }

    fn record_gate(&mut self, i_vg: usize, i_vd: usize, ig: f64) -> AppResult<()> {
        self.calls.lock().push(SinkCall::Gate { i_vg, i_vd });
        self.file.record_gate(i_vg, i_vd, ig)
    }

    fn record_psd(
        &mut self,
        channel: usize,
        i_vd: usize,
        i_vg_ac: usize,
        freqs: &[f64],
        psd: &[f64],
    ) -> AppResult<()> {
        self.calls.lock().push(SinkCall::Psd {
            channel,
            i_vd,
            i_vg_ac,
        });
        self.file.record_psd(channel, i_vd, i_vg_ac, freqs, psd)
    }

    fn record_bode(
        &mut self,
        channel: usize,
        i_vd: usize,
        i_vg_ac: usize,
        gain: &[Complex64],
    ) -> AppResult<()> {
        self.calls.lock().push(SinkCall::Bode {
            channel,
            i_vd,
            i_vg_ac,
        });
        self.file.record_bode(channel, i_vd, i_vg_ac, gain)
    }

    fn flush(&mut self) -> AppResult<()> {
        self.calls.lock().push(SinkCall::Flush);
        self.file.flush()
    }
}
