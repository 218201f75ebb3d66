//! Configuration System using Figment
//!
//! Strongly-typed configuration for a characterization run. Configuration is loaded from:
//! 1. a TOML file (board description, sweeps, acquisition parameters)
//! 2. Environment variables (prefixed with `GFET_`, nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use gfet_charact::config::Settings;
//!
//! let settings = Settings::load_from("config/gfet.toml")?;
//! println!("Board: {}", settings.board.name);
//! # Ok::<(), gfet_charact::error::CharactError>(())
//! ```
//!
//! `Settings` is the editable form. Before a run it is turned into the immutable
//! [`SweepConfig`](crate::sweep::SweepConfig); the machine never reads `Settings`.

use crate::error::{AppResult, CharactError};
use crate::hardware::simulated::DeviceModel;
use crate::stability::StabilityCriteria;
use crate::sweep::VoltageSweep;
use crate::validation;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Acquisition board description
    pub board: BoardConfig,
    /// Bias sweeps and which measurements to take
    pub sweep: SweepSettings,
    /// DC stability evaluation
    #[serde(default)]
    pub dc: DcSettings,
    /// Noise (PSD) acquisition
    #[serde(default)]
    pub psd: PsdSettings,
    /// Bode (transconductance) test signals
    #[serde(default)]
    pub bode: BodeSettings,
    /// Free-running acquisition
    #[serde(default)]
    pub sampling: SamplingSettings,
    /// Result file
    #[serde(default)]
    pub storage: StorageConfig,
    /// Simulated session parameters
    #[serde(default)]
    pub simulation: SimulationSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// One transistor channel of the board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name used as key in the result file
    pub name: String,
    /// Analog input carrying the DC current
    pub dc_input: String,
    /// Analog input carrying the AC current
    pub ac_input: String,
}

/// Transimpedance gains (V/A).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Gains {
    /// DC path gain
    pub dc: f64,
    /// AC path gain
    pub ac: f64,
    /// Gate current gain, absent on boards without gate sensing
    #[serde(default)]
    pub gate: Option<f64>,
}

/// Analog output lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalogOutputs {
    /// Source line (driven with -Vgs)
    pub vs: String,
    /// Drain line
    pub vds: String,
    /// Gate line used for the Bode test signal
    #[serde(default)]
    pub vg: Option<String>,
}

/// Digital line states for every switch position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchStates {
    /// Lines for DC measurement
    pub dc: Vec<bool>,
    /// Lines for AC measurement
    pub ac: Vec<bool>,
    /// Lines for gate current measurement
    pub gate: Vec<bool>,
}

/// AC/DC/Gate path switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Digital output lines driving the switch
    pub douts: Vec<String>,
    /// Analog input wired to the gate current amplifier
    pub gate_input: String,
    /// Line states per position
    pub states: SwitchStates,
}

/// Acquisition board description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Board name
    pub name: String,
    /// Enabled channels in acquisition order
    pub channels: Vec<ChannelConfig>,
    /// Amplifier gains
    pub gains: Gains,
    /// Analog outputs
    pub outputs: AnalogOutputs,
    /// Optional AC/DC switch
    #[serde(default)]
    pub switch: Option<SwitchConfig>,
}

impl BoardConfig {
    /// Channel names in acquisition order.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    /// Whether the board can measure gate current.
    pub fn supports_gate(&self) -> bool {
        self.gains.gate.is_some() && self.switch.is_some()
    }

    /// Whether the board can drive a Bode test signal.
    pub fn supports_bode(&self) -> bool {
        self.outputs.vg.is_some()
    }
}

/// Bias sweeps and measurement selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Gate-source sweep
    pub vgs: VoltageSweep,
    /// Drain-source sweep
    pub vds: VoltageSweep,
    /// Measure gate leakage after every DC point
    #[serde(default)]
    pub measure_gate: bool,
    /// Measure PSD at the AC points
    #[serde(default)]
    pub measure_psd: bool,
    /// Measure Bode at the AC points
    #[serde(default)]
    pub measure_bode: bool,
    /// Vgs index expression selecting the AC points (default `0:n:4`)
    #[serde(default)]
    pub ac_selection: Option<String>,
}

/// DC stability evaluation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DcSettings {
    /// Slope threshold (A/s)
    #[serde(default = "default_max_slope")]
    pub max_slope: f64,
    /// Channel combination policy
    #[serde(default)]
    pub criteria: StabilityCriteria,
    /// Maximum time per DC point (s)
    #[serde(default = "default_dc_timeout")]
    pub timeout_s: f64,
    /// DC sampling rate (Hz)
    #[serde(default = "default_dc_fs")]
    pub fs: f64,
    /// Samples per stability evaluation
    #[serde(default = "default_dc_n_samps")]
    pub n_samps: usize,
}

impl Default for DcSettings {
    fn default() -> Self {
        Self {
            max_slope: default_max_slope(),
            criteria: StabilityCriteria::default(),
            timeout_s: default_dc_timeout(),
            fs: default_dc_fs(),
            n_samps: default_dc_n_samps(),
        }
    }
}

/// Noise acquisition
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PsdSettings {
    /// Sampling rate (Hz)
    #[serde(default = "default_psd_fs")]
    pub fs: f64,
    /// Segment length exponent, segments are `2^n_fft` samples
    #[serde(default = "default_psd_n_fft")]
    pub n_fft: u32,
    /// Number of segments acquired
    #[serde(default = "default_psd_n_avg")]
    pub n_avg: usize,
}

impl Default for PsdSettings {
    fn default() -> Self {
        Self {
            fs: default_psd_fs(),
            n_fft: default_psd_n_fft(),
            n_avg: default_psd_n_avg(),
        }
    }
}

/// Bode test-signal generation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BodeSettings {
    /// Start frequency (Hz)
    #[serde(default = "default_freq_min")]
    pub freq_min: f64,
    /// Stop frequency (Hz)
    #[serde(default = "default_freq_max")]
    pub freq_max: f64,
    /// Number of log-spaced frequencies before coherent rounding
    #[serde(default = "default_n_freqs")]
    pub n_freqs: usize,
    /// Amplitude of every tone (V)
    #[serde(default = "default_amp")]
    pub amp: f64,
    /// Segments per acquisition
    #[serde(default = "default_bode_n_avg")]
    pub n_avg: usize,
    /// Frequency splitting the parallel and sequential bands (Hz)
    #[serde(default = "default_freq_split")]
    pub freq_split: f64,
    /// Single-channel sampling rate (Hz)
    #[serde(default = "default_fs_high")]
    pub fs_high: f64,
    /// All-channel sampling rate (Hz)
    #[serde(default = "default_fs_low")]
    pub fs_low: f64,
    /// Search random tone phases for a lower crest factor
    #[serde(default)]
    pub phase_optim: bool,
    /// Seed for the phase search
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for BodeSettings {
    fn default() -> Self {
        Self {
            freq_min: default_freq_min(),
            freq_max: default_freq_max(),
            n_freqs: default_n_freqs(),
            amp: default_amp(),
            n_avg: default_bode_n_avg(),
            freq_split: default_freq_split(),
            fs_high: default_fs_high(),
            fs_low: default_fs_low(),
            phase_optim: false,
            seed: None,
        }
    }
}

/// Free-running acquisition
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SamplingSettings {
    /// Sampling rate (Hz)
    #[serde(default = "default_sampling_fs")]
    pub fs: f64,
    /// Samples per delivered block
    #[serde(default = "default_every_samps")]
    pub every_samps: usize,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            fs: default_sampling_fs(),
            every_samps: default_every_samps(),
        }
    }
}

/// Result file settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Result file path; results stay in memory when absent
    #[serde(default)]
    pub output: Option<PathBuf>,
}

/// Simulated session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Wall-clock scale applied to acquisition timing (1.0 = real time)
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
    /// Device model
    #[serde(default)]
    pub device: DeviceModel,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            time_scale: default_time_scale(),
            device: DeviceModel::default(),
        }
    }
}

// Default value functions
fn default_app_name() -> String {
    "gfet_charact".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_max_slope() -> f64 {
    1e-8
}

fn default_dc_timeout() -> f64 {
    25.0
}

fn default_dc_fs() -> f64 {
    1000.0
}

fn default_dc_n_samps() -> usize {
    1000
}

fn default_psd_fs() -> f64 {
    30e3
}

fn default_psd_n_fft() -> u32 {
    17
}

fn default_psd_n_avg() -> usize {
    4
}

fn default_freq_min() -> f64 {
    1.0
}

fn default_freq_max() -> f64 {
    10e3
}

fn default_n_freqs() -> usize {
    50
}

fn default_amp() -> f64 {
    0.002
}

fn default_bode_n_avg() -> usize {
    2
}

fn default_freq_split() -> f64 {
    10.0
}

fn default_fs_high() -> f64 {
    500e3
}

fn default_fs_low() -> f64 {
    30e3
}

fn default_sampling_fs() -> f64 {
    20e3
}

fn default_every_samps() -> usize {
    10_000
}

fn default_time_scale() -> f64 {
    1.0
}

impl Settings {
    /// Load configuration from a TOML file and `GFET_` environment variables
    ///
    /// Example override: `GFET_DC__TIMEOUT_S=5`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GFET_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string (no environment overlay)
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Settings = Figment::from(Toml::string(toml)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check semantic constraints that serde cannot express
    pub fn validate(&self) -> AppResult<()> {
        let err = |field: &str, msg: &str| CharactError::Configuration(format!("{field}: {msg}"));

        if self.board.channels.is_empty() {
            return Err(err("board.channels", "at least one channel is required"));
        }
        validation::is_unique(self.board.channels.iter().map(|c| c.name.as_str()))
            .map_err(|e| err("board.channels", e))?;
        for c in &self.board.channels {
            validation::is_not_empty(&c.name).map_err(|e| err("board.channels.name", e))?;
        }
        validation::is_positive(self.board.gains.dc).map_err(|e| err("board.gains.dc", e))?;
        validation::is_positive(self.board.gains.ac).map_err(|e| err("board.gains.ac", e))?;
        if let Some(g) = self.board.gains.gate {
            validation::is_positive(g).map_err(|e| err("board.gains.gate", e))?;
        }
        if let Some(sw) = &self.board.switch {
            let n = sw.douts.len();
            for (mode, lines) in [
                ("dc", &sw.states.dc),
                ("ac", &sw.states.ac),
                ("gate", &sw.states.gate),
            ] {
                if lines.len() != n {
                    return Err(err(
                        &format!("board.switch.states.{mode}"),
                        "one state per digital line is required",
                    ));
                }
            }
        }

        self.sweep.vgs.validate("sweep.vgs")?;
        self.sweep.vds.validate("sweep.vds")?;
        if self.sweep.measure_gate && !self.board.supports_gate() {
            return Err(err(
                "sweep.measure_gate",
                "board has no gate gain or no AC/DC switch",
            ));
        }
        if self.sweep.measure_bode && !self.board.supports_bode() {
            return Err(err("sweep.measure_bode", "board has no vg output"));
        }

        validation::is_positive(self.dc.max_slope).map_err(|e| err("dc.max_slope", e))?;
        validation::is_positive(self.dc.timeout_s).map_err(|e| err("dc.timeout_s", e))?;
        validation::is_positive(self.dc.fs).map_err(|e| err("dc.fs", e))?;
        validation::is_in_range(self.dc.n_samps, 2..=usize::MAX)
            .map_err(|e| err("dc.n_samps", e))?;

        if self.sweep.measure_psd {
            validation::is_positive(self.psd.fs).map_err(|e| err("psd.fs", e))?;
            validation::is_in_range(self.psd.n_fft, 1..=30).map_err(|e| err("psd.n_fft", e))?;
            validation::is_in_range(self.psd.n_avg, 1..=1000).map_err(|e| err("psd.n_avg", e))?;
        }

        if self.sweep.measure_bode {
            let b = &self.bode;
            validation::is_positive(b.freq_min).map_err(|e| err("bode.freq_min", e))?;
            validation::is_positive(b.freq_max).map_err(|e| err("bode.freq_max", e))?;
            if b.freq_max < b.freq_min {
                return Err(err("bode.freq_max", "must not be below bode.freq_min"));
            }
            validation::is_in_range(b.n_freqs, 1..=1000).map_err(|e| err("bode.n_freqs", e))?;
            validation::is_positive(b.amp).map_err(|e| err("bode.amp", e))?;
            validation::is_in_range(b.n_avg, 1..=100).map_err(|e| err("bode.n_avg", e))?;
            validation::is_positive(b.freq_split).map_err(|e| err("bode.freq_split", e))?;
            validation::is_positive(b.fs_high).map_err(|e| err("bode.fs_high", e))?;
            validation::is_positive(b.fs_low).map_err(|e| err("bode.fs_low", e))?;
            if b.freq_max * 2.0 > b.fs_high.max(b.fs_low) {
                return Err(err("bode.freq_max", "above the Nyquist frequency"));
            }
        }

        validation::is_positive(self.sampling.fs).map_err(|e| err("sampling.fs", e))?;
        validation::is_in_range(self.sampling.every_samps, 2..=usize::MAX)
            .map_err(|e| err("sampling.every_samps", e))?;

        if let Some(p) = &self.storage.output {
            validation::is_valid_path(&p.to_string_lossy())
                .map_err(|e| err("storage.output", e))?;
        }
        validation::is_finite(self.simulation.time_scale)
            .map_err(|e| err("simulation.time_scale", e))?;
        validation::is_in_range(self.simulation.time_scale, 0.0..=f64::MAX)
            .map_err(|e| err("simulation.time_scale", e))?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
[application]
log_level = "debug"

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
"#;

    #[test]
    fn sample_configuration_parses() {
        let s = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(s.board.channel_names(), vec!["Ch01", "Ch02"]);
        assert_eq!(s.dc.criteria, StabilityCriteria::OneChannel);
        assert_eq!(s.dc.n_samps, 1000);
        assert_eq!(s.psd.n_fft, 8);
        assert!(s.board.supports_gate());
        assert_eq!(s.application.log_level, "debug");
    }

    #[test]
    fn bode_without_vg_output_is_rejected() {
        let toml = SAMPLE.replace(", vg = \"ao2\"", "");
        let e = Settings::from_toml_str(&toml).unwrap_err();
        assert!(e.to_string().contains("measure_bode"), "{e}");
    }

    #[test]
    fn gate_without_gain_is_rejected() {
        let toml = SAMPLE.replace(", gate = 1e6", "");
        assert!(Settings::from_toml_str(&toml).is_err());
    }

    #[test]
    fn bad_switch_states_are_rejected() {
        let toml = SAMPLE.replace("gate = [false, true]", "gate = [true]");
        assert!(Settings::from_toml_str(&toml).is_err());
    }

    #[test]
    fn syntax_error_is_a_config_error() {
        let e = Settings::from_toml_str("[board\nname=").unwrap_err();
        assert!(matches!(e, CharactError::Config(_)));
    }
}
