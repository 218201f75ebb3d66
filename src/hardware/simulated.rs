//! Simulated GFET array session.
//!
//! Provides a complete in-process [`HardwareSession`] for tests and for running
//! the application without a DAQ board. Acquisitions are tokio tasks that sleep
//! for the duration of each block (scaled by `time_scale`), synthesize the
//! amplifier output voltages of the modelled devices, condition them into
//! currents and push them into the event queue.
//!
//! # Device model
//!
//! - DC transfer: Dirac cone, `Ids = (g_min + g_slope * |Vgs - V_dirac|) * Vds`
//! - Settling: `Ids * (1 + settle_fraction * exp(-t / settle_tau_s))` after each bias change
//! - Drift: `drift_per_s * t` added on top
//! - AC: `gm * Vg(t)` where `Vg` is the test signal and `gm = dIds/dVgs`
//! - Gate: `Ig = gate_leak * Vgs`
//!
//! Each channel scales the conductance by `1 + channel_spread * index`.

use crate::config::BoardConfig;
use crate::data::SampleBlock;
use crate::error::{AppResult, CharactError};
use crate::hardware::{
    AcquisitionId, Conditioning, HardwareEvent, HardwareEvents, HardwareSession, InputGroup,
    SwitchMode,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Parameters of the simulated devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceModel {
    /// Charge neutrality point (V)
    pub dirac_v: f64,
    /// Conductance at the Dirac point (S)
    pub g_min: f64,
    /// Conductance increase per volt away from the Dirac point (S/V)
    pub g_slope: f64,
    /// Relative conductance step between consecutive channels
    pub channel_spread: f64,
    /// Settling time constant after a bias change (s)
    pub settle_tau_s: f64,
    /// Initial relative overshoot after a bias change
    pub settle_fraction: f64,
    /// Constant current drift (A/s)
    pub drift_per_s: f64,
    /// DC and gate current noise (A rms)
    pub noise_rms: f64,
    /// AC current noise (A rms)
    pub ac_noise_rms: f64,
    /// Gate leakage conductance (S)
    pub gate_leak: f64,
    /// Noise generator seed
    pub seed: Option<u64>,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self {
            dirac_v: 0.2,
            g_min: 1e-4,
            g_slope: 5e-4,
            channel_spread: 0.05,
            settle_tau_s: 0.2,
            settle_fraction: 0.05,
            drift_per_s: 0.0,
            noise_rms: 1e-10,
            ac_noise_rms: 1e-11,
            gate_leak: 1e-9,
            seed: None,
        }
    }
}

impl DeviceModel {
    fn channel_factor(&self, channel: usize) -> f64 {
        1.0 + self.channel_spread * channel as f64
    }

    /// Settled drain current of `channel` (A).
    pub fn ids(&self, channel: usize, vgs: f64, vds: f64) -> f64 {
        (self.g_min + self.g_slope * (vgs - self.dirac_v).abs()) * vds * self.channel_factor(channel)
    }

    /// Small-signal transconductance `dIds/dVgs` of `channel` (S).
    pub fn transconductance(&self, channel: usize, vgs: f64, vds: f64) -> f64 {
        let sign = if vgs > self.dirac_v {
            1.0
        } else if vgs < self.dirac_v {
            -1.0
        } else {
            0.0
        };
        sign * self.g_slope * vds * self.channel_factor(channel)
    }

    /// Drain current `t` seconds after the last bias change (A), without noise.
    pub fn ids_at(&self, channel: usize, vgs: f64, vds: f64, t: f64) -> f64 {
        let settle = if self.settle_tau_s > 0.0 {
            self.settle_fraction * (-t / self.settle_tau_s).exp()
        } else {
            0.0
        };
        self.ids(channel, vgs, vds) * (1.0 + settle) + self.drift_per_s * t
    }
}

/// One call received by the simulated session.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareCall {
    /// [`HardwareSession::set_bias`]
    SetBias {
        /// Gate-source voltage (V)
        vgs: f64,
        /// Drain-source voltage (V)
        vds: f64,
    },
    /// [`HardwareSession::select_switch`]
    SelectSwitch(SwitchMode),
    /// [`HardwareSession::start_continuous_read`]
    StartContinuous {
        /// Inputs read
        group: InputGroup,
        /// Sampling rate (Hz)
        fs: f64,
        /// Scans per delivery
        every_n: usize,
    },
    /// [`HardwareSession::start_single_read`]
    StartSingle {
        /// Inputs read
        group: InputGroup,
        /// Sampling rate (Hz)
        fs: f64,
        /// Total scans
        n_samples: usize,
    },
    /// [`HardwareSession::start_test_signal`]
    StartTestSignal {
        /// Waveform length (samples)
        len: usize,
        /// Output rate (Hz)
        fs: f64,
    },
    /// [`HardwareSession::stop_test_signal`]
    StopTestSignal,
    /// [`HardwareSession::stop_read`]
    StopRead,
}

impl HardwareCall {
    /// Whether the call started an acquisition.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            HardwareCall::StartContinuous { .. } | HardwareCall::StartSingle { .. }
        )
    }
}

/// Shared log of every call made on a [`SimulatedHardware`].
#[derive(Debug, Clone, Default)]
pub struct Journal {
    calls: Arc<Mutex<Vec<HardwareCall>>>,
}

impl Journal {
    fn push(&self, call: HardwareCall) {
        self.calls.lock().push(call);
    }

    /// Snapshot of all calls so far.
    pub fn calls(&self) -> Vec<HardwareCall> {
        self.calls.lock().clone()
    }

    /// Number of calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&HardwareCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Last bias written, if any.
    pub fn last_bias(&self) -> Option<(f64, f64)> {
        self.calls.lock().iter().rev().find_map(|c| match c {
            HardwareCall::SetBias { vgs, vds } => Some((*vgs, *vds)),
            _ => None,
        })
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    fail_start_after: Option<usize>,
    fault_event_on: Option<usize>,
}

struct SimState {
    n_channels: usize,
    has_switch: bool,
    model: DeviceModel,
    conditioning: Conditioning,
    vgs: f64,
    vds: f64,
    since_bias: f64,
    switch: SwitchMode,
    drive: Option<Vec<f64>>,
    rng: StdRng,
}

impl SimState {
    fn check_group(&self, group: InputGroup) -> AppResult<usize> {
        let (needed, width) = match group {
            InputGroup::Dc => (SwitchMode::Dc, self.n_channels),
            InputGroup::Ac => (SwitchMode::Ac, self.n_channels),
            InputGroup::AcChannel(ch) if ch < self.n_channels => (SwitchMode::Ac, 1),
            InputGroup::AcChannel(ch) => {
                return Err(CharactError::Hardware(format!(
                    "AC input {ch} does not exist ({} channels)",
                    self.n_channels
                )))
            }
            InputGroup::Gate if self.has_switch => (SwitchMode::Gate, 1),
            InputGroup::Gate => {
                return Err(CharactError::Hardware("board has no gate input".into()))
            }
        };
        if self.has_switch && self.switch != needed {
            return Err(CharactError::Hardware(format!(
                "switch is in {:?} position, cannot read {group}",
                self.switch
            )));
        }
        Ok(width)
    }

    fn noise(&mut self, rms: f64) -> f64 {
        if rms > 0.0 {
            let a = rms * 3f64.sqrt();
            self.rng.gen_range(-a..a)
        } else {
            0.0
        }
    }

    fn current(&mut self, group: InputGroup, column: usize, t: f64, k: usize) -> f64 {
        let model = &self.model;
        match group {
            InputGroup::Dc => {
                let i = model.ids_at(column, self.vgs, self.vds, t);
                i + self.noise(self.model.noise_rms)
            }
            InputGroup::Ac | InputGroup::AcChannel(_) => {
                let channel = match group {
                    InputGroup::AcChannel(ch) => ch,
                    _ => column,
                };
                let gm = model.transconductance(channel, self.vgs, self.vds);
                let vg = self
                    .drive
                    .as_ref()
                    .filter(|d| !d.is_empty())
                    .map_or(0.0, |d| d[k % d.len()]);
                gm * vg + self.noise(self.model.ac_noise_rms)
            }
            InputGroup::Gate => {
                let i = model.gate_leak * self.vgs;
                i + self.noise(self.model.noise_rms)
            }
        }
    }

    /// Conditioned block of `n` scans starting at scan `offset` of the acquisition.
    fn block(&mut self, group: InputGroup, fs: f64, offset: usize, n: usize) -> AppResult<SampleBlock> {
        let width = self.check_group(group)?;
        let mut data = Vec::with_capacity(n * width);
        for s in 0..n {
            let t = self.since_bias + s as f64 / fs;
            for column in 0..width {
                let amps = self.current(group, column, t, offset + s);
                data.push(self.conditioning.to_volts(group, amps)?);
            }
        }
        self.since_bias += n as f64 / fs;

        let mut block = SampleBlock::new(data, width)?;
        let conditioning = self.conditioning;
        let mut failed = None;
        block.map_in_place(|_, v| match conditioning.to_current(group, v) {
            Ok(i) => i,
            Err(e) => {
                failed = Some(e);
                f64::NAN
            }
        });
        match failed {
            Some(e) => Err(e),
            None => Ok(block),
        }
    }
}

/// In-process simulation of a GFET array on a DAQ board.
pub struct SimulatedHardware {
    channel_names: Vec<String>,
    time_scale: f64,
    state: Arc<Mutex<SimState>>,
    events: Option<HardwareEvents>,
    reader: Option<JoinHandle<()>>,
    // Cleared by the reader before its last event.
    active: Arc<AtomicBool>,
    next_id: u64,
    reads_started: usize,
    faults: FaultPlan,
    journal: Journal,
}

impl SimulatedHardware {
    /// Simulate `board` populated with devices following `model`.
    ///
    /// `time_scale` multiplies every acquisition's wall-clock duration; 0 delivers
    /// data as fast as the runtime allows.
    pub fn new(board: &BoardConfig, model: DeviceModel, time_scale: f64) -> Self {
        let rng = match model.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = SimState {
            n_channels: board.channels.len(),
            has_switch: board.switch.is_some(),
            model,
            conditioning: Conditioning::new(&board.gains),
            vgs: 0.0,
            vds: 0.0,
            since_bias: 0.0,
            switch: SwitchMode::Dc,
            drive: None,
            rng,
        };
        info!(
            board = %board.name,
            channels = board.channels.len(),
            time_scale,
            "Simulated hardware ready"
        );
        Self {
            channel_names: board.channel_names(),
            time_scale: time_scale.max(0.0),
            state: Arc::new(Mutex::new(state)),
            events: None,
            reader: None,
            active: Arc::new(AtomicBool::new(false)),
            next_id: 0,
            reads_started: 0,
            faults: FaultPlan::default(),
            journal: Journal::default(),
        }
    }

    /// Handle on the call journal, valid after the session is moved.
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Make every `start_*_read` after the first `n` return an error.
    pub fn fail_after_reads(mut self, n: usize) -> Self {
        self.faults.fail_start_after = Some(n);
        self
    }

    /// Make the read with zero-based number `n` deliver a fault event instead of data.
    pub fn fault_on_read(mut self, n: usize) -> Self {
        self.faults.fault_event_on = Some(n);
        self
    }

    fn begin_read(&mut self) -> AppResult<(AcquisitionId, HardwareEvents, bool)> {
        if self.active.load(Ordering::SeqCst) {
            return Err(CharactError::AcquisitionBusy);
        }
        let events = self
            .events
            .clone()
            .ok_or_else(|| CharactError::Hardware("session not connected".into()))?;
        if self
            .faults
            .fail_start_after
            .is_some_and(|n| self.reads_started >= n)
        {
            return Err(CharactError::Hardware(format!(
                "injected fault on read {}",
                self.reads_started
            )));
        }
        let fault = self.faults.fault_event_on == Some(self.reads_started);
        self.active.store(true, Ordering::SeqCst);
        self.reads_started += 1;
        self.next_id += 1;
        Ok((AcquisitionId(self.next_id), events, fault))
    }

    fn spawn_reader(
        &mut self,
        group: InputGroup,
        fs: f64,
        total: Option<usize>,
        every_n: usize,
    ) -> AppResult<AcquisitionId> {
        if !(fs.is_finite() && fs > 0.0) || every_n == 0 || total == Some(0) {
            return Err(CharactError::Hardware(format!(
                "invalid read timing: fs={fs} every_n={every_n} total={total:?}"
            )));
        }
        self.state.lock().check_group(group)?;
        let (id, events, fault) = self.begin_read()?;

        let state = Arc::clone(&self.state);
        let active = Arc::clone(&self.active);
        let time_scale = self.time_scale;
        let handle = tokio::spawn(async move {
            let mut produced = 0usize;
            let mut full: Option<SampleBlock> = None;
            loop {
                let n = total.map_or(every_n, |t| every_n.min(t - produced));
                sleep(Duration::from_secs_f64(n as f64 / fs * time_scale)).await;

                if fault {
                    active.store(false, Ordering::SeqCst);
                    events.send(HardwareEvent::Fault {
                        acquisition: id,
                        message: "simulated acquisition fault".into(),
                    });
                    return;
                }
                let block = state.lock().block(group, fs, produced, n);
                let block = match block {
                    Ok(b) => b,
                    Err(e) => {
                        active.store(false, Ordering::SeqCst);
                        events.send(HardwareEvent::Fault {
                            acquisition: id,
                            message: e.to_string(),
                        });
                        return;
                    }
                };
                produced += n;

                if let Some(t) = total {
                    let merged = match full.as_mut() {
                        Some(f) => f.extend(&block),
                        None => {
                            full = Some(block.clone());
                            Ok(())
                        }
                    };
                    if let Err(e) = merged {
                        active.store(false, Ordering::SeqCst);
                        events.send(HardwareEvent::Fault {
                            acquisition: id,
                            message: e.to_string(),
                        });
                        return;
                    }
                    if !events.send(HardwareEvent::Samples {
                        acquisition: id,
                        block,
                    }) {
                        return;
                    }
                    if produced >= t {
                        active.store(false, Ordering::SeqCst);
                        if let Some(block) = full.take() {
                            events.send(HardwareEvent::Done {
                                acquisition: id,
                                block,
                            });
                        }
                        return;
                    }
                } else if !events.send(HardwareEvent::Samples {
                    acquisition: id,
                    block,
                }) {
                    return;
                }
            }
        });
        self.reader = Some(handle);
        debug!(%id, %group, fs, ?total, every_n, "Simulated read started");
        Ok(id)
    }
}

#[async_trait]
impl HardwareSession for SimulatedHardware {
    fn connect(&mut self, events: HardwareEvents) {
        self.events = Some(events);
    }

    fn channel_names(&self) -> Vec<String> {
        self.channel_names.clone()
    }

    async fn set_bias(&mut self, vgs: f64, vds: f64) -> AppResult<()> {
        self.journal.push(HardwareCall::SetBias { vgs, vds });
        let mut st = self.state.lock();
        st.vgs = vgs;
        st.vds = vds;
        st.since_bias = 0.0;
        st.conditioning.set_bias(vgs, vds);
        debug!(vs = -vgs, vds, "Bias outputs written");
        Ok(())
    }

    async fn select_switch(&mut self, mode: SwitchMode) -> AppResult<()> {
        self.journal.push(HardwareCall::SelectSwitch(mode));
        self.state.lock().switch = mode;
        Ok(())
    }

    async fn start_continuous_read(
        &mut self,
        group: InputGroup,
        fs: f64,
        every_n: usize,
    ) -> AppResult<AcquisitionId> {
        self.journal.push(HardwareCall::StartContinuous { group, fs, every_n });
        self.spawn_reader(group, fs, None, every_n)
    }

    async fn start_single_read(
        &mut self,
        group: InputGroup,
        fs: f64,
        n_samples: usize,
        every_n: usize,
    ) -> AppResult<AcquisitionId> {
        self.journal.push(HardwareCall::StartSingle {
            group,
            fs,
            n_samples,
        });
        self.spawn_reader(group, fs, Some(n_samples), every_n.min(n_samples).max(1))
    }

    async fn start_test_signal(&mut self, samples: &[f64], fs: f64) -> AppResult<()> {
        self.journal.push(HardwareCall::StartTestSignal {
            len: samples.len(),
            fs,
        });
        if samples.is_empty() {
            warn!("Empty test signal ignored");
            return Ok(());
        }
        self.state.lock().drive = Some(samples.to_vec());
        Ok(())
    }

    async fn stop_test_signal(&mut self) -> AppResult<()> {
        self.journal.push(HardwareCall::StopTestSignal);
        self.state.lock().drive = None;
        Ok(())
    }

    async fn stop_read(&mut self) -> AppResult<()> {
        self.journal.push(HardwareCall::StopRead);
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::Settings;
    use crate::machine::MachineEvent;
    use tokio::sync::mpsc;

    fn session(model: DeviceModel) -> (SimulatedHardware, mpsc::UnboundedReceiver<MachineEvent>) {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let mut hw = SimulatedHardware::new(&settings.board, model, 1.0);
        let (tx, rx) = mpsc::unbounded_channel();
        hw.connect(HardwareEvents::new(tx));
        (hw, rx)
    }

    fn quiet() -> DeviceModel {
        DeviceModel {
            noise_rms: 0.0,
            ac_noise_rms: 0.0,
            seed: Some(0),
            ..DeviceModel::default()
        }
    }

    #[test]
    fn dirac_cone_is_symmetric() {
        let m = DeviceModel::default();
        let left = m.ids(0, m.dirac_v - 0.1, 0.05);
        let right = m.ids(0, m.dirac_v + 0.1, 0.05);
        assert!((left - right).abs() < 1e-18);
        assert!(m.ids(0, m.dirac_v, 0.05) < left);
        assert!(m.transconductance(1, 0.4, 0.05) > m.transconductance(0, 0.4, 0.05));
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_read_delivers_conditioned_currents() {
        let (mut hw, mut rx) = session(DeviceModel {
            settle_fraction: 0.0,
            ..quiet()
        });
        hw.set_bias(0.4, 0.05).await.unwrap();
        let id = hw.start_continuous_read(InputGroup::Dc, 1000.0, 100).await.unwrap();

        let Some(MachineEvent::Hardware(HardwareEvent::Samples { acquisition, block })) =
            rx.recv().await
        else {
            panic!("expected samples");
        };
        assert_eq!(acquisition, id);
        assert_eq!(block.n_channels(), 2);
        assert_eq!(block.n_scans(), 100);
        let expected = quiet().ids(1, 0.4, 0.05);
        assert!((block.channel_means()[1] - expected).abs() < 1e-12);
        hw.stop_read().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn single_read_ends_with_full_trace() {
        let (mut hw, mut rx) = session(quiet());
        hw.select_switch(SwitchMode::Gate).await.unwrap();
        hw.set_bias(0.3, 0.05).await.unwrap();
        hw.start_single_read(InputGroup::Gate, 1000.0, 250, 100).await.unwrap();

        let mut partial = 0;
        loop {
            match rx.recv().await {
                Some(MachineEvent::Hardware(HardwareEvent::Samples { block, .. })) => {
                    partial += block.n_scans()
                }
                Some(MachineEvent::Hardware(HardwareEvent::Done { block, .. })) => {
                    assert_eq!(block.n_scans(), 250);
                    assert!((block.channel_means()[0] - 0.3e-9).abs() < 1e-15);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(partial, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn second_read_while_busy_is_rejected() {
        let (mut hw, _rx) = session(quiet());
        hw.start_continuous_read(InputGroup::Dc, 1000.0, 100).await.unwrap();
        let err = hw
            .start_continuous_read(InputGroup::Dc, 1000.0, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, CharactError::AcquisitionBusy));
    }

    #[tokio::test(start_paused = true)]
    async fn reading_through_the_wrong_switch_position_fails() {
        let (mut hw, _rx) = session(quiet());
        let err = hw
            .start_single_read(InputGroup::Ac, 1000.0, 100, 100)
            .await
            .unwrap_err();
        assert!(err.is_hardware());
    }

    #[tokio::test(start_paused = true)]
    async fn injected_start_failure() {
        let (hw, _rx) = session(quiet());
        let mut hw = hw.fail_after_reads(0);
        assert!(hw
            .start_continuous_read(InputGroup::Dc, 1000.0, 100)
            .await
            .is_err());
        assert_eq!(hw.journal().count(HardwareCall::is_read), 1);
    }
}
