//! Characterization state machine.
//!
//! The machine is a one-step-at-a-time interpreter over the step queue built
//! by [`build_steps`]. It pops a step, dispatches on its kind, starts the
//! hardware work and then only reacts to events: acquisition data, the DC
//! timeout timer and stop requests, all arriving on one unbounded queue
//! consumed by [`CharacterizationMachine::run`]. Completion handlers record
//! into the [`ResultSink`], flush it, notify the [`PlotSink`] and dispatch the
//! next step.
//!
//! # Invariants
//!
//! - Exactly one step is in flight at a time, and at most one acquisition is
//!   outstanding. Events of any other acquisition are dropped.
//! - A DC step completes once: on the first stable verdict, or on timeout with
//!   the last verdict seen.
//! - A stop request is checked before dispatching and in every completion
//!   handler, never preemptively: an outstanding acquisition delivers its
//!   next callback first. The step in flight is then discarded without
//!   recording.
//! - Normal end, stop and handler failure share the same cleanup: stop read,
//!   stop test signal, bias `(0, 0)`, state `Finished`.
//!
//! # Example
//!
//! ```no_run
//! use gfet_charact::config::Settings;
//! use gfet_charact::hardware::SimulatedHardware;
//! use gfet_charact::machine::CharacterizationMachine;
//! use gfet_charact::storage::CharactFile;
//! use gfet_charact::sweep::SweepConfig;
//!
//! # async fn demo() -> gfet_charact::error::AppResult<()> {
//! let settings = Settings::load_from("config/gfet.toml")?;
//! let plan = SweepConfig::from_settings(&settings)?;
//! let hw = SimulatedHardware::new(&settings.board, Default::default(), 1.0);
//! let file = CharactFile::new(&plan, settings.storage.output.clone());
//! let mut machine = CharacterizationMachine::new(&plan, hw, file);
//! let summary = machine.run().await?;
//! println!("{} steps", summary.steps_completed);
//! # Ok(())
//! # }
//! ```

mod bode;
pub mod state;

pub use state::{MachineState, RunEnd};

use crate::data::welch::welch_block;
use crate::data::SampleBlock;
use crate::error::{AppResult, CharactError};
use crate::hardware::{
    AcquisitionId, HardwareEvent, HardwareEvents, HardwareSession, InputGroup, SwitchMode,
};
use crate::plot::{NullPlot, PlotSink};
use crate::report::{Reporter, TracingReporter};
use crate::stability::{self, StabilityVerdict};
use crate::storage::ResultSink;
use crate::sweep::steps::{BodeStep, DcStep, GateStep, PsdStep};
use crate::sweep::{build_steps, Step, StepKind, SweepConfig};
use bode::BodeRun;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Everything the machine reacts to.
#[derive(Debug)]
pub enum MachineEvent {
    /// Acquisition callback payload.
    Hardware(HardwareEvent),
    /// DC timeout timer fired.
    DcTimeout {
        /// Token handed out when the DC step started
        token: u64,
    },
    /// External stop request.
    Stop,
}

/// Requests a non-preemptive stop of a running machine.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<MachineEvent>,
}

impl StopHandle {
    pub(crate) fn new(running: Arc<AtomicBool>, tx: mpsc::UnboundedSender<MachineEvent>) -> Self {
        Self { running, tx }
    }

    /// Clear the running flag and wake the machine.
    ///
    /// The step in flight is abandoned at the next callback of its
    /// acquisition, never in the middle of one.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stop requested");
        }
        // The machine may already be gone.
        let _ = self.tx.send(MachineEvent::Stop);
    }

    /// Whether no stop has been requested.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Outcome of [`CharacterizationMachine::run`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// How the run ended
    pub end: RunEnd,
    /// Steps whose results were recorded
    pub steps_completed: usize,
    /// Steps never dispatched
    pub steps_remaining: usize,
    /// Time since the run started
    pub elapsed: Duration,
}

struct DcRun {
    step: DcStep,
    token: u64,
    timer: JoinHandle<()>,
    last: Option<StabilityVerdict>,
    timed_out: bool,
    evaluations: usize,
}

enum InFlight {
    Dc(DcRun),
    Gate(GateStep),
    Psd(PsdStep),
    Bode { step: BodeStep, run: BodeRun },
}

/// Sequential step interpreter driving one hardware session.
pub struct CharacterizationMachine<H, S> {
    channels: Vec<String>,
    hardware: H,
    store: S,
    reporter: Arc<dyn Reporter>,
    plot: Arc<dyn PlotSink>,
    queue: VecDeque<Step>,
    n_steps: usize,
    tx: mpsc::UnboundedSender<MachineEvent>,
    rx: mpsc::UnboundedReceiver<MachineEvent>,
    running: Arc<AtomicBool>,
    state: watch::Sender<MachineState>,
    current: Option<InFlight>,
    outstanding: Option<(AcquisitionId, InputGroup)>,
    next_token: u64,
    started: Option<Instant>,
    completed: usize,
    end: Option<RunEnd>,
}

impl<H: HardwareSession, S: ResultSink> CharacterizationMachine<H, S> {
    /// Machine for the step catalog of `config`.
    pub fn new(config: &SweepConfig, hardware: H, store: S) -> Self {
        let queue = build_steps(config);
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(MachineState::Idle);
        Self {
            channels: config.channels.clone(),
            hardware,
            store,
            reporter: Arc::new(TracingReporter),
            plot: Arc::new(NullPlot),
            n_steps: queue.len(),
            queue,
            tx,
            rx,
            running: Arc::new(AtomicBool::new(true)),
            state,
            current: None,
            outstanding: None,
            next_token: 0,
            started: None,
            completed: 0,
            end: None,
        }
    }

    /// Replace the progress reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Replace the plot sink.
    pub fn with_plot(mut self, plot: Arc<dyn PlotSink>) -> Self {
        self.plot = plot;
        self
    }

    /// Handle for stopping the run from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.running), self.tx.clone())
    }

    /// Follow state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<MachineState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> MachineState {
        *self.state.borrow()
    }

    /// Steps not dispatched yet.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Result store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Hardware session.
    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    /// Give back the session and the result store.
    pub fn into_parts(self) -> (H, S) {
        (self.hardware, self.store)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: MachineState) {
        self.state.send_replace(state);
    }

    fn elapsed(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |t| t.elapsed())
    }

    fn report(&self, message: &str) {
        self.reporter.report(self.elapsed(), message);
    }

    /// Execute the whole step queue.
    ///
    /// Returns once the queue is empty or a stop request was honoured. A failing
    /// step handler aborts the run: cleanup still runs and the error is returned.
    pub async fn run(&mut self) -> AppResult<RunSummary> {
        if self.state() != MachineState::Idle {
            return Err(CharactError::InvalidState(format!(
                "machine already ran (state {})",
                self.state()
            )));
        }
        let hw_channels = self.hardware.channel_names();
        if hw_channels != self.channels {
            return Err(CharactError::Configuration(format!(
                "hardware channels {hw_channels:?} differ from plan {:?}",
                self.channels
            )));
        }

        self.hardware.connect(HardwareEvents::new(self.tx.clone()));
        self.started = Some(Instant::now());
        self.set_state(MachineState::Running);
        self.report(&format!("Run started, {} steps", self.n_steps));

        let outcome = self.drive().await;
        let cleanup = self.cleanup().await;

        let end = match &outcome {
            Ok(()) => self.end.unwrap_or(RunEnd::Completed),
            Err(e) => {
                error!(error = %e, "Step handler failed, run aborted");
                RunEnd::Aborted
            }
        };
        self.end = Some(end);
        self.set_state(MachineState::Finished);
        self.report(&format!(
            "Run {end}: {} steps completed, {} not run",
            self.completed,
            self.queue.len()
        ));

        outcome?;
        cleanup?;
        Ok(RunSummary {
            end,
            steps_completed: self.completed,
            steps_remaining: self.queue.len(),
            elapsed: self.elapsed(),
        })
    }

    async fn drive(&mut self) -> AppResult<()> {
        self.dispatch().await?;
        while self.current.is_some() {
            let event = self.rx.recv().await.ok_or(CharactError::EventQueueClosed)?;
            self.handle(event).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, event: MachineEvent) -> AppResult<()> {
        match event {
            // An outstanding acquisition finishes its callback cycle first; the
            // next Samples, Done or DcTimeout handler abandons the step.
            MachineEvent::Stop => {
                if self.current.is_some() && self.outstanding.is_none() {
                    self.abandon().await?;
                }
                Ok(())
            }
            MachineEvent::DcTimeout { token } => self.on_dc_timeout(token).await,
            MachineEvent::Hardware(event) => self.on_hardware(event).await,
        }
    }

    async fn dispatch(&mut self) -> AppResult<()> {
        if !self.is_running() {
            self.end = Some(RunEnd::Stopped);
            return Ok(());
        }
        let Some(step) = self.queue.pop_front() else {
            self.end = Some(RunEnd::Completed);
            return Ok(());
        };

        debug!(
            step = %step.label,
            selector = step.selector(),
            remaining = self.queue.len(),
            "Dispatching step"
        );
        self.report(&format!("{} ({} steps left)", step.label, self.queue.len()));

        match step.kind {
            StepKind::Dc(s) => self.start_dc(s).await,
            StepKind::Gate(s) => self.start_gate(s).await,
            StepKind::Psd(s) => self.start_psd(s).await,
            StepKind::Bode(s) => self.start_bode(s).await,
        }
    }

    async fn advance(&mut self) -> AppResult<()> {
        self.completed += 1;
        self.set_state(MachineState::Running);
        self.dispatch().await
    }

    fn record_done(&mut self) -> AppResult<()> {
        self.store.flush()?;
        self.plot.notify_refresh();
        Ok(())
    }

    fn ensure_no_outstanding(&self) -> AppResult<()> {
        match self.outstanding {
            Some(_) => Err(CharactError::AcquisitionBusy),
            None => Ok(()),
        }
    }

    async fn stop_acquisition(&mut self) -> AppResult<()> {
        if self.outstanding.take().is_some() {
            self.hardware.stop_read().await?;
        }
        Ok(())
    }

    // -- DC ---------------------------------------------------------------

    async fn start_dc(&mut self, step: DcStep) -> AppResult<()> {
        self.set_state(MachineState::Dc);
        self.ensure_no_outstanding()?;
        self.hardware.select_switch(SwitchMode::Dc).await?;
        self.hardware.set_bias(step.bias.vgs, step.bias.vds).await?;
        let id = self
            .hardware
            .start_continuous_read(InputGroup::Dc, step.fs, step.n_samps)
            .await?;
        self.outstanding = Some((id, InputGroup::Dc));

        self.next_token += 1;
        let token = self.next_token;
        let tx = self.tx.clone();
        let timeout = step.timeout;
        let timer = tokio::spawn(async move {
            sleep(timeout).await;
            let _ = tx.send(MachineEvent::DcTimeout { token });
        });

        self.current = Some(InFlight::Dc(DcRun {
            step,
            token,
            timer,
            last: None,
            timed_out: false,
            evaluations: 0,
        }));
        Ok(())
    }

    async fn on_dc_samples(&mut self, block: SampleBlock) -> AppResult<()> {
        if !self.is_running() {
            return self.abandon().await;
        }
        let Some(InFlight::Dc(dc)) = self.current.as_mut() else {
            return Ok(());
        };
        let verdict = stability::detect(&block, dc.step.fs, dc.step.max_slope, dc.step.criteria)?;
        dc.evaluations += 1;
        debug!(
            stable = verdict.stable,
            slopes = ?verdict.slopes,
            evaluation = dc.evaluations,
            "DC stability evaluated"
        );
        let stable = verdict.stable;
        dc.last = Some(verdict);
        if stable || dc.timed_out {
            self.complete_dc(stable).await
        } else {
            Ok(())
        }
    }

    async fn on_dc_timeout(&mut self, token: u64) -> AppResult<()> {
        let live = matches!(&self.current, Some(InFlight::Dc(dc)) if dc.token == token);
        if !live {
            debug!(token, "Stale DC timeout ignored");
            return Ok(());
        }
        if !self.is_running() {
            return self.abandon().await;
        }
        let Some(InFlight::Dc(dc)) = self.current.as_mut() else {
            return Ok(());
        };
        if dc.last.is_some() {
            self.complete_dc(false).await
        } else {
            // Complete on the first block.
            dc.timed_out = true;
            Ok(())
        }
    }

    async fn complete_dc(&mut self, stable: bool) -> AppResult<()> {
        let Some(InFlight::Dc(dc)) = self.current.take() else {
            return Err(CharactError::InvalidState("no DC step in flight".into()));
        };
        dc.timer.abort();
        self.stop_acquisition().await?;
        let verdict = dc
            .last
            .ok_or_else(|| CharactError::InvalidState("DC step completed without data".into()))?;

        let idx = dc.step.index;
        self.store
            .record_dc(idx.i_vg, idx.i_vd, &verdict.levels, &verdict.slopes)?;
        self.record_done()?;

        if !stable {
            warn!(
                i_vg = idx.i_vg,
                i_vd = idx.i_vd,
                slopes = ?verdict.slopes,
                "DC point not stable before timeout, recording last fit"
            );
        }
        self.report(&format!(
            "DC Vgs={:.3} Vds={:.3} {} after {} evaluations",
            dc.step.bias.vgs,
            dc.step.bias.vds,
            if stable { "stable" } else { "timeout" },
            dc.evaluations
        ));
        self.advance().await
    }

    // -- Gate -------------------------------------------------------------

    async fn start_gate(&mut self, step: GateStep) -> AppResult<()> {
        self.set_state(MachineState::Gate);
        self.ensure_no_outstanding()?;
        self.hardware.select_switch(SwitchMode::Gate).await?;
        let id = self
            .hardware
            .start_single_read(InputGroup::Gate, step.fs, step.n_samps, step.n_samps)
            .await?;
        self.outstanding = Some((id, InputGroup::Gate));
        self.current = Some(InFlight::Gate(step));
        Ok(())
    }

    async fn complete_gate(&mut self, step: GateStep, block: SampleBlock) -> AppResult<()> {
        let ig = block
            .channel_means()
            .first()
            .copied()
            .ok_or_else(|| CharactError::Processing("empty gate current block".into()))?;
        self.store.record_gate(step.index.i_vg, step.index.i_vd, ig)?;
        self.record_done()?;
        self.report(&format!("Gate current {ig:.3e} A"));
        self.advance().await
    }

    // -- PSD --------------------------------------------------------------

    async fn start_psd(&mut self, step: PsdStep) -> AppResult<()> {
        self.set_state(MachineState::Psd);
        self.ensure_no_outstanding()?;
        self.hardware.select_switch(SwitchMode::Ac).await?;
        let id = self
            .hardware
            .start_single_read(
                InputGroup::Ac,
                step.plan.fs,
                step.plan.n_samples(),
                step.plan.nperseg(),
            )
            .await?;
        self.outstanding = Some((id, InputGroup::Ac));
        self.current = Some(InFlight::Psd(step));
        Ok(())
    }

    async fn complete_psd(&mut self, step: PsdStep, block: SampleBlock) -> AppResult<()> {
        if block.n_channels() != self.channels.len() {
            return Err(CharactError::ShapeMismatch {
                what: "PSD block channels".into(),
                expected: self.channels.len(),
                actual: block.n_channels(),
            });
        }
        let estimate = welch_block(&block, step.plan.fs, step.plan.nperseg())?;
        let idx = step.index;
        for (ch, psd) in estimate.psd.iter().enumerate() {
            self.store
                .record_psd(ch, idx.i_vd, idx.i_vg_ac, &estimate.freqs, psd)?;
        }
        self.record_done()?;
        self.report(&format!(
            "PSD recorded, {} bins x {} channels",
            estimate.freqs.len(),
            estimate.psd.len()
        ));
        self.advance().await
    }

    // -- Bode -------------------------------------------------------------

    async fn start_bode(&mut self, step: BodeStep) -> AppResult<()> {
        self.set_state(MachineState::Bode);
        let run = BodeRun::new(Arc::clone(&step.plan), self.channels.len());
        self.launch_bode(step, run).await
    }

    /// Start the next acquisition of `run`; it must not be complete.
    async fn launch_bode(&mut self, step: BodeStep, mut run: BodeRun) -> AppResult<()> {
        self.ensure_no_outstanding()?;
        let group = run
            .next_acquisition()
            .ok_or_else(|| CharactError::InvalidState("Bode step has nothing to acquire".into()))?;
        let signal = run
            .signal()
            .ok_or_else(|| CharactError::InvalidState("Bode pass without test signal".into()))?;
        let (fs, len, n_fft) = (signal.fs, signal.len(), signal.n_fft);

        self.hardware.select_switch(SwitchMode::Ac).await?;
        self.hardware.start_test_signal(&signal.samples, fs).await?;
        let id = self
            .hardware
            .start_single_read(group, fs, len, n_fft)
            .await?;
        self.outstanding = Some((id, group));
        debug!(pass = run.pass(), %group, fs, samples = len, "Bode acquisition started");
        self.current = Some(InFlight::Bode { step, run });
        Ok(())
    }

    async fn on_bode_block(
        &mut self,
        step: BodeStep,
        mut run: BodeRun,
        block: SampleBlock,
    ) -> AppResult<()> {
        self.hardware.stop_test_signal().await?;
        run.accept(&block)?;
        if run.is_complete() {
            self.complete_bode(step, run).await
        } else {
            self.launch_bode(step, run).await
        }
    }

    async fn complete_bode(&mut self, step: BodeStep, run: BodeRun) -> AppResult<()> {
        let idx = step.index;
        let gains = run.into_gains();
        for (ch, gain) in gains.iter().enumerate() {
            self.store.record_bode(ch, idx.i_vd, idx.i_vg_ac, gain)?;
        }
        self.record_done()?;
        self.report(&format!(
            "Bode recorded, {} frequencies x {} channels",
            step.plan.n_freqs(),
            gains.len()
        ));
        self.advance().await
    }

    // -- Events -----------------------------------------------------------

    async fn on_hardware(&mut self, event: HardwareEvent) -> AppResult<()> {
        let id = event.acquisition();
        let source = match self.outstanding {
            Some((current, group)) if current == id => group,
            _ => {
                debug!(%id, "Stale hardware event dropped");
                return Ok(());
            }
        };

        match event {
            HardwareEvent::Samples { block, .. } => {
                self.plot.live_data(source, &block);
                if matches!(self.current, Some(InFlight::Dc(_))) {
                    self.on_dc_samples(block).await
                } else {
                    Ok(())
                }
            }
            HardwareEvent::Done { block, .. } => {
                self.outstanding = None;
                if !self.is_running() {
                    return self.abandon().await;
                }
                match self.current.take() {
                    Some(InFlight::Gate(step)) => self.complete_gate(step, block).await,
                    Some(InFlight::Psd(step)) => self.complete_psd(step, block).await,
                    Some(InFlight::Bode { step, run }) => {
                        self.on_bode_block(step, run, block).await
                    }
                    Some(other) => {
                        self.current = Some(other);
                        Err(CharactError::InvalidState(format!(
                            "{id} ended while a continuous read was expected"
                        )))
                    }
                    None => Err(CharactError::InvalidState(format!(
                        "{id} ended with no step in flight"
                    ))),
                }
            }
            HardwareEvent::Fault { message, .. } => {
                self.outstanding = None;
                Err(CharactError::Hardware(format!("{id} on {source}: {message}")))
            }
        }
    }

    /// Drop the step in flight after a stop request; nothing is recorded.
    async fn abandon(&mut self) -> AppResult<()> {
        let step = self.current.take();
        if let Some(InFlight::Dc(dc)) = &step {
            dc.timer.abort();
        }
        self.stop_acquisition().await?;
        if matches!(step, Some(InFlight::Bode { .. })) {
            self.hardware.stop_test_signal().await?;
        }
        self.end = Some(RunEnd::Stopped);
        self.report("Stopped, step in flight discarded");
        Ok(())
    }

    async fn cleanup(&mut self) -> AppResult<()> {
        if let Some(InFlight::Dc(dc)) = self.current.take() {
            dc.timer.abort();
        }
        self.outstanding = None;

        let results = [
            ("stop read", self.hardware.stop_read().await),
            ("stop test signal", self.hardware.stop_test_signal().await),
            ("reset bias", self.hardware.set_bias(0.0, 0.0).await),
        ];
        let mut first = None;
        for (what, result) in results {
            if let Err(e) = result {
                warn!(error = %e, "Cleanup: {what} failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
