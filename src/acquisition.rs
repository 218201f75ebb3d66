//! Free-running DC acquisition.
//!
//! Holds one bias point and streams conditioned drain currents to a
//! [`PlotSink`] until stopped or until an optional duration elapses. Shares the
//! event queue shape of the characterization machine, so the same
//! [`StopHandle`] stops it.

use crate::config::SamplingSettings;
use crate::error::{AppResult, CharactError};
use crate::hardware::{HardwareEvent, HardwareEvents, HardwareSession, InputGroup, SwitchMode};
use crate::machine::{MachineEvent, StopHandle};
use crate::plot::{NullPlot, PlotSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Bias point and timing of a free-running acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveSettings {
    /// Gate-source voltage (V)
    pub vgs: f64,
    /// Drain-source voltage (V)
    pub vds: f64,
    /// Sampling rate (Hz)
    pub fs: f64,
    /// Scans per delivered block
    pub every_n: usize,
    /// Stop automatically after this long.
    pub duration: Option<Duration>,
}

impl LiveSettings {
    /// Bias point with the rate and block size of `[sampling]`.
    pub fn new(vgs: f64, vds: f64, sampling: &SamplingSettings) -> Self {
        Self {
            vgs,
            vds,
            fs: sampling.fs,
            every_n: sampling.every_samps,
            duration: None,
        }
    }

    /// Stop after `duration` instead of waiting for a stop request.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// What a free-running acquisition delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSummary {
    /// Blocks received
    pub blocks: usize,
    /// Scans received over all blocks
    pub scans: usize,
    /// Per-channel mean current of the last block (A).
    pub last_means: Vec<f64>,
    /// Time from start to the end of the read
    pub elapsed: Duration,
}

/// Continuous DC read at a fixed bias.
pub struct LiveAcquisition<H> {
    hardware: H,
    plot: Arc<dyn PlotSink>,
    tx: mpsc::UnboundedSender<MachineEvent>,
    rx: mpsc::UnboundedReceiver<MachineEvent>,
    running: Arc<AtomicBool>,
}

impl<H: HardwareSession> LiveAcquisition<H> {
    /// Acquisition on `hardware`, streaming to no plot.
    pub fn new(hardware: H) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            hardware,
            plot: Arc::new(NullPlot),
            tx,
            rx,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Stream every block to `plot`.
    pub fn with_plot(mut self, plot: Arc<dyn PlotSink>) -> Self {
        self.plot = plot;
        self
    }

    /// Handle ending the read from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.running), self.tx.clone())
    }

    /// Give back the session.
    pub fn into_hardware(self) -> H {
        self.hardware
    }

    /// Stream until stopped; the bias is reset to `(0, 0)` afterwards.
    pub async fn run(&mut self, settings: &LiveSettings) -> AppResult<LiveSummary> {
        self.hardware.connect(HardwareEvents::new(self.tx.clone()));
        let started = Instant::now();
        let outcome = self.stream(settings, started).await;

        let stop = self.hardware.stop_read().await;
        let reset = self.hardware.set_bias(0.0, 0.0).await;
        if let Err(e) = &outcome {
            warn!(error = %e, "Free-running acquisition failed");
        }
        let summary = outcome?;
        stop?;
        reset?;
        info!(
            blocks = summary.blocks,
            scans = summary.scans,
            elapsed_s = summary.elapsed.as_secs_f64(),
            "Free-running acquisition finished"
        );
        Ok(summary)
    }

    async fn stream(&mut self, settings: &LiveSettings, started: Instant) -> AppResult<LiveSummary> {
        let mut summary = LiveSummary {
            blocks: 0,
            scans: 0,
            last_means: Vec::new(),
            elapsed: Duration::ZERO,
        };
        if !self.running.load(Ordering::SeqCst) {
            return Ok(summary);
        }

        self.hardware.select_switch(SwitchMode::Dc).await?;
        self.hardware.set_bias(settings.vgs, settings.vds).await?;
        let id = self
            .hardware
            .start_continuous_read(InputGroup::Dc, settings.fs, settings.every_n)
            .await?;
        info!(%id, vgs = settings.vgs, vds = settings.vds, fs = settings.fs, "Free-running acquisition started");

        let timer = settings.duration.map(|d| {
            let stop = self.stop_handle();
            tokio::spawn(async move {
                sleep(d).await;
                stop.stop();
            })
        });

        let result = loop {
            let Some(event) = self.rx.recv().await else {
                break Err(CharactError::EventQueueClosed);
            };
            let event = match event {
                MachineEvent::Stop => break Ok(()),
                MachineEvent::DcTimeout { .. } => continue,
                MachineEvent::Hardware(event) if event.acquisition() == id => event,
                MachineEvent::Hardware(event) => {
                    debug!(id = %event.acquisition(), "Stale hardware event dropped");
                    continue;
                }
            };
            match event {
                HardwareEvent::Samples { block, .. } => {
                    if !self.running.load(Ordering::SeqCst) {
                        break Ok(());
                    }
                    self.plot.live_data(InputGroup::Dc, &block);
                    summary.blocks += 1;
                    summary.scans += block.n_scans();
                    summary.last_means = block.channel_means();
                }
                HardwareEvent::Done { .. } => break Ok(()),
                HardwareEvent::Fault { message, .. } => {
                    break Err(CharactError::Hardware(format!("{id}: {message}")))
                }
            }
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        summary.elapsed = started.elapsed();
        result.map(|()| summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::Settings;
    use crate::hardware::{DeviceModel, HardwareCall, SimulatedHardware};
    use crate::plot::{BroadcastPlot, PlotEvent};

    fn hardware() -> SimulatedHardware {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let model = DeviceModel {
            noise_rms: 0.0,
            settle_fraction: 0.0,
            seed: Some(1),
            ..DeviceModel::default()
        };
        SimulatedHardware::new(&settings.board, model, 1.0)
    }

    fn settings() -> LiveSettings {
        LiveSettings {
            vgs: 0.4,
            vds: 0.05,
            fs: 1000.0,
            every_n: 100,
            duration: Some(Duration::from_millis(550)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn streams_until_duration_elapses() {
        let hw = hardware();
        let journal = hw.journal();
        let plot = Arc::new(BroadcastPlot::new(64));
        let mut rx = plot.subscribe();
        let mut live = LiveAcquisition::new(hw).with_plot(plot.clone());

        let summary = live.run(&settings()).await.unwrap();
        assert_eq!(summary.blocks, 5);
        assert_eq!(summary.scans, 500);
        let expected = DeviceModel::default().ids(0, 0.4, 0.05);
        assert!((summary.last_means[0] - expected).abs() < 1e-12);
        assert_eq!(journal.last_bias(), Some((0.0, 0.0)));
        assert_eq!(journal.count(|c| *c == HardwareCall::StopRead), 1);
        assert!(matches!(rx.try_recv(), Ok(PlotEvent::Live { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_start_reads_nothing() {
        let mut live = LiveAcquisition::new(hardware());
        live.stop_handle().stop();
        let summary = live.run(&settings()).await.unwrap();
        assert_eq!(summary.blocks, 0);
        let journal = live.into_hardware().journal();
        assert_eq!(journal.count(HardwareCall::is_read), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fault_ends_the_stream_with_an_error() {
        let hw = hardware().fault_on_read(0);
        let journal = hw.journal();
        let mut live = LiveAcquisition::new(hw);
        let err = live.run(&settings()).await.unwrap_err();
        assert!(err.is_hardware());
        assert_eq!(journal.last_bias(), Some((0.0, 0.0)));
    }
}
