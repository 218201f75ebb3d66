//! Hardware session contract.
//!
//! A session owns the DAQ read/write handles of one board. Every `start_*`
//! call returns as soon as the hardware is armed; data arrives later as
//! [`HardwareEvent`]s pushed into the event queue registered with
//! [`HardwareSession::connect`]. The characterization machine consumes that
//! queue on a single task, so no session callback ever runs concurrently with
//! another.
//!
//! Samples are delivered already conditioned into currents (A), see
//! [`conditioning`].

pub mod conditioning;
pub mod simulated;

pub use conditioning::Conditioning;
pub use simulated::{DeviceModel, HardwareCall, Journal, SimulatedHardware};

use crate::data::SampleBlock;
use crate::error::AppResult;
use crate::machine::MachineEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Position of the AC/DC/Gate path switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchMode {
    /// DC amplifiers on the channel inputs
    Dc,
    /// AC amplifiers on the channel inputs
    Ac,
    /// Gate current amplifier
    Gate,
}

/// Analog input group read by one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputGroup {
    /// DC input of every channel
    Dc,
    /// AC input of every channel
    Ac,
    /// AC input of one channel, used by sequential Bode passes
    AcChannel(usize),
    /// Gate current input
    Gate,
}

impl fmt::Display for InputGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputGroup::Dc => write!(f, "DC"),
            InputGroup::Ac => write!(f, "AC"),
            InputGroup::AcChannel(ch) => write!(f, "AC[{ch}]"),
            InputGroup::Gate => write!(f, "Gate"),
        }
    }
}

/// Identifier of one started acquisition; events of other ids are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AcquisitionId(pub u64);

impl fmt::Display for AcquisitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acq#{}", self.0)
    }
}

/// Callback payloads of the acquisition layer.
#[derive(Debug, Clone)]
pub enum HardwareEvent {
    /// Every-N-samples delivery.
    Samples {
        /// Originating acquisition
        acquisition: AcquisitionId,
        /// Samples since the previous delivery
        block: SampleBlock,
    },
    /// A single-shot read finished; `block` holds the whole trace.
    Done {
        /// Originating acquisition
        acquisition: AcquisitionId,
        /// Complete trace
        block: SampleBlock,
    },
    /// The acquisition failed.
    Fault {
        /// Originating acquisition
        acquisition: AcquisitionId,
        /// Driver message
        message: String,
    },
}

impl HardwareEvent {
    /// Acquisition the event belongs to.
    pub fn acquisition(&self) -> AcquisitionId {
        match self {
            HardwareEvent::Samples { acquisition, .. }
            | HardwareEvent::Done { acquisition, .. }
            | HardwareEvent::Fault { acquisition, .. } => *acquisition,
        }
    }
}

/// Sending half of the machine's event queue, handed to a session.
#[derive(Debug, Clone)]
pub struct HardwareEvents {
    tx: mpsc::UnboundedSender<MachineEvent>,
}

impl HardwareEvents {
    /// Wrap the machine queue.
    pub fn new(tx: mpsc::UnboundedSender<MachineEvent>) -> Self {
        Self { tx }
    }

    /// Push an event; returns `false` once the consumer is gone.
    pub fn send(&self, event: HardwareEvent) -> bool {
        self.tx.send(MachineEvent::Hardware(event)).is_ok()
    }
}

/// One DAQ board as seen by the characterization machine.
#[async_trait]
pub trait HardwareSession: Send {
    /// Register the queue receiving all acquisition events.
    fn connect(&mut self, events: HardwareEvents);

    /// Channel names in acquisition order.
    fn channel_names(&self) -> Vec<String>;

    /// Drive the bias outputs: `Vs = -vgs`, `Vds = vds`.
    async fn set_bias(&mut self, vgs: f64, vds: f64) -> AppResult<()>;

    /// Move the path switch; a no-op on boards without one.
    async fn select_switch(&mut self, mode: SwitchMode) -> AppResult<()>;

    /// Start a free-running read delivering a block every `every_n` scans.
    async fn start_continuous_read(
        &mut self,
        group: InputGroup,
        fs: f64,
        every_n: usize,
    ) -> AppResult<AcquisitionId>;

    /// Start a finite read of `n_samples` scans, delivering blocks every
    /// `every_n` scans and a final `Done` with the whole trace.
    async fn start_single_read(
        &mut self,
        group: InputGroup,
        fs: f64,
        n_samples: usize,
        every_n: usize,
    ) -> AppResult<AcquisitionId>;

    /// Play `samples` on the gate output at `fs`, regenerating until stopped.
    async fn start_test_signal(&mut self, samples: &[f64], fs: f64) -> AppResult<()>;

    /// Stop the gate output.
    async fn stop_test_signal(&mut self) -> AppResult<()>;

    /// Stop the running read, if any. Later events of that read are not sent.
    async fn stop_read(&mut self) -> AppResult<()>;
}
