//! Plot sink: fire-and-forget notifications for live displays.

use crate::data::SampleBlock;
use crate::hardware::InputGroup;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Receives refresh notifications and live data; never blocks the caller.
pub trait PlotSink: Send + Sync {
    /// Stored results changed.
    fn notify_refresh(&self);

    /// A block of conditioned samples arrived from `source`.
    fn live_data(&self, _source: InputGroup, _block: &SampleBlock) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlot;

impl PlotSink for NullPlot {
    fn notify_refresh(&self) {}
}

/// Message published by [`BroadcastPlot`].
#[derive(Debug, Clone)]
pub enum PlotEvent {
    /// Stored results changed
    Refresh,
    /// Samples of the outstanding acquisition
    Live {
        /// Inputs the block was read from
        source: InputGroup,
        /// Delivered samples
        block: Arc<SampleBlock>,
    },
}

/// Publishes plot events on a broadcast channel; slow receivers lag, the
/// sender never waits.
#[derive(Debug, Clone)]
pub struct BroadcastPlot {
    tx: broadcast::Sender<PlotEvent>,
}

impl BroadcastPlot {
    /// Channel keeping the last `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver for events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PlotEvent> {
        self.tx.subscribe()
    }
}

impl PlotSink for BroadcastPlot {
    fn notify_refresh(&self) {
        // No receivers is fine.
        let _ = self.tx.send(PlotEvent::Refresh);
    }

    fn live_data(&self, source: InputGroup, block: &SampleBlock) {
        if self.tx.receiver_count() > 0 {
            let _ = self.tx.send(PlotEvent::Live {
                source,
                block: Arc::new(block.clone()),
            });
        }
    }
}
