//! Run progress reporting.
//!
//! The machine reports one line per notable event (step started, DC point
//! settled, run finished), timestamped relative to the start of the run.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const MAX_REPORT_ENTRIES: usize = 1000;

/// Advisory progress messages; must not block.
pub trait Reporter: Send + Sync {
    /// Report `message`, `elapsed` after the run started.
    fn report(&self, elapsed: Duration, message: &str);
}

/// Forwards reports to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, elapsed: Duration, message: &str) {
        info!(elapsed_s = elapsed.as_secs_f64(), "{message}");
    }
}

/// Represents a single report.
#[derive(Debug, Clone)]
pub struct ReportEntry {
    /// Wall-clock time of the report
    pub timestamp: DateTime<Local>,
    /// Time since the run started
    pub elapsed: Duration,
    /// Progress text
    pub message: String,
}

/// A thread-safe, fixed-capacity report history.
#[derive(Debug, Clone)]
pub struct ReportBuffer {
    entries: Arc<Mutex<VecDeque<ReportEntry>>>,
    capacity: usize,
}

impl Default for ReportBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportBuffer {
    /// Buffer keeping the last 1000 reports.
    pub fn new() -> Self {
        Self::with_capacity(MAX_REPORT_ENTRIES)
    }

    /// Buffer keeping the last `capacity` reports.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    /// Copy of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<ReportEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Retained messages, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.message.clone()).collect()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Reporter for ReportBuffer {
    fn report(&self, elapsed: Duration, message: &str) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(ReportEntry {
            timestamp: Local::now(),
            elapsed,
            message: message.to_string(),
        });
    }
}

/// Sends every report to each of a list of reporters.
#[derive(Clone, Default)]
pub struct ReporterChain(Vec<Arc<dyn Reporter>>);

impl ReporterChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `reporter`.
    pub fn with(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.0.push(reporter);
        self
    }
}

impl Reporter for ReporterChain {
    fn report(&self, elapsed: Duration, message: &str) {
        for r in &self.0 {
            r.report(elapsed, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_drops_oldest_entries() {
        let buf = ReportBuffer::with_capacity(2);
        for i in 0..3 {
            buf.report(Duration::from_secs(i), &format!("m{i}"));
        }
        assert_eq!(buf.messages(), vec!["m1", "m2"]);
        assert_eq!(buf.entries()[1].elapsed, Duration::from_secs(2));
    }

    #[test]
    fn chain_fans_out() {
        let a = Arc::new(ReportBuffer::new());
        let b = Arc::new(ReportBuffer::new());
        let chain = ReporterChain::new().with(a.clone()).with(b.clone());
        chain.report(Duration::ZERO, "hello");
        assert_eq!(a.messages(), b.messages());
        b.clear();
        assert!(b.entries().is_empty());
    }
}
