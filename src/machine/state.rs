//! Machine lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a characterization run.
///
/// ```text
/// Idle ──run──> Running ──dispatch──> Dc | Gate | Bode | Psd
///                  ▲                          │
///                  └────────completion────────┘
/// Running ──queue empty / stop / fatal error──> Finished
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    /// Not started
    Idle,
    /// Between steps
    Running,
    /// DC stabilization in flight
    Dc,
    /// Gate acquisition in flight
    Gate,
    /// PSD acquisition in flight
    Psd,
    /// Bode acquisition in flight
    Bode,
    /// Terminal
    Finished,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Idle => write!(f, "Idle"),
            MachineState::Running => write!(f, "Running"),
            MachineState::Dc => write!(f, "StepDC"),
            MachineState::Gate => write!(f, "StepGate"),
            MachineState::Psd => write!(f, "StepPSD"),
            MachineState::Bode => write!(f, "StepBode"),
            MachineState::Finished => write!(f, "Finished"),
        }
    }
}

impl MachineState {
    /// Whether a step is in flight.
    pub fn in_step(&self) -> bool {
        matches!(
            self,
            MachineState::Dc | MachineState::Gate | MachineState::Psd | MachineState::Bode
        )
    }

    /// Whether the run is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MachineState::Finished)
    }
}

/// How a run reached `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEnd {
    /// Every step completed
    Completed,
    /// External stop request
    Stopped,
    /// A step handler failed
    Aborted,
}

impl fmt::Display for RunEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEnd::Completed => write!(f, "completed"),
            RunEnd::Stopped => write!(f, "stopped"),
            RunEnd::Aborted => write!(f, "aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_states_are_in_step() {
        assert!(MachineState::Bode.in_step());
        assert!(!MachineState::Running.in_step());
        assert!(MachineState::Finished.is_terminal());
        assert_eq!(MachineState::Psd.to_string(), "StepPSD");
    }
}
