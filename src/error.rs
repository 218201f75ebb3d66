//! Custom error types for the application.
//!
//! This module defines the primary error type, `CharactError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration issues to hardware
//! faults and result-store violations.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML syntax errors or missing
//!   keys in the configuration file.
//! - **`Configuration`**: Semantic errors in the configuration, values that parse but are
//!   logically wrong (a negative sampling rate, a Bode sweep without a `vg` output).
//! - **`Hardware`**: Anything raised by a hardware session call or delivered as a fault
//!   by the acquisition layer.
//! - **`AcquisitionBusy`**: The dispatcher tried to start a second acquisition while one
//!   is still outstanding.
//! - **`Processing`**: Numerical preconditions that do not hold (buffer length not a
//!   multiple of the segment length, too few samples for a fit).
//! - **`FrequencyAxisMismatch`**, **`CellAlreadyWritten`**, **`IndexOutOfRange`**,
//!   **`ShapeMismatch`**: Result-store invariants.
//!
//! Inside the characterization machine any of these ends the run through the same
//! cleanup path as a normal finish (bias to zero, completion raised).

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CharactError>;

/// Errors raised while configuring or running a characterization.
#[derive(Error, Debug)]
pub enum CharactError {
    /// Configuration file could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Loaded configuration is inconsistent.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Result file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding of the result file.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hardware call failed or an acquisition reported a fault.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// A second acquisition was requested while one is outstanding.
    #[error("Acquisition already in flight; at most one hardware request may be outstanding")]
    AcquisitionBusy,

    /// Stability fit or spectral estimate could not be computed.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// AC point selection expression could not be parsed.
    #[error("Invalid index selection '{expr}': {reason}")]
    InvalidSelection {
        /// Expression as entered
        expr: String,
        /// Why it was rejected
        reason: String,
    },

    /// PSD frequency axis differs from the one stored for the channel.
    #[error(
        "Frequency axis mismatch on channel '{channel}': expected {expected} bins, got {actual}"
    )]
    FrequencyAxisMismatch {
        /// Channel name
        channel: String,
        /// Stored bin count
        expected: usize,
        /// Bin count of the new estimate
        actual: usize,
    },

    /// A result cell was written twice.
    #[error("Result cell {table}[{row}, {col}] already written")]
    CellAlreadyWritten {
        /// Result table name
        table: String,
        /// Row index
        row: usize,
        /// Column index
        col: usize,
    },

    /// Sweep or channel index outside its table.
    #[error("Index out of range for {what}: {index} >= {len}")]
    IndexOutOfRange {
        /// Indexed table
        what: String,
        /// Offending index
        index: usize,
        /// Table length
        len: usize,
    },

    /// Data length does not match the planned shape.
    #[error("Shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Checked quantity
        what: String,
        /// Planned length
        expected: usize,
        /// Received length
        actual: usize,
    },

    /// Every sender of the machine event queue was dropped.
    #[error("Machine event queue closed unexpectedly")]
    EventQueueClosed,

    /// Operation not allowed in the current machine state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<figment::Error> for CharactError {
    fn from(value: figment::Error) -> Self {
        CharactError::Config(Box::new(value))
    }
}

impl CharactError {
    /// Whether the error stems from the hardware layer.
    pub fn is_hardware(&self) -> bool {
        matches!(self, CharactError::Hardware(_) | CharactError::AcquisitionBusy)
    }
}
