//! # GFET Characterization Library
//!
//! Drives the electrical characterization of an array of graphene field-effect
//! transistors over a DAQ board: a Vds × Vgs bias sweep with DC settling
//! detection at every point, optional gate leakage, PSD noise and Bode
//! transconductance measurements, collected into one result file.
//!
//! ## Crate Structure
//!
//! - **`config`**: TOML + environment settings loaded with `figment`. See `config::Settings`.
//! - **`sweep`**: Sweep plan derived from settings and the ordered step catalog.
//! - **`machine`**: The characterization state machine executing the step catalog.
//! - **`hardware`**: The `HardwareSession` seam, signal conditioning and a simulated board.
//! - **`stability`**: Linear-fit DC settling detector.
//! - **`bode`**: Coherent multi-tone test signals and their gain extraction.
//! - **`data`**: Sample blocks, averaged FFT and Welch PSD.
//! - **`storage`**: Write-once result grids and the JSON characterization file.
//! - **`acquisition`**: Free-running DC acquisition at a fixed bias.
//! - **`report`** and **`plot`**: Progress messages and live-display notifications.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The `CharactError` enum shared by every module.
//! - **`validation`**: Small predicates used by configuration validation.

pub mod acquisition;
pub mod bode;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod machine;
pub mod plot;
pub mod report;
pub mod stability;
pub mod storage;
pub mod sweep;
pub mod validation;
