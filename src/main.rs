//! CLI entry point for gfet_charact
//!
//! # Usage
//!
//! Characterize the board described by a configuration file:
//! ```bash
//! gfet_charact run --config config/gfet.toml --output results/chip01.json
//! ```
//!
//! Show the step catalog and time estimate without acquiring:
//! ```bash
//! gfet_charact plan --config config/gfet.toml --ac-selection "0:13:2"
//! ```
//!
//! Stream drain currents at one bias point for ten seconds:
//! ```bash
//! gfet_charact acquire --config config/gfet.toml --vgs 0.3 --vds 0.05 --duration 10
//! ```
//!
//! The session is the simulated board; `[simulation]` sets its device model
//! and time scale. Ctrl-C stops a run after the step in flight is discarded.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gfet_charact::acquisition::{LiveAcquisition, LiveSettings};
use gfet_charact::config::Settings;
use gfet_charact::hardware::SimulatedHardware;
use gfet_charact::logging;
use gfet_charact::machine::{CharacterizationMachine, RunEnd, StopHandle};
use gfet_charact::storage::CharactFile;
use gfet_charact::sweep::{build_steps, SweepConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "gfet_charact")]
#[command(about = "Graphene FET array characterization", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/gfet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full characterization sweep
    Run {
        /// Result file, overrides storage.output
        #[arg(long)]
        output: Option<PathBuf>,

        /// Acquisition time scale of the simulated board
        #[arg(long)]
        time_scale: Option<f64>,

        /// AC point selection, overrides sweep.ac_selection when valid
        #[arg(long)]
        ac_selection: Option<String>,
    },

    /// Print the step catalog and the time estimate
    Plan {
        /// AC point selection, overrides sweep.ac_selection when valid
        #[arg(long)]
        ac_selection: Option<String>,
    },

    /// Free-running DC acquisition at a fixed bias
    Acquire {
        #[arg(long, allow_hyphen_values = true)]
        vgs: f64,

        #[arg(long, allow_hyphen_values = true)]
        vds: f64,

        /// Seconds; runs until Ctrl-C when absent
        #[arg(long)]
        duration: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_settings(&settings).context("initializing logging")?;

    match cli.command {
        Commands::Run {
            output,
            time_scale,
            ac_selection,
        } => {
            if output.is_some() {
                settings.storage.output = output;
            }
            if let Some(scale) = time_scale {
                settings.simulation.time_scale = scale;
            }
            run(&settings, ac_selection.as_deref()).await
        }
        Commands::Plan { ac_selection } => plan(&settings, ac_selection.as_deref()),
        Commands::Acquire { vgs, vds, duration } => acquire(&settings, vgs, vds, duration).await,
    }
}

fn stop_on_ctrl_c(stop: StopHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping");
            stop.stop();
        }
    });
}

fn simulated(settings: &Settings) -> SimulatedHardware {
    SimulatedHardware::new(
        &settings.board,
        settings.simulation.device.clone(),
        settings.simulation.time_scale,
    )
}

fn sweep_plan(settings: &Settings, ac_selection: Option<&str>) -> Result<SweepConfig> {
    let mut plan = SweepConfig::from_settings(settings).context("building sweep plan")?;
    if let Some(expr) = ac_selection {
        plan.select_ac(expr);
    }
    Ok(plan)
}

async fn run(settings: &Settings, ac_selection: Option<&str>) -> Result<()> {
    let plan = sweep_plan(settings, ac_selection)?;
    let file = CharactFile::new(&plan, settings.storage.output.clone());
    let mut machine = CharacterizationMachine::new(&plan, simulated(settings), file);
    stop_on_ctrl_c(machine.stop_handle());

    let summary = machine.run().await.context("characterization aborted")?;
    let file = machine.store();
    println!(
        "Run {}: {} steps in {:.1} s, {} not run",
        summary.end,
        summary.steps_completed,
        summary.elapsed.as_secs_f64(),
        summary.steps_remaining
    );
    match file.path() {
        Some(path) => println!("Results: {} ({} writes)", path.display(), file.writes()),
        None => println!("Results kept in memory ({} writes)", file.writes()),
    }
    if summary.end == RunEnd::Completed && file.unwritten_cells() > 0 {
        bail!("{} result cells left unwritten", file.unwritten_cells());
    }
    Ok(())
}

fn plan(settings: &Settings, ac_selection: Option<&str>) -> Result<()> {
    let plan = sweep_plan(settings, ac_selection)?;
    let steps = build_steps(&plan);
    for (i, step) in steps.iter().enumerate() {
        println!("{:>5}  {:<8} {}", i, step.selector(), step.label);
    }
    if let Some(psd) = plan.psd() {
        println!(
            "PSD: {} samples per point, Fmin {:.3} Hz",
            psd.n_samples(),
            psd.fmin()
        );
    }
    let est = plan.estimate();
    println!(
        "{} steps, at most {:.0} s DC + {:.0} s AC = {:.0} s",
        steps.len(),
        est.dc_s,
        est.ac_s,
        est.total_s
    );
    Ok(())
}

async fn acquire(settings: &Settings, vgs: f64, vds: f64, duration: Option<f64>) -> Result<()> {
    let mut live_settings = LiveSettings::new(vgs, vds, &settings.sampling);
    if let Some(secs) = duration {
        let d = Duration::try_from_secs_f64(secs).context("invalid --duration")?;
        live_settings = live_settings.with_duration(d);
    }
    let mut live = LiveAcquisition::new(simulated(settings));
    stop_on_ctrl_c(live.stop_handle());

    info!(vgs, vds, "Free-running acquisition, Ctrl-C to stop");
    let summary = live.run(&live_settings).await.context("acquisition failed")?;
    println!(
        "{} blocks, {} scans in {:.1} s",
        summary.blocks,
        summary.scans,
        summary.elapsed.as_secs_f64()
    );
    for (name, ids) in settings.board.channel_names().iter().zip(&summary.last_means) {
        println!("{name:>8}  Ids = {ids:.4e} A");
    }
    Ok(())
}
