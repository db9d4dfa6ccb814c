//! Privileged access to the inverter battery time control
//!
//! Holds the device password so that `kostal-interval` does not need to.
//! Usage: kostal-time-control read | kostal-time-control write '<json>'

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Target;
use kostal_interval::{
    config::AppConfig,
    logging,
    time_control_client::{DirectTimeControl, TimeControl, TimeControlUpdate},
};
use log::error;
use std::process::ExitCode;

/// Reads and writes the battery time control of a Kostal Plenticore inverter
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the time control of all weekdays as a JSON object
    Read,
    /// Apply a JSON object mapping time control setting keys to day strings
    Write { json: String },
}

fn main() -> ExitCode {
    // stdout carries the JSON result only
    logging::init(Target::Stderr);

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("application error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    let credential = config.device.credential()?.clone();
    let device = DirectTimeControl::over_http(&config.device, credential, config.schedule.codec)
        .context("failed to set up device client")?;

    match cli.command {
        Command::Read => {
            let schedule = device
                .read_time_controls()
                .context("failed to read time controls")?;
            let json = serde_json::to_string(&schedule.to_settings())
                .context("failed to serialize time controls")?;
            println!("{json}");
        }
        Command::Write { json } => {
            let update: TimeControlUpdate =
                serde_json::from_str(&json).context("failed to parse time control update")?;
            device
                .write_time_controls(&update)
                .context("failed to write time controls")?;
        }
    }

    device.close();
    Ok(())
}
