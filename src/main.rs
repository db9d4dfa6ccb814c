use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use env_logger::Target;
use kostal_interval::{
    config::{AppConfig, DeviceAccess},
    interval_store::{IntervalStore, StoreLock},
    logging,
    services::scheduler,
    time_control_client::{DirectTimeControl, HelperTimeControl, TimeControl},
};
use log::{debug, error, info};
use std::process::ExitCode;

/// Temporarily blocks battery discharge of a Kostal Plenticore inverter
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Block discharging for the current slot and revert expired overrides
    Block,
    /// Revert every tracked override to its original state
    Revert,
}

fn main() -> ExitCode {
    logging::init(Target::Stdout);

    debug!("module version: {}", env!("CARGO_PKG_VERSION"));

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            error!("application error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = AppConfig::load().context("failed to load configuration")?;

    let Some(command) = cli.command else {
        eprintln!("{}", Cli::command().render_help());
        eprintln!("{}", scheduler::usage(&config));
        return Ok(ExitCode::FAILURE);
    };

    let lock = StoreLock::acquire(&config.store.file).context("failed to lock interval store")?;
    let device = connect(&config)?;
    let mut store = IntervalStore::load(
        lock,
        &config.store.file,
        config.schedule.codec,
        config.schedule.poll_interval,
        device.as_ref(),
    )
    .context("failed to load interval store")?;

    info!("{store}");

    match command {
        Command::Block => scheduler::block(&mut store, &config.schedule.codec.now())
            .context("failed to block current interval")?,
        Command::Revert => {
            scheduler::revert(&mut store).context("failed to revert intervals")?
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn connect(config: &AppConfig) -> Result<Box<dyn TimeControl>> {
    match config.device.access {
        DeviceAccess::Helper => {
            let helper = HelperTimeControl::new(&config.helper.command, config.schedule.codec)
                .context("failed to set up time control helper")?;
            Ok(Box::new(helper))
        }
        DeviceAccess::Direct => {
            let credential = config.device.credential()?.clone();
            let direct = DirectTimeControl::over_http(&config.device, credential, config.schedule.codec)
                .context("failed to set up device client")?;
            Ok(Box::new(direct))
        }
    }
}
