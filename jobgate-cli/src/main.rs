//! `jobgate` binary.

mod cli;
mod migrate;
mod roles;
mod signal;
mod supervise;
mod units;

use std::process::ExitCode;

use clap::Parser;
use jobgate::{GateError, Settings};

use crate::cli::{Cli, Command};

/// Exit status when the store's schema revision does not match this binary.
const EXIT_SCHEMA_MISMATCH: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    // Flags, LOG_LEVEL and LOG_FORMAT may come from .env.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    jobgate::logging::init(service_name(&cli.command));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(gate_err @ GateError::SchemaMismatch { .. }) = err.downcast_ref::<GateError>() {
                tracing::error!(error = %gate_err, "refusing to start");
                eprintln!("error: {gate_err}");
                return ExitCode::from(EXIT_SCHEMA_MISMATCH);
            }
            tracing::error!("command failed: {err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let migrations_dir = cli.migrations_dir.as_deref();
    match cli.command {
        Command::Migrate { action } => migrate::run(action, migrations_dir).await,
        Command::Units { action } => units::run(action).await,
        Command::Api => roles::api(Settings::from_env()?, signal::shutdown_token()).await,
        Command::Bot => roles::bot(Settings::from_env()?, signal::shutdown_token()).await,
        Command::Worker { once } => {
            roles::worker(Settings::from_env()?, signal::shutdown_token(), once).await
        }
        Command::RunAll => {
            let settings = Settings::from_env()?;
            supervise::run_all(&settings, signal::shutdown_token()).await
        }
    }
}

fn service_name(command: &Command) -> &'static str {
    match command {
        Command::Api => "api",
        Command::Bot => "bot",
        Command::Worker { .. } => "worker",
        Command::RunAll => "run-all",
        Command::Migrate { .. } => "migrate",
        Command::Units { .. } => "units",
    }
}
