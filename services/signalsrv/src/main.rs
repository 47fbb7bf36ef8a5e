//! signalsrv entry point

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use signalsrv::{build_arbiter, run, Config};

#[derive(Parser, Debug)]
#[command(
    name = "signalsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Traffic-Signal Arbitration Service",
    long_about = None
)]
struct Args {
    /// Configuration file (defaults to config/signalsrv.yaml)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the arbitration workers (default)
    Run,
    /// Validate configuration, print the initial state and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    let _log_guard = common::init_logging(&config.logging)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Check => {
            let arbiter = build_arbiter(&config)?;
            for id in arbiter.intersection_ids() {
                let snapshot = arbiter.get_runtime_state(id)?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&snapshot)
                        .context("failed to render runtime state")?
                );
            }
            info!("Configuration OK");
            Ok(())
        },
        Command::Run => {
            let shutdown = CancellationToken::new();
            let signal_task = tokio::spawn(common::cancel_on_shutdown(shutdown.clone()));

            let result = run(config, shutdown.clone()).await;
            if let Err(e) = &result {
                error!("signalsrv failed: {:#}", e);
            }
            shutdown.cancel();
            let _ = signal_task.await;
            result
        },
    }
}
