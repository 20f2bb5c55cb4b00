//! pilotgridd — the PilotGrid daemon.
//!
//! Single binary that assembles all PilotGrid subsystems:
//! - State store (redb)
//! - Pilot slot manager + batch-scheduler command runner
//! - Slot scheduler
//! - Creation manager with the reference collaborators
//! - REST API + pilot notification endpoint
//! - Notification log poller (when pilots report over SSH)
//!
//! # Usage
//!
//! ```text
//! pilotgridd serve --config /etc/pilotgrid/pilotgrid.toml --port 8443
//! pilotgridd check-config --config /etc/pilotgrid/pilotgrid.toml
//! pilotgridd default-config > pilotgrid.toml
//! ```

mod daemon;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use pilotgrid_core::PilotGridConfig;
use pilotgrid_pilot::ProcessRunner;

use crate::daemon::Daemon;

#[derive(Parser)]
#[command(name = "pilotgridd", about = "PilotGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Serve {
        /// Configuration file; built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the configuration).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the configuration).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the default configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pilotgridd=debug,pilotgrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => serve(config, port, data_dir).await,
        Command::CheckConfig { config } => {
            PilotGridConfig::from_file(&config)
                .with_context(|| format!("invalid configuration {}", config.display()))?;
            println!("{}: ok", config.display());
            Ok(())
        }
        Command::DefaultConfig => {
            print!("{}", PilotGridConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => PilotGridConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PilotGridConfig::default(),
    };
    if let Some(port) = port {
        config.api.port = port;
    }
    if let Some(data_dir) = data_dir {
        config.store.data_dir = data_dir;
    }
    config.validate()?;

    info!(
        config = ?config_path,
        data_dir = ?config.store.data_dir,
        "PilotGrid daemon starting"
    );

    let runner = Arc::new(ProcessRunner::new(Duration::from_secs(
        config.pilot.command_timeout_secs,
    )));
    Daemon::assemble(config, runner).await?.run().await
}
