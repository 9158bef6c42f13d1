//! # ITSM Bridge Entry Point
//!
//! `serve` runs the API, the job worker and the retention reaper in one
//! process; `worker` runs only the background tasks; `migrate` applies the
//! schema and exits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use itsm_bridge::config::ConfigLoader;
use itsm_bridge::db::{init_pool, run_migrations};
use itsm_bridge::server::run_server;
use itsm_bridge::services::Services;
use itsm_bridge::telemetry::init_tracing;

/// ITSM record migration service
#[derive(Parser, Debug)]
#[command(name = "itsm-bridge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// API, job worker and retention reaper (default)
    Serve,
    /// Job worker and retention reaper only
    Worker {
        /// Process every queued job once, then exit
        #[arg(long)]
        once: bool,
    },
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("Failed to load configuration")?;
    init_tracing(&config).context("Failed to initialize tracing")?;

    info!(profile = %config.profile, version = env!("CARGO_PKG_VERSION"), "Starting itsm-bridge");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Loaded configuration");
    }

    let db = init_pool(&config).await?;
    run_migrations(&db).await?;

    let command = cli.command.unwrap_or(Command::Serve);
    if command == Command::Migrate {
        info!("Migrations applied");
        return Ok(());
    }

    let services = Services::new(config, db)?;

    if let Command::Worker { once: true } = command {
        let processed = services.worker.drain().await?;
        info!(processed, "Queue drained");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    let worker = tokio::spawn(services.worker.run(shutdown.clone()));
    let reaper = tokio::spawn(services.reaper.run(shutdown.clone()));

    if command == Command::Serve {
        if let Err(err) = run_server(services.state, shutdown.clone()).await {
            error!(error = %err, "API server failed");
            shutdown.cancel();
        }
    } else {
        shutdown.cancelled().await;
    }

    let _ = tokio::join!(worker, reaper);
    info!("itsm-bridge stopped");
    Ok(())
}
