//! Memtier Daemon - runs background consolidation over a persistent memory store

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use memtier::collab::LocalStore;
use memtier::config::Config;
use memtier::error::Result;
use memtier::MemoryEngine;

/// Memtier - tiered memory lifecycle engine for autonomous agents
#[derive(Parser)]
#[command(name = "memtier")]
#[command(about = "Tiered memory lifecycle engine with background consolidation")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the consolidation triggers until interrupted (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,memtier=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting memtier daemon");

    let config = Config::load(config_path.as_deref())?;
    tracing::debug!("Config loaded: {:?}", config);

    let snapshot = config.storage.snapshot_path();
    tracing::info!("Opening store at: {}", snapshot.display());
    let store = Arc::new(LocalStore::open(&snapshot).await?);

    let flush_every = Duration::from_secs(config.storage.flush_interval_secs.max(1));
    let engine = MemoryEngine::from_config(config, store.clone()).await?;
    let triggers = engine.spawn_triggers();
    tracing::info!(triggers = triggers.len(), "Consolidation triggers running");

    let mut ticker = tokio::time::interval(flush_every);
    ticker.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                if let Err(e) = store.flush().await {
                    tracing::warn!(error = %e, "Periodic snapshot flush failed");
                }
            }
        }
    }

    engine.shutdown().await;
    for trigger in triggers {
        trigger.abort();
    }
    store.flush().await?;

    tracing::info!("Memtier daemon stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
