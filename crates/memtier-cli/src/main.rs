use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use memtier::collab::LocalStore;
use memtier::{Config, MemoryEngine};
use memtier_cli::commands::{ConfigCommand, ConsolidateCommand, MemoryCommand, StatsCommand};
use memtier_cli::error::CliResult;
use memtier_cli::output::OutputFormat;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "memtier-cli")]
#[command(about = "Memtier CLI - Management tool for the memtier memory store")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'd', global = true, help = "Path to data directory")]
    pub data_dir: Option<PathBuf>,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Memory management commands")]
    Memory(MemoryCommand),

    #[clap(about = "Run a consolidation pass")]
    Consolidate(ConsolidateCommand),

    #[clap(about = "Show storage, cache and job statistics")]
    Stats(StatsCommand),

    #[clap(about = "Configuration commands")]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    // quiet by default so table and JSON output stay clean
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    if let Command::Config(cmd) = &cli.command {
        return cmd.execute(cli.config.as_deref(), format).await;
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir.clone() {
        config.storage.data_dir = data_dir;
    }
    // one-shot commands never run the periodic passes
    config.scheduler.light_interval_secs = 0;
    config.scheduler.deep_interval_secs = 0;
    config.scheduler.full_interval_secs = 0;

    let snapshot = config.storage.snapshot_path();
    debug!(snapshot = %snapshot.display(), "Opening memory store");
    let store = Arc::new(LocalStore::open(&snapshot).await?);
    let engine = MemoryEngine::from_config(config, store.clone()).await?;

    let result = match &cli.command {
        Command::Memory(cmd) => cmd.execute(&engine, format).await,
        Command::Consolidate(cmd) => cmd.execute(&engine, format).await,
        Command::Stats(cmd) => cmd.execute(&engine, format).await,
        Command::Config(_) => Ok(()),
    };

    engine.shutdown().await;
    store.flush().await?;
    debug!(ok = result.is_ok(), "Command finished, snapshot flushed");
    result
}
