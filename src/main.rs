//! iTrust wallet background binary.
//!
//! Runs the background core: loads and migrates the stored wallet state,
//! serves UI surfaces and pages over the session transport, and exposes a
//! read-only status API. Also provides maintenance commands for the stored
//! blob.
//!
//! Usage:
//!   itrust                          # run the background (default)
//!   itrust run                      # run the background (explicit)
//!   itrust inspect                  # show version and shape of stored state
//!   itrust migrate --dry-run        # list migrations that would run
//!   itrust migrate                  # migrate the stored state in place

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use itrust::background::{self, BackgroundDeps};
use itrust::config::ItrustConfig;
use itrust::migration::Migrator;
use itrust::network::HttpNetworkClient;
use itrust::platform::HeadlessPlatform;
use itrust::reporting::{report_migration_failure, TracingMetrics, TracingReporter};
use itrust::state::{state_structure, VersionedState};
use itrust::storage::{SledStorage, Storage};
use tracing_subscriber::EnvFilter;

/// iTrust wallet background process.
#[derive(Parser, Debug)]
#[command(name = "itrust", version, about = "iTrust wallet background core")]
struct Cli {
    /// Data directory for persistent storage and `itrust.toml`.
    #[arg(long, default_value = "./itrust-data", global = true)]
    data_dir: PathBuf,

    /// Verbose logging; also skips the onboarding page on first install.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the background until interrupted.
    Run {
        /// Node endpoint, overriding the configured one.
        #[arg(long)]
        rpc_target: Option<String>,

        /// Status API port.
        #[arg(long)]
        rpc_port: Option<u16>,
    },

    /// Print the stored blob's version and secret-free structure.
    Inspect,

    /// Run pending migrations on the stored blob.
    Migrate {
        /// Only list the steps that would run.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let debug = cli.debug || std::env::var_os("ITRUST_DEBUG").is_some();
    let default_level = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        // Default (no subcommand) → run with configured endpoints
        None => run(cli.data_dir, debug, None, None).await,
        Some(Command::Run {
            rpc_target,
            rpc_port,
        }) => run(cli.data_dir, debug, rpc_target, rpc_port).await,
        Some(Command::Inspect) => inspect(&cli.data_dir),
        Some(Command::Migrate { dry_run }) => migrate(&cli.data_dir, dry_run),
    }
}

fn open_storage(data_dir: &std::path::Path) -> Result<SledStorage, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;
    Ok(SledStorage::open(&data_dir.join("db"))?)
}

async fn run(
    data_dir: PathBuf,
    debug: bool,
    rpc_target: Option<String>,
    rpc_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ItrustConfig::load(&data_dir);
    config.background.debug |= debug;
    if let Some(target) = rpc_target {
        config.network.rpc_target = target;
    }
    if let Some(port) = rpc_port {
        config.rpc.port = port;
    }

    tracing::info!("Starting iTrust background...");
    tracing::info!("Data: {}", data_dir.display());

    let storage = Arc::new(open_storage(&data_dir)?);
    let deps = BackgroundDeps {
        storage,
        platform: Arc::new(HeadlessPlatform::new(config.platform.clone())),
        node: Arc::new(HttpNetworkClient::new()),
        reporter: Arc::new(TracingReporter),
        metrics: Arc::new(TracingMetrics),
    };
    let mut background = background::initialize(config, deps).await?;
    let transport = background.serve().await?;
    tracing::info!(
        "Serving sessions on {} (internal) and {} (external)",
        transport.internal_addr,
        transport.external_addr
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    background.shutdown().await;
    Ok(())
}

fn inspect(data_dir: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_storage(data_dir)?;
    match storage.get()? {
        None => println!("No stored state in {}", data_dir.display()),
        Some(raw) => {
            let version = raw["meta"]["version"].as_u64().unwrap_or(0);
            println!("Version:   {}", version);
            println!("Structure:");
            println!("{}", serde_json::to_string_pretty(&state_structure(&raw["data"]))?);
        }
    }
    Ok(())
}

fn migrate(data_dir: &std::path::Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_storage(data_dir)?;
    let Some(raw) = storage.get()? else {
        println!("No stored state in {}", data_dir.display());
        return Ok(());
    };
    let stored: VersionedState = serde_json::from_value(raw)?;
    let migrator = Migrator::with_registered();
    let pending = migrator.pending(stored.meta.version);
    if pending.is_empty() {
        println!("State is at version {}, nothing to migrate", stored.meta.version);
        return Ok(());
    }
    println!(
        "State is at version {}, pending: {:?}",
        stored.meta.version, pending
    );
    if dry_run {
        return Ok(());
    }

    let outcome = migrator.migrate_data(stored);
    if let Some(failure) = &outcome.failure {
        report_migration_failure(&TracingReporter, failure);
        println!("Step {} failed: {}", failure.version, failure.error);
    }
    storage.set(&outcome.state)?;
    storage.flush()?;
    println!("State is now at version {}", outcome.state.meta.version);
    Ok(())
}
