//! CLI entry point for the NetGuard discovery engine.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use netguard_journal::{CycleJournal, JournalQuery};
use netguard_store::JsonFileStore;

use netguard_discover::config::DiscoverConfig;
use netguard_discover::scheduler::ScanScheduler;
use netguard_discover::vendor::VendorTable;
use netguard_discover::ScanEngine;

#[derive(Parser)]
#[command(name = "netguard")]
#[command(about = "Network discovery and device classification")]
struct Cli {
    /// Config file prefix (default: netguard).
    #[arg(short, long, default_value = "netguard", global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scan cycle, commit it and print the outcome.
    Scan {
        /// Scope to scan (CIDR or bare address); detected when omitted.
        #[arg(short, long)]
        scope: Option<String>,
    },
    /// Scan on the configured interval until Ctrl-C.
    Daemon,
    /// List persisted devices.
    Devices,
    /// Show the transition log.
    History {
        /// Only transitions of this device.
        #[arg(short, long)]
        address: Option<IpAddr>,
    },
    /// Show the recent observations of one device.
    Activity {
        address: IpAddr,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// List cycle journal entries and check their integrity.
    Journal {
        /// Show one entry by scan id.
        #[arg(long)]
        id: Option<Uuid>,
        /// Only entries for this scope.
        #[arg(short, long)]
        scope: Option<String>,
        /// Only cycles that ended in an error.
        #[arg(long)]
        failed: bool,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Show recent scan summaries.
    Scans {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Block a device.
    Block { address: IpAddr },
    /// Unblock a device; the next scan reclassifies it.
    Unblock { address: IpAddr },
    /// Mark a device safe.
    MarkSafe { address: IpAddr },
    /// Set the operator alias of a device.
    Rename { address: IpAddr, name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    let config = load_discover_config(&cli.config)?;
    let engine = Arc::new(build_engine(config).await?);

    match cli.command {
        Command::Scan { scope } => print_json(&engine.scan_and_commit(scope.as_deref()).await?)?,
        Command::Daemon => {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                    // Dropping the sender would stop the scheduler.
                    std::future::pending::<()>().await;
                }
                tracing::info!("Shutdown requested");
                let _ = tx.send(true);
            });

            let interval = Duration::from_secs(engine.config().interval_secs.max(1));
            ScanScheduler::new(engine, interval).run(rx).await;
        }
        Command::Devices => print_json(&engine.devices().await?)?,
        Command::History { address } => print_json(&engine.transitions(address).await?)?,
        Command::Activity { address, limit } => print_json(&engine.activity(address, limit).await?)?,
        Command::Journal { id: Some(id), .. } => print_json(&engine.journal_entry(id)?)?,
        Command::Journal {
            id: None,
            scope,
            failed,
            limit,
        } => {
            let listings = engine.journal_entries(&JournalQuery {
                scope,
                failed_only: failed,
                limit: Some(limit),
            })?;
            let tampered = listings.iter().filter(|l| !l.intact).count();
            if tampered > 0 {
                tracing::warn!(tampered, "Journal entries fail integrity check");
            }
            print_json(&listings)?;
        }
        Command::Scans { limit } => print_json(&engine.scan_history(limit).await?)?,
        Command::Block { address } => print_json(&engine.block(address).await?)?,
        Command::Unblock { address } => print_json(&engine.unblock(address).await?)?,
        Command::MarkSafe { address } => print_json(&engine.mark_safe(address).await?)?,
        Command::Rename { address, name } => print_json(&engine.rename(address, &name).await?)?,
    }

    Ok(())
}

async fn build_engine(config: DiscoverConfig) -> anyhow::Result<ScanEngine> {
    let store = JsonFileStore::open(&config.store_path).await?;
    tracing::info!(path = %config.store_path, "Device store opened");

    let vendors = match config.vendor_db.as_deref() {
        Some(path) if !path.trim().is_empty() => Some(Arc::new(VendorTable::load(path)?)),
        _ => None,
    };

    let journal = match config.journal_dir.as_deref() {
        Some(dir) if !dir.trim().is_empty() => match CycleJournal::open(dir) {
            Ok(journal) => Some(Arc::new(journal)),
            Err(e) => {
                tracing::warn!(dir = %dir, error = %e, "Failed to open cycle journal, continuing without");
                None
            }
        },
        _ => None,
    };

    let mut engine = ScanEngine::new(config, Arc::new(store));
    if let Some(vendors) = vendors {
        engine = engine.with_vendor_table(vendors);
    }
    if let Some(journal) = journal {
        engine = engine.with_journal(journal);
    }
    Ok(engine)
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_discover_config(file_prefix: &str) -> anyhow::Result<DiscoverConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("NETGUARD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    match cfg.get::<DiscoverConfig>("discover") {
        Ok(c) => Ok(c),
        Err(config::ConfigError::NotFound(_)) => Ok(DiscoverConfig::default()),
        Err(e) => Err(e.into()),
    }
}
