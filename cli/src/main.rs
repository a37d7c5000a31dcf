//! RecycleIndex CLI: mirrors RecycleChain contract events into SQLite.
//!
//! # Commands
//! ```text
//! recycleindex run                        index live events until Ctrl-C
//! recycleindex resync <from> [<to>|latest]  replay a block range
//! recycleindex info                       show configuration and row counts
//! recycleindex version
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use recycleindex_core::{Feed, Indexer, ResyncReport};
use recycleindex_evm::WsFeed;
use recycleindex_storage::SqliteStore;

mod config;
mod logging;

use config::AppConfig;

#[derive(Parser)]
#[command(
    name = "recycleindex",
    about = "Index RecycleChain ledger events into a relational store",
    long_about = "
RecycleIndex: follows the RecycleChain contract over a node WebSocket and
mirrors manufacturers, products, product items, their status history and
toxic items into SQLite.

ENVIRONMENT VARIABLES:
  RECYCLEINDEX_RPC_URL     node WebSocket endpoint
  RECYCLEINDEX_CONTRACT    RecycleChain contract address
  RECYCLEINDEX_DATABASE    SQLite path or sqlite: URL
  RUST_LOG                 log filter, overrides the config file
",
    disable_version_flag = true
)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to live events (after the optional startup resync) until Ctrl-C
    Run,

    /// Replay every event in a closed block range
    Resync {
        /// First block of the range
        from: u64,
        /// Last block of the range, or "latest" for the current head
        #[arg(default_value = "latest")]
        to: ResyncTarget,
    },

    /// Show configuration and stored row counts
    Info,

    /// Print version information
    Version,
}

/// Upper bound of a resync range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResyncTarget {
    Latest,
    Block(u64),
}

impl FromStr for ResyncTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        s.parse()
            .map(Self::Block)
            .map_err(|_| format!("expected a block number or 'latest', got '{s}'"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("recycleindex {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = AppConfig::load(cli.config.as_deref())?;
    logging::init_tracing(&config.log);

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Resync { from, to } => resync(config, from, to).await,
        Commands::Info => show_info(config).await,
        Commands::Version => Ok(()),
    }
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn connect(config: &AppConfig) -> Result<(Arc<WsFeed>, Arc<SqliteStore>)> {
    let feed = WsFeed::new(config.evm.clone()).context("configuring EVM feed")?;
    let store = SqliteStore::open(&config.database)
        .await
        .with_context(|| format!("opening database {}", config.database))?;
    Ok((Arc::new(feed), Arc::new(store)))
}

async fn run(config: AppConfig) -> Result<()> {
    let (feed, store) = connect(&config).await?;
    let indexer = Indexer::new(config.indexer.clone(), feed, store);

    if let Some(report) = indexer.init().await.context("starting indexer")? {
        print_report(&report);
    }
    info!(id = %config.indexer.id, "indexing live events; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown requested");
    indexer.shutdown().await?;

    let metrics = indexer.metrics();
    info!(
        received = metrics.events_received,
        applied = metrics.events_applied,
        dropped = metrics.events_dropped,
        failed = metrics.events_failed,
        "indexer stopped"
    );
    Ok(())
}

async fn resync(config: AppConfig, from: u64, to: ResyncTarget) -> Result<()> {
    let (feed, store) = connect(&config).await?;
    let indexer = Indexer::new(config.indexer.clone(), feed.clone(), store);

    let report = match to {
        ResyncTarget::Latest => indexer.resync_to_head(from).await,
        ResyncTarget::Block(to) => indexer.resync(from, to).await,
    }
    .context("resync failed")?;
    print_report(&report);

    feed.disconnect().await?;
    Ok(())
}

async fn show_info(config: AppConfig) -> Result<()> {
    println!("RecycleIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Indexer id:  {}", config.indexer.id);
    println!("  Node:        {}", config.evm.rpc_url);
    println!(
        "  Contract:    {}",
        if config.evm.contract_address.is_empty() {
            "(not set)"
        } else {
            config.evm.contract_address.as_str()
        }
    );
    println!("  Database:    {}", config.database);
    println!("  Start block: {}", config.indexer.start_block);
    println!();

    let store = SqliteStore::open(&config.database)
        .await
        .with_context(|| format!("opening database {}", config.database))?;
    let counts = store.counts().await?;
    println!("  manufacturers  {:>10}", counts.manufacturers);
    println!("  products       {:>10}", counts.products);
    println!("  product_items  {:>10}", counts.product_items);
    println!("  transactions   {:>10}", counts.transactions);
    println!("  toxic_items    {:>10}", counts.toxic_items);
    Ok(())
}

fn print_report(report: &ResyncReport) {
    println!("Resync {}..={}", report.from, report.to);
    println!(
        "  {:<28}{:>9}{:>9}{:>9}{:>9}",
        "event", "fetched", "applied", "dropped", "failed"
    );
    for (kind, r) in &report.kinds {
        println!(
            "  {:<28}{:>9}{:>9}{:>9}{:>9}",
            kind.name(),
            r.fetched,
            r.applied,
            r.dropped,
            r.failed
        );
    }
    let t = report.totals();
    println!(
        "  {:<28}{:>9}{:>9}{:>9}{:>9}",
        "total", t.fetched, t.applied, t.dropped, t.failed
    );
}
