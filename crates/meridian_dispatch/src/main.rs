//! `meridian-dispatchd`: the dispatch core's standalone binary.
//!
//! Parses CLI configuration, initializes logging, constructs the
//! `Dispatcher`, and runs its background loops until a shutdown signal
//! arrives. Mirrors the teacher's `main.rs` bind-then-run shape.

use std::path::PathBuf;

use clap::Parser;
use meridian_dispatch::{DispatchConfig, Dispatcher, Store};
use meridian_logging::LogConfig;

#[derive(Parser, Debug)]
#[command(name = "meridian-dispatchd", about = "Meridian inference marketplace dispatch core")]
struct Args {
    /// Path to the SQLite database file.
    #[arg(long, env = "MERIDIAN_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Verbose console logging.
    #[arg(long)]
    verbose: bool,

    #[arg(long, default_value_t = DispatchConfig::default().scheduler_interval_s)]
    scheduler_interval_s: u64,

    #[arg(long, default_value_t = DispatchConfig::default().scheduler_batch_size)]
    scheduler_batch_size: u32,

    #[arg(long, default_value_t = DispatchConfig::default().worker_timeout_s)]
    worker_timeout_s: u64,

    #[arg(long, default_value_t = DispatchConfig::default().inactive_worker_sweep_s)]
    inactive_worker_sweep_s: u64,

    #[arg(long, default_value_t = DispatchConfig::default().stale_job_sweep_s)]
    stale_job_sweep_s: u64,

    #[arg(long, default_value_t = DispatchConfig::default().stale_job_grace_s)]
    stale_job_grace_s: u64,

    #[arg(long, default_value_t = DispatchConfig::default().old_job_retention_days)]
    old_job_retention_days: u64,

    #[arg(long, default_value_t = DispatchConfig::default().buffer_flush_size)]
    buffer_flush_size: usize,

    #[arg(long, default_value_t = DispatchConfig::default().buffer_flush_timeout_s)]
    buffer_flush_timeout_s: u64,

    #[arg(long, default_value_t = DispatchConfig::default().buffer_scan_interval_s)]
    buffer_scan_interval_s: u64,

    #[arg(long, default_value_t = DispatchConfig::default().min_workers_default)]
    min_workers_default: u32,

    #[arg(long, default_value_t = DispatchConfig::default().max_workers_default)]
    max_workers_default: u32,
}

impl From<&Args> for DispatchConfig {
    fn from(args: &Args) -> Self {
        Self {
            scheduler_interval_s: args.scheduler_interval_s,
            scheduler_batch_size: args.scheduler_batch_size,
            worker_timeout_s: args.worker_timeout_s,
            inactive_worker_sweep_s: args.inactive_worker_sweep_s,
            stale_job_sweep_s: args.stale_job_sweep_s,
            stale_job_grace_s: args.stale_job_grace_s,
            old_job_retention_days: args.old_job_retention_days,
            buffer_flush_size: args.buffer_flush_size,
            buffer_flush_timeout_s: args.buffer_flush_timeout_s,
            buffer_scan_interval_s: args.buffer_scan_interval_s,
            min_workers_default: args.min_workers_default,
            max_workers_default: args.max_workers_default,
        }
    }
}

fn default_db_path() -> PathBuf {
    meridian_logging::meridian_home().join("dispatch.sqlite3")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    meridian_logging::init_logging(LogConfig {
        app_name: "meridian-dispatchd",
        verbose: args.verbose,
    })?;

    tracing::info!("starting meridian-dispatchd");

    let db_path = args.db_path.clone().unwrap_or_else(default_db_path);
    tracing::info!(db_path = %db_path.display(), "opening store");

    let store = Store::connect(&db_path).await?;
    let config = DispatchConfig::from(&args);
    let dispatcher = Dispatcher::new(store, config);

    dispatcher.clone().spawn_background_loops().await;
    tracing::info!("background loops running, awaiting shutdown signal");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining background loops");
    dispatcher.shutdown().await;

    Ok(())
}
