use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use rescope_lib::store::{FsStore, LoggingPointerSink, MapOwnerLookup};
use rescope_lib::{logging, MigrationTracker, Orchestrator, RunOptions};

#[derive(Parser)]
#[command(name = "migrate", about = "Rescope blob migration helper")]
struct Cli {
    /// Tracker database path (defaults to the user data dir)
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a migration against a filesystem-backed store
    Run {
        /// Root directory of the object store
        #[arg(long, value_name = "PATH")]
        store_root: PathBuf,
        /// JSON file mapping item ids to owner ids
        #[arg(long, value_name = "PATH")]
        owners: PathBuf,
        /// Discover and count candidates without mutating the store
        #[arg(long)]
        dry_run: bool,
        /// Items per sequential batch
        #[arg(long, value_name = "N")]
        batch_size: Option<usize>,
        /// Parallel transfers within a batch
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,
        /// Per store call timeout in seconds
        #[arg(long, value_name = "SECS")]
        call_timeout: Option<u64>,
    },
    /// Show progress of the most recent run
    Status,
    /// Preflight-check the store and tracker without running anything
    Validate {
        /// Root directory of the object store
        #[arg(long, value_name = "PATH")]
        store_root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse();
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };

    match cli.cmd {
        Cmd::Run {
            store_root,
            owners,
            dry_run,
            batch_size,
            concurrency,
            call_timeout,
        } => {
            let tracker = MigrationTracker::open(&db_path).await?;
            let lookup = MapOwnerLookup::from_json_file(&owners)?;
            let orchestrator = Orchestrator::new(
                Arc::new(FsStore::new(store_root)),
                Arc::new(lookup),
                Arc::new(LoggingPointerSink),
                tracker,
            );

            let mut options = RunOptions::from_env();
            options.dry_run = dry_run;
            if let Some(size) = batch_size {
                options.batch_size = size;
            }
            if let Some(parallel) = concurrency {
                options.max_concurrency = parallel;
            }
            if let Some(secs) = call_timeout {
                options.per_call_timeout = Duration::from_secs(secs);
            }

            let summary = orchestrator.start(options).await?;
            println!(
                "Run {} finished: {:?} ({} total, {} migrated, {} failed, {} orphans)",
                summary.run_id,
                summary.status,
                summary.total_items,
                summary.success_count,
                summary.error_count,
                summary.orphan_count,
            );
            for failed in &summary.failed_items {
                println!("  failed: {} ({})", failed.old_key, failed.error);
            }
            if summary.error_count > 0 {
                return Err(anyhow!("{} items failed to migrate", summary.error_count));
            }
            Ok(())
        }
        Cmd::Status => {
            let tracker = MigrationTracker::open(&db_path).await?;
            match tracker.latest_run().await? {
                Some(run) => {
                    let progress = tracker.progress(&run.id).await?;
                    println!("Run: {}", progress.run_id);
                    println!("State: {}", progress.state.as_str());
                    println!(
                        "Progress: {}/{} ({} ok, {} failed, {} orphans)",
                        progress.processed,
                        progress.total,
                        progress.success,
                        progress.error,
                        progress.orphans,
                    );
                    println!("Throughput: {:.2} items/s", progress.throughput_per_sec);
                }
                None => println!("No runs recorded."),
            }
            Ok(())
        }
        Cmd::Validate { store_root } => {
            let tracker = MigrationTracker::open(&db_path).await?;
            let orchestrator = Orchestrator::new(
                Arc::new(FsStore::new(store_root)),
                Arc::new(MapOwnerLookup::default()),
                Arc::new(LoggingPointerSink),
                tracker,
            );
            let report = orchestrator.validate_integrity(None).await?;
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            if report.ok() {
                println!("Validation OK.");
                Ok(())
            } else {
                for error in &report.errors {
                    println!("error: {error}");
                }
                Err(anyhow!("validation reported {} errors", report.errors.len()))
            }
        }
    }
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().unwrap_or(std::env::current_dir()?);
    Ok(base.join("rescope").join("rescope.sqlite3"))
}
