//! Deposit Agent - Main entry point
//!
//! Runs one export job: bundle a source collection, stream it into the
//! destination repository, verify checksums, and report the outcome.

use anyhow::Result;
use clap::Parser;
use deposit_agent::{
    config::Config, executor::ExportExecutor, job::ExportJob, store::fs::FsStore, utils,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Source collection to export, relative to the store root
    collection: String,

    /// Destination collection alias the dataset is created under
    alias: String,

    /// Delete source files once their transfer is verified
    #[arg(long)]
    delete: bool,

    /// Ask the destination to restrict access to the deposited files
    #[arg(long)]
    restrict: bool,

    /// Limit the export to these relative paths (repeatable)
    #[arg(long = "path", value_name = "PATH")]
    paths: Vec<String>,

    /// Depositor the export is performed for
    #[arg(long, default_value = "unknown")]
    depositor: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting deposit-agent v{} (store: {})",
        env!("CARGO_PKG_VERSION"),
        config.store.root.display()
    );

    let job = ExportJob {
        job_id: uuid::Uuid::new_v4().to_string(),
        source_id: args.collection,
        destination_alias: args.alias,
        delete_after: args.delete,
        restrict: args.restrict,
        restrict_paths: args.paths,
        depositor: args.depositor,
    };

    let store = Arc::new(FsStore::new(config.store.root.clone()));
    let executor = ExportExecutor::new(store, config)?;
    let summary = executor.execute(&job).await?;

    tracing::info!(
        "Export finished: {} file(s), {} byte(s) -> {}",
        summary.files,
        summary.bytes,
        summary.dataset_url
    );
    Ok(())
}
