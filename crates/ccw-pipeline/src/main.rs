//! CCW Pipeline - RIF data set ingestion

use anyhow::{Context, Result};
use ccw_common::logging::{init_logging, LogConfig, LogLevel};
use ccw_pipeline::config::Config;
use ccw_pipeline::ingest::{
    DataSetLoadJob, DataSetQueue, JobOptions, JobScheduler, LoggingListener, PropertiesPreValidator,
    TracingStatusReporter, TransferManager,
};
use ccw_pipeline::storage::S3ObjectStore;
use clap::Parser;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ccw-pipeline")]
#[command(author, version, about = "CCW RIF data set ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Download and log data sets from the bucket. Objects are never moved.
    Run {
        /// Process at most one data set, ignoring INGEST_RUN_INTERVAL_SECS
        #[arg(long)]
        once: bool,

        /// Reprocessing mode: pre-validation failures do not block loading
        #[arg(long, env = "INGEST_IDEMPOTENT")]
        idempotent: bool,
    },

    /// Show pending data sets and the completed count
    Queue,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("ccw-pipeline")
        .filter_directives("aws_smithy_runtime=warn,aws_config=warn")
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let mut config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        Command::Run { once, idempotent } => {
            if once {
                config.ingest.run_interval_secs = None;
            }
            config.ingest.idempotent |= idempotent;
            run(config).await?;
        },
        Command::Queue => show_queue(config).await?,
    }

    Ok(())
}

async fn build_transfer_manager(config: &Config) -> Result<Arc<TransferManager>> {
    let store = S3ObjectStore::new(config.storage.clone())
        .await
        .context("Failed to initialize object store")?;
    Ok(Arc::new(TransferManager::new(
        Arc::new(store),
        config.ingest.transfer_options(),
    )))
}

async fn run(config: Config) -> Result<()> {
    info!(
        bucket = %config.storage.bucket,
        idempotent = config.ingest.idempotent,
        run_interval_secs = ?config.ingest.run_interval_secs,
        dry_run = true,
        "Starting CCW pipeline"
    );

    // LoggingListener loads nothing, so the data sets must stay where they are
    let job_options = JobOptions {
        dry_run: true,
        ..config.ingest.job_options()
    };

    let transfer = build_transfer_manager(&config).await?;
    let mut job = DataSetLoadJob::new(
        transfer,
        Arc::new(LoggingListener::new()),
        config.ingest.extraction_options(),
        job_options,
    )?
    .with_pre_validator(Arc::new(PropertiesPreValidator))
    .with_status_reporter(Arc::new(TracingStatusReporter));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));

    let scheduler = JobScheduler::for_job(&job, cancel);
    let result = scheduler.run(&mut job).await;

    job.close().await;
    result?;

    info!("CCW pipeline stopped");
    Ok(())
}

async fn show_queue(config: Config) -> Result<()> {
    let transfer = build_transfer_manager(&config).await?;
    let mut queue = DataSetQueue::new(Arc::clone(&transfer), config.ingest.extraction_options())?;

    queue.update_pending_data_sets().await?;
    let completed = queue.refresh_completed_count().await?;

    println!("Pending data sets: {}", queue.pending_manifests_count());
    for id in queue.pending_manifest_ids() {
        println!("  {}", id);
    }
    println!("Completed data sets: {}", completed);

    transfer.shutdown_safely().await;
    Ok(())
}

/// Cancel the scheduler on Ctrl+C or SIGTERM. A running invocation still completes.
async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    cancel_when_signalled(signal::ctrl_c(), terminate, cancel).await;
}

/// A Ctrl+C handler that cannot be installed never fires
async fn cancel_when_signalled(
    ctrl_c: impl Future<Output = std::io::Result<()>>,
    terminate: impl Future<Output = ()>,
    cancel: CancellationToken,
) {
    let ctrl_c = async {
        if let Err(e) = ctrl_c.await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing the current data set before stopping");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing the current data set before stopping");
        },
    }

    cancel.cancel();
}
