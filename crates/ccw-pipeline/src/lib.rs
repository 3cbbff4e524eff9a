//! CCW Pipeline Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ingests CCW RIF data sets that the data provider drops into an S3 bucket.
//!
//! # Overview
//!
//! - **Storage**: the [`storage::ObjectStore`] seam with S3 and in-memory backends
//! - **Ingest**: manifest model, transfer manager, data set queue, the load job
//!   and the relocation of processed data sets
//! - **Configuration**: environment-based configuration management
//!
//! # Example
//!
//! ```no_run
//! use ccw_pipeline::ingest::{DataSetLoadJob, LoggingListener, TransferManager};
//! use ccw_pipeline::storage::S3ObjectStore;
//! use ccw_pipeline::config::Config;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let store = Arc::new(S3ObjectStore::new(config.storage.clone()).await?);
//! let transfer = Arc::new(TransferManager::new(store, config.ingest.transfer_options()));
//! let mut job = DataSetLoadJob::new(
//!     transfer,
//!     Arc::new(LoggingListener::new()),
//!     config.ingest.extraction_options(),
//!     config.ingest.job_options(),
//! )?;
//! job.call().await?;
//! job.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod ingest;
pub mod storage;

pub use ccw_common::{PipelineError, Result};
