//! Ingestion configuration
//!
//! Loaded from `INGEST_*` environment variables; every setting has a default.

use super::manifest::RifFileType;
use crate::storage::RetryPolicy;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Page size for manifest listings (the S3 maximum)
pub const DEFAULT_LIST_MAX_KEYS: i32 = 1000;

/// Free scratch space required before the next data set is downloaded early (50 GiB)
pub const DEFAULT_MIN_BYTES_FOR_PREFETCH: u64 = 50 * 1024 * 1024 * 1024;

/// How often to re-check whether a data set has finished uploading
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 10;

pub const DEFAULT_SCRATCH_DIR_NAME: &str = "ccw-pipeline";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Upper bound on keys returned per listing call
    pub list_max_keys: i32,
    /// Only process data sets made up entirely of this RIF file type
    #[serde(skip)]
    pub allowed_rif_type: Option<RifFileType>,
    /// Local directory downloads are written to
    pub scratch_dir: PathBuf,
    pub min_bytes_for_prefetch: u64,
    pub poll_interval_ms: u64,
    /// Delay between job runs; `None` runs the job exactly once
    pub run_interval_secs: Option<u64>,
    /// Reprocessing mode: pre-validation failures do not block delivery
    pub idempotent: bool,
    pub max_concurrent_transfers: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            list_max_keys: DEFAULT_LIST_MAX_KEYS,
            allowed_rif_type: None,
            scratch_dir: std::env::temp_dir().join(DEFAULT_SCRATCH_DIR_NAME),
            min_bytes_for_prefetch: DEFAULT_MIN_BYTES_FOR_PREFETCH,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            run_interval_secs: None,
            idempotent: false,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            retry_max_attempts: retry.max_attempts,
            retry_base_delay_ms: retry.base_delay.as_millis() as u64,
        }
    }
}

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

fn env_opt<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: '{}'", name, raw)),
        _ => Ok(None),
    }
}

impl IngestConfig {
    /// Load ingestion configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            list_max_keys: env_or("INGEST_LIST_MAX_KEYS", defaults.list_max_keys)?,
            allowed_rif_type: env_opt("INGEST_ALLOWED_RIF_TYPE")?,
            scratch_dir: env_opt::<PathBuf>("INGEST_SCRATCH_DIR")?.unwrap_or(defaults.scratch_dir),
            min_bytes_for_prefetch: env_or("INGEST_MIN_BYTES_FOR_PREFETCH", defaults.min_bytes_for_prefetch)?,
            poll_interval_ms: env_or("INGEST_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            run_interval_secs: env_opt("INGEST_RUN_INTERVAL_SECS")?,
            idempotent: env_or("INGEST_IDEMPOTENT", defaults.idempotent)?,
            max_concurrent_transfers: env_or(
                "INGEST_MAX_CONCURRENT_TRANSFERS",
                defaults.max_concurrent_transfers,
            )?,
            retry_max_attempts: env_or("INGEST_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            retry_base_delay_ms: env_or("INGEST_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.list_max_keys <= 0 {
            anyhow::bail!("INGEST_LIST_MAX_KEYS must be greater than 0");
        }
        if self.max_concurrent_transfers == 0 {
            anyhow::bail!("INGEST_MAX_CONCURRENT_TRANSFERS must be greater than 0");
        }
        if self.retry_max_attempts == 0 {
            anyhow::bail!("INGEST_RETRY_MAX_ATTEMPTS must be greater than 0");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("INGEST_POLL_INTERVAL_MS must be greater than 0");
        }
        if self.run_interval_secs == Some(0) {
            anyhow::bail!("INGEST_RUN_INTERVAL_SECS must be greater than 0 when set");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn run_interval(&self) -> Option<Duration> {
        self.run_interval_secs.map(Duration::from_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn extraction_options(&self) -> ExtractionOptions {
        ExtractionOptions {
            list_max_keys: self.list_max_keys,
            allowed_rif_type: self.allowed_rif_type,
        }
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            scratch_dir: self.scratch_dir.clone(),
            max_concurrent_transfers: self.max_concurrent_transfers,
            retry: self.retry_policy(),
        }
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            poll_interval: self.poll_interval(),
            min_bytes_for_prefetch: self.min_bytes_for_prefetch,
            idempotent: self.idempotent,
            run_interval: self.run_interval(),
            dry_run: false,
        }
    }
}

/// What the data set queue lists and which data sets it accepts
#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub list_max_keys: i32,
    pub allowed_rif_type: Option<RifFileType>,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        IngestConfig::default().extraction_options()
    }
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub scratch_dir: PathBuf,
    pub max_concurrent_transfers: usize,
    pub retry: RetryPolicy,
}

impl TransferOptions {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            ..IngestConfig::default().transfer_options()
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub poll_interval: Duration,
    pub min_bytes_for_prefetch: u64,
    pub idempotent: bool,
    pub run_interval: Option<Duration>,
    /// Deliver data sets but never relocate them
    pub dry_run: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        IngestConfig::default().job_options()
    }
}
