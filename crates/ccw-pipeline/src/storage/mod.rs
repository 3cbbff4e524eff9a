//! Object store access
//!
//! [`ObjectStore`] is the seam between the pipeline and the bucket the data
//! provider writes into. [`s3::S3ObjectStore`] talks to S3 (or MinIO);
//! [`memory::InMemoryObjectStore`] backs tests and local dry runs.
//!
//! Implementations map their failures onto the pipeline taxonomy:
//! [`PipelineError::TransientStore`] for anything worth retrying,
//! [`PipelineError::NotFound`] for missing keys and
//! [`PipelineError::FatalStore`] for everything else.
//!
//! [`PipelineError::TransientStore`]: ccw_common::PipelineError::TransientStore
//! [`PipelineError::NotFound`]: ccw_common::PipelineError::NotFound
//! [`PipelineError::FatalStore`]: ccw_common::PipelineError::FatalStore

use async_trait::async_trait;
use ccw_common::Result;
use chrono::{DateTime, Utc};
use std::path::Path;

pub mod config;
pub mod memory;
pub mod retry;
pub mod s3;

pub use config::StorageConfig;
pub use memory::InMemoryObjectStore;
pub use retry::{with_retry, RetryPolicy};
pub use s3::S3ObjectStore;

/// One object returned by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A single page of a listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    /// Present when more keys remain under the prefix
    pub next_continuation_token: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List at most `max_keys` objects under `prefix`, in key order
    async fn list_page(
        &self,
        prefix: &str,
        max_keys: i32,
        continuation_token: Option<String>,
    ) -> Result<ListPage>;

    /// Read a whole object into memory. Only used for small objects such as manifests.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Stream an object into `path`, replacing any existing file. Returns bytes written.
    async fn download_to(&self, key: &str, path: &Path) -> Result<u64>;

    /// Server-side copy; an existing destination is overwritten
    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}
