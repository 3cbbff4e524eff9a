//! What the job hands to its collaborators

use super::manifest::{DataSetManifest, DataSetManifestEntry, DataSetManifestId, RifFileType};
use super::transfer::{DownloadHandle, DownloadedFile};
use async_trait::async_trait;
use ccw_common::Result;
use chrono::{DateTime, Utc};
use tracing::info;

/// One data file of a delivered data set. The download may still be running.
#[derive(Clone)]
pub struct RifFile {
    pub entry: DataSetManifestEntry,
    /// Object key the file is downloaded from
    pub key: String,
    pub download: DownloadHandle,
}

impl RifFile {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn rif_type(&self) -> RifFileType {
        self.entry.rif_type
    }

    /// Wait until the local copy is complete
    pub async fn wait(&self) -> Result<DownloadedFile> {
        self.download.wait().await
    }
}

/// A complete data set, ready for loading
#[derive(Clone)]
pub struct RifFilesEvent {
    pub manifest_id: DataSetManifestId,
    pub timestamp: DateTime<Utc>,
    pub synthetic: bool,
    pub files: Vec<RifFile>,
}

impl RifFilesEvent {
    pub fn file_names(&self) -> Vec<&str> {
        self.files.iter().map(RifFile::name).collect()
    }
}

/// Loads delivered data sets. Called with at most one data set at a time.
#[async_trait]
pub trait DataSetListener: Send + Sync {
    /// Returns once the data set has been fully loaded
    async fn data_available(&self, event: &RifFilesEvent) -> anyhow::Result<()>;

    fn no_data_available(&self);
}

/// Sanity check for synthetic data sets that carry pre-validation properties
#[async_trait]
pub trait PreValidator: Send + Sync {
    async fn is_valid(&self, manifest: &DataSetManifest) -> anyhow::Result<bool>;
}

/// Progress notifications. Purely observational.
pub trait StatusReporter: Send + Sync {
    fn checking_bucket_for_manifest(&self) {}

    fn awaiting_manifest_data(&self, _manifest: &DataSetManifest) {}

    fn processing_manifest_data(&self, _manifest: &DataSetManifest) {}

    fn completed_manifest(&self, _manifest: &DataSetManifest) {}

    fn nothing_to_do(&self) {}
}

/// Reports status through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusReporter;

impl StatusReporter for TracingStatusReporter {
    fn checking_bucket_for_manifest(&self) {
        info!(status = "checking", "Checking bucket for manifests");
    }

    fn awaiting_manifest_data(&self, manifest: &DataSetManifest) {
        info!(status = "awaiting", manifest = %manifest.id(), "Waiting for data set upload");
    }

    fn processing_manifest_data(&self, manifest: &DataSetManifest) {
        info!(
            status = "processing",
            manifest = %manifest.id(),
            entries = manifest.entries().len(),
            "Processing data set"
        );
    }

    fn completed_manifest(&self, manifest: &DataSetManifest) {
        info!(
            status = "completed",
            manifest = %manifest.id(),
            target = %manifest.target_location(),
            "Data set finished"
        );
    }

    fn nothing_to_do(&self) {
        info!(status = "idle", "Nothing to do");
    }
}
