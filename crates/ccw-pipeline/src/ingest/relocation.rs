//! Moving a processed data set out of the incoming prefix

use super::manifest::DataSetManifest;
use crate::storage::{with_retry, ObjectStore, RetryPolicy};
use ccw_common::Result;
use tracing::{debug, info, instrument};

/// Outcome of moving one data set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationReport {
    /// Objects copied to the target location by this run
    pub moved: usize,
    /// Objects a previous run had already moved
    pub already_moved: usize,
}

/// Moves a data set's data files and manifest from its incoming location to
/// its target location.
///
/// Everything is copied before anything is deleted. Data files are copied
/// before the manifest, and the manifest is deleted before the data files, so
/// a manifest under the target always has its data next to it and a manifest
/// left under the incoming prefix always still has its data too.
#[derive(Debug, Clone)]
pub struct RelocationTask {
    manifest: DataSetManifest,
}

impl RelocationTask {
    pub fn new(manifest: DataSetManifest) -> Self {
        Self { manifest }
    }

    pub fn manifest(&self) -> &DataSetManifest {
        &self.manifest
    }

    fn object_names(&self) -> Vec<&str> {
        self.manifest
            .entries()
            .iter()
            .map(|e| e.name.as_str())
            .chain(std::iter::once(self.manifest.manifest_file_name()))
            .collect()
    }

    #[instrument(skip_all, fields(manifest = %self.manifest.id(), target = %self.manifest.target_location()))]
    pub async fn run(self, store: &dyn ObjectStore, retry: &RetryPolicy) -> Result<RelocationReport> {
        let mut report = RelocationReport::default();
        let mut to_delete = Vec::new();

        for name in self.object_names() {
            let source = self.manifest.incoming_key(name);
            let dest = self.manifest.target_key(name);

            match with_retry(retry, "copy object", || store.copy(&source, &dest)).await {
                Ok(()) => {
                    debug!(source = %source, dest = %dest, "Copied");
                    report.moved += 1;
                    to_delete.push(source);
                },
                Err(e) if e.is_not_found() => {
                    if !with_retry(retry, "check object", || store.exists(&dest)).await? {
                        return Err(e);
                    }
                    debug!(dest = %dest, "Already relocated");
                    report.already_moved += 1;
                },
                Err(e) => return Err(e),
            }
        }

        for source in to_delete.iter().rev() {
            with_retry(retry, "delete object", || store.delete(source)).await?;
        }

        info!(moved = report.moved, already_moved = report.already_moved, "Data set relocated");
        Ok(report)
    }
}
