//! Listener that only logs what it receives

use super::events::{DataSetListener, RifFilesEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Waits for every file of a data set and logs what arrived. Loads nothing.
///
/// Used by the binary for dry runs against a real bucket.
#[derive(Debug, Default)]
pub struct LoggingListener {
    data_sets: AtomicU64,
}

impl LoggingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_sets_seen(&self) -> u64 {
        self.data_sets.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DataSetListener for LoggingListener {
    async fn data_available(&self, event: &RifFilesEvent) -> anyhow::Result<()> {
        let mut total_bytes = 0;
        for file in &event.files {
            let downloaded = file.wait().await?;
            total_bytes += downloaded.size;
            info!(
                manifest = %event.manifest_id,
                file = %file.name(),
                rif_type = %file.rif_type(),
                bytes = downloaded.size,
                "RIF file ready"
            );
        }

        self.data_sets.fetch_add(1, Ordering::Relaxed);
        info!(
            manifest = %event.manifest_id,
            files = event.files.len(),
            bytes = total_bytes,
            "Data set received"
        );
        Ok(())
    }

    fn no_data_available(&self) {
        info!("No data available");
    }
}
