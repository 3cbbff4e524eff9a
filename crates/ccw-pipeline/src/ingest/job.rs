//! The data set load job
//!
//! Each [`DataSetLoadJob::call`] processes at most one data set:
//!
//! 1. refresh the queue and pick the oldest pending data set
//! 2. wait until every file the manifest lists has been uploaded
//! 3. pre-validate synthetic data sets that carry pre-validation properties
//! 4. hand the files to the [`DataSetListener`] and wait for it to finish,
//!    downloading the next data set early if there is room for it
//! 5. mark the data set processed and submit its relocation
//!
//! In dry-run mode step 5 only marks the data set processed; its objects
//! stay under the incoming prefix.
//!
//! The listener is awaited inline so two data sets are never loaded at the
//! same time. A started invocation is not cancellable because relocations
//! cannot be resumed halfway.

use super::config::{ExtractionOptions, JobOptions};
use super::events::{
    DataSetListener, PreValidator, RifFile, RifFilesEvent, StatusReporter, TracingStatusReporter,
};
use super::manifest::{DataSetManifest, DataSetManifestId, ManifestLocation};
use super::queue::DataSetQueue;
use super::relocation::RelocationTask;
use super::scratch::{FsScratchSpace, ScratchSpace};
use super::transfer::TransferManager;
use ccw_common::{PipelineError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const LOG_MESSAGE_NO_DATA_SETS: &str = "No data sets to process found.";
pub const LOG_MESSAGE_DATA_SET_READY: &str = "Data set ready. Processing it...";
pub const LOG_MESSAGE_DATA_SET_COMPLETE: &str = "Data set processing complete.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    NothingToDo,
    WorkDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Scanning,
    Waiting(DataSetManifestId),
    Validating(DataSetManifestId),
    Delivering(DataSetManifestId),
    Relocating(DataSetManifestId),
}

pub struct DataSetLoadJob {
    queue: DataSetQueue,
    transfer: Arc<TransferManager>,
    listener: Arc<dyn DataSetListener>,
    pre_validator: Option<Arc<dyn PreValidator>>,
    status: Arc<dyn StatusReporter>,
    scratch: Arc<dyn ScratchSpace>,
    options: JobOptions,
    list_max_keys: i32,
    state: watch::Sender<JobState>,
    /// Data set whose downloads were started early
    prefetched: Option<DataSetManifest>,
}

impl DataSetLoadJob {
    pub fn new(
        transfer: Arc<TransferManager>,
        listener: Arc<dyn DataSetListener>,
        extraction: ExtractionOptions,
        options: JobOptions,
    ) -> Result<Self> {
        let list_max_keys = extraction.list_max_keys;
        let scratch = Arc::new(FsScratchSpace::new(transfer.scratch_dir()));
        let (state, _) = watch::channel(JobState::Idle);

        Ok(Self {
            queue: DataSetQueue::new(Arc::clone(&transfer), extraction)?,
            transfer,
            listener,
            pre_validator: None,
            status: Arc::new(TracingStatusReporter),
            scratch,
            options,
            list_max_keys,
            state,
            prefetched: None,
        })
    }

    pub fn with_pre_validator(mut self, pre_validator: Arc<dyn PreValidator>) -> Self {
        self.pre_validator = Some(pre_validator);
        self
    }

    pub fn with_status_reporter(mut self, status: Arc<dyn StatusReporter>) -> Self {
        self.status = status;
        self
    }

    pub fn with_scratch_space(mut self, scratch: Arc<dyn ScratchSpace>) -> Self {
        self.scratch = scratch;
        self
    }

    /// Interval between runs, `None` to run once
    pub fn schedule(&self) -> Option<Duration> {
        self.options.run_interval
    }

    pub fn is_interruptible(&self) -> bool {
        false
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Follow state changes from another task
    pub fn subscribe_state(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    pub fn queue(&self) -> &DataSetQueue {
        &self.queue
    }

    fn set_state(&self, state: JobState) {
        self.state.send_replace(state);
    }

    pub async fn call(&mut self) -> Result<JobOutcome> {
        let outcome = self.process_next_data_set().await;
        self.set_state(JobState::Idle);
        outcome
    }

    async fn process_next_data_set(&mut self) -> Result<JobOutcome> {
        debug!("Scanning for data sets to process...");
        self.set_state(JobState::Scanning);
        self.status.checking_bucket_for_manifest();
        self.queue.update_pending_data_sets().await?;
        self.release_stale_prefetch().await;

        let Some(mut manifest) = self.queue.next_data_set_to_process() else {
            debug!("{}", LOG_MESSAGE_NO_DATA_SETS);
            self.listener.no_data_available();
            self.status.nothing_to_do();
            return Ok(JobOutcome::NothingToDo);
        };
        let id = manifest.id();

        info!(
            manifest = %id,
            pending = self.queue.pending_manifests_count(),
            completed = self.queue.completed_manifests_count().unwrap_or(0),
            "Found data set to process"
        );

        self.set_state(JobState::Waiting(id));
        self.wait_until_available(&manifest).await?;
        info!(manifest = %id, synthetic = manifest.is_synthetic(), "{}", LOG_MESSAGE_DATA_SET_READY);

        self.set_state(JobState::Validating(id));
        if self.pre_validate(&manifest).await? {
            self.set_state(JobState::Delivering(id));
            self.deliver(&manifest).await?;
        } else {
            warn!(
                manifest = %id,
                target = %ManifestLocation::FailedSynthetic,
                "Data set failed pre-validation, it will not be loaded"
            );
            manifest.redirect_to_failed();
            self.transfer.release_data_set(&manifest).await;
        }
        if self.prefetched.as_ref().is_some_and(|p| p.id() == id) {
            self.prefetched = None;
        }

        self.set_state(JobState::Relocating(id));
        self.queue.mark_processed(&manifest);
        if self.options.dry_run {
            info!(manifest = %id, "Dry run, leaving data set in place");
        } else {
            self.transfer.submit(RelocationTask::new(manifest))?;
        }

        Ok(JobOutcome::WorkDone)
    }

    /// Drop the downloads of a prefetched data set that is no longer pending
    async fn release_stale_prefetch(&mut self) {
        let Some(prefetched) = self.prefetched.take() else {
            return;
        };
        if self.queue.is_pending(&prefetched.id()) {
            self.prefetched = Some(prefetched);
            return;
        }

        debug!(manifest = %prefetched.id(), "Prefetched data set left the queue");
        self.transfer.release_data_set(&prefetched).await;
    }

    /// Poll until every entry is listed. There is no timeout.
    async fn wait_until_available(&self, manifest: &DataSetManifest) -> Result<()> {
        self.status.awaiting_manifest_data(manifest);
        let mut logged = false;

        while !self.is_available(manifest).await? {
            if !logged {
                info!(manifest = %manifest.id(), "Data set not ready. Waiting for it to finish uploading...");
                logged = true;
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
        Ok(())
    }

    async fn is_available(&self, manifest: &DataSetManifest) -> Result<bool> {
        let prefix = manifest.key_prefix();
        let listed = self.transfer.list_keys(&prefix, self.list_max_keys).await?;

        for entry in manifest.entries() {
            if !listed.contains(&manifest.incoming_key(&entry.name)) {
                debug!(manifest = %manifest.id(), file = %entry.name, "Waiting for file");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn pre_validate(&self, manifest: &DataSetManifest) -> Result<bool> {
        if manifest.pre_validation_properties().is_none() {
            return Ok(true);
        }
        if self.options.idempotent {
            info!(manifest = %manifest.id(), "Idempotent mode, skipping pre-validation");
            return Ok(true);
        }
        if !manifest.is_synthetic() {
            return Ok(true);
        }

        let Some(validator) = &self.pre_validator else {
            warn!(manifest = %manifest.id(), "Data set has pre-validation properties but no pre-validator is configured");
            return Ok(true);
        };

        info!(manifest = %manifest.id(), "Pre-validating synthetic data set");
        validator
            .is_valid(manifest)
            .await
            .map_err(PipelineError::PreValidation)
    }

    async fn deliver(&mut self, manifest: &DataSetManifest) -> Result<()> {
        let files = manifest
            .entries()
            .iter()
            .map(|entry| {
                Ok(RifFile {
                    entry: entry.clone(),
                    key: manifest.incoming_key(&entry.name),
                    download: self.transfer.download_async(manifest, entry)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let event = RifFilesEvent {
            manifest_id: manifest.id(),
            timestamp: manifest.timestamp(),
            synthetic: manifest.is_synthetic(),
            files,
        };

        if let Some(second) = self.prefetch_second_data_set().await {
            self.prefetched = Some(second);
        }

        self.status.processing_manifest_data(manifest);
        let delivered = self
            .listener
            .data_available(&event)
            .await
            .map_err(PipelineError::Listener);

        for file in &event.files {
            if let Err(e) = self.transfer.release_download(&file.download).await {
                warn!(file = %file.name(), error = %e, "Failed to release download");
            }
        }
        delivered?;

        self.status.completed_manifest(manifest);
        info!(manifest = %manifest.id(), "{}", LOG_MESSAGE_DATA_SET_COMPLETE);
        Ok(())
    }

    /// Start downloading the next data set while the current one loads.
    /// Skipped quietly whenever it cannot be done.
    async fn prefetch_second_data_set(&self) -> Option<DataSetManifest> {
        let second = self.queue.second_data_set_to_process()?;

        match self.is_available(&second).await {
            Ok(true) => {},
            Ok(false) => {
                debug!(manifest = %second.id(), "Next data set still uploading, not prefetching");
                return None;
            },
            Err(e) => {
                debug!(manifest = %second.id(), error = %e, "Could not check next data set");
                return None;
            },
        }

        match self.scratch.usable_bytes() {
            Ok(free) if free >= self.options.min_bytes_for_prefetch => {},
            Ok(free) => {
                debug!(
                    free_bytes = free,
                    required_bytes = self.options.min_bytes_for_prefetch,
                    "Not enough scratch space to prefetch"
                );
                return None;
            },
            Err(e) => {
                debug!(error = %e, "Could not read free scratch space");
                return None;
            },
        }

        info!(manifest = %second.id(), "Prefetching next data set");
        for entry in second.entries() {
            if let Err(e) = self.transfer.download_async(&second, entry) {
                debug!(file = %entry.name, error = %e, "Prefetch stopped");
                break;
            }
        }
        Some(second)
    }

    /// Shut down the transfer manager, waiting for pending relocations
    pub async fn close(&self) {
        self.transfer.shutdown_safely().await;
    }
}
