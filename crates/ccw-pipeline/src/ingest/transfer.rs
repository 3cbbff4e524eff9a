//! Transfer manager
//!
//! All object store traffic of the pipeline goes through [`TransferManager`]:
//! listings, manifest reads, background downloads into the scratch directory
//! and relocation tasks. Downloads and relocations share one bounded pool;
//! transient store failures are retried here and never reach the caller
//! unless the retries run out.

use super::config::TransferOptions;
use super::manifest::{DataSetManifest, DataSetManifestEntry};
use super::relocation::RelocationTask;
use crate::storage::{with_retry, ObjectStore, ObjectSummary, RetryPolicy};
use ccw_common::{PipelineError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// A finished download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
}

type SharedDownload = Shared<BoxFuture<'static, std::result::Result<DownloadedFile, String>>>;

/// Handle to a download running in the background. Clones share the same transfer.
#[derive(Clone)]
pub struct DownloadHandle {
    key: String,
    path: PathBuf,
    inner: SharedDownload,
}

impl DownloadHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Where the file is (or will be) written
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn wait(&self) -> Result<DownloadedFile> {
        self.inner.clone().await.map_err(|message| PipelineError::Download {
            key: self.key.clone(),
            message,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.inner.peek().is_some()
    }

    fn has_failed(&self) -> bool {
        matches!(self.inner.peek(), Some(Err(_)))
    }

    fn same_transfer(&self, other: &DownloadHandle) -> bool {
        self.path == other.path
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[derive(Default)]
struct TransferState {
    closed: bool,
    downloads: HashMap<String, DownloadHandle>,
}

pub struct TransferManager {
    store: Arc<dyn ObjectStore>,
    options: TransferOptions,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    state: Mutex<TransferState>,
}

impl TransferManager {
    pub fn new(store: Arc<dyn ObjectStore>, options: TransferOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent_transfers.max(1)));
        Self {
            store,
            options,
            permits,
            tracker: TaskTracker::new(),
            state: Mutex::new(TransferState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.options.retry
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.options.scratch_dir
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().closed
    }

    /// Lazily list everything under `prefix`, one page of at most `max_keys` at a time
    pub fn list_objects(&self, prefix: &str, max_keys: i32) -> BoxStream<'static, Result<ObjectSummary>> {
        let store = Arc::clone(&self.store);
        let retry = self.options.retry;
        let prefix = prefix.to_string();

        stream::try_unfold(Some(None::<String>), move |next_page| {
            let store = Arc::clone(&store);
            let prefix = prefix.clone();
            async move {
                let Some(token) = next_page else {
                    return Ok(None);
                };
                let page = with_retry(&retry, "list objects", || {
                    store.list_page(&prefix, max_keys, token.clone())
                })
                .await?;
                debug!(prefix = %prefix, count = page.objects.len(), "Fetched listing page");

                let following = page.next_continuation_token.map(Some);
                let objects = stream::iter(page.objects.into_iter().map(Ok::<_, PipelineError>));
                Ok::<_, PipelineError>(Some((objects, following)))
            }
        })
        .try_flatten()
        .boxed()
    }

    /// All keys under `prefix`
    pub async fn list_keys(&self, prefix: &str, max_keys: i32) -> Result<HashSet<String>> {
        self.list_objects(prefix, max_keys)
            .map_ok(|summary| summary.key)
            .try_collect()
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        with_retry(&self.options.retry, "get object", || self.store.get(key)).await
    }

    /// Start downloading `entry` of `manifest` in the background.
    ///
    /// Returns the existing handle if that object is already downloading or
    /// downloaded; a failed earlier attempt is replaced by a fresh one.
    pub fn download_async(
        &self,
        manifest: &DataSetManifest,
        entry: &DataSetManifestEntry,
    ) -> Result<DownloadHandle> {
        let key = manifest.incoming_key(&entry.name);
        let mut state = self.state();
        if state.closed {
            return Err(PipelineError::ShutDown);
        }

        if let Some(existing) = state.downloads.get(&key) {
            if !existing.has_failed() {
                debug!(key = %key, "Download already started");
                return Ok(existing.clone());
            }
            warn!(key = %key, "Previous download failed, starting over");
        }

        let path = self.options.scratch_dir.join(format!(
            "{}-{}",
            Uuid::new_v4(),
            entry.name.replace('/', "_")
        ));
        let handle = self.spawn_download(key.clone(), path);
        state.downloads.insert(key, handle.clone());
        Ok(handle)
    }

    fn spawn_download(&self, key: String, path: PathBuf) -> DownloadHandle {
        let store = Arc::clone(&self.store);
        let permits = Arc::clone(&self.permits);
        let retry = self.options.retry;
        let scratch_dir = self.options.scratch_dir.clone();
        let task_key = key.clone();
        let task_path = path.clone();

        let task = self.tracker.spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| PipelineError::ShutDown)?;
            tokio::fs::create_dir_all(&scratch_dir).await?;

            let size = with_retry(&retry, "download object", || {
                store.download_to(&task_key, &task_path)
            })
            .await?;
            debug!(key = %task_key, bytes = size, "Download complete");

            Ok::<_, PipelineError>(DownloadedFile {
                key: task_key,
                path: task_path,
                size,
            })
        });

        let inner = async move {
            match task.await {
                Ok(Ok(file)) => Ok(file),
                Ok(Err(e)) => Err(e.to_string()),
                Err(join_error) => Err(format!("download task ended abnormally: {}", join_error)),
            }
        }
        .boxed()
        .shared();

        DownloadHandle { key, path, inner }
    }

    /// Forget a delivered download and delete its local copy
    pub async fn release_download(&self, handle: &DownloadHandle) -> Result<()> {
        {
            let mut state = self.state();
            if state
                .downloads
                .get(handle.key())
                .is_some_and(|current| current.same_transfer(handle))
            {
                state.downloads.remove(handle.key());
            }
        }

        // Deleting under a running download would leave a partial file behind
        let _ = handle.inner.clone().await;
        remove_scratch_file(handle.path()).await
    }

    /// Forget every download started for `manifest`'s entries and delete the
    /// local copies. Returns how many downloads were released.
    pub async fn release_data_set(&self, manifest: &DataSetManifest) -> usize {
        let handles: Vec<DownloadHandle> = {
            let mut state = self.state();
            manifest
                .entries()
                .iter()
                .filter_map(|entry| state.downloads.remove(&manifest.incoming_key(&entry.name)))
                .collect()
        };

        for handle in &handles {
            let _ = handle.inner.clone().await;
            if let Err(e) = remove_scratch_file(handle.path()).await {
                warn!(path = %handle.path().display(), error = %e, "Failed to remove scratch file");
            }
        }
        if !handles.is_empty() {
            debug!(manifest = %manifest.id(), released = handles.len(), "Released downloads of data set");
        }
        handles.len()
    }

    /// Run `task` on the transfer pool. Returns without waiting for it.
    pub fn submit(&self, task: RelocationTask) -> Result<()> {
        let state = self.state();
        if state.closed {
            return Err(PipelineError::ShutDown);
        }

        let store = Arc::clone(&self.store);
        let permits = Arc::clone(&self.permits);
        let retry = self.options.retry;
        let manifest_id = task.manifest().id();

        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match task.run(store.as_ref(), &retry).await {
                Ok(report) => info!(
                    manifest = %manifest_id,
                    moved = report.moved,
                    already_moved = report.already_moved,
                    "Relocation complete"
                ),
                Err(e) => error!(manifest = %manifest_id, error = %e, "Relocation failed"),
            }
        });
        drop(state);

        Ok(())
    }

    /// Stop accepting work, wait for running downloads and relocations, then
    /// remove leftover scratch files. Safe to call more than once.
    pub async fn shutdown_safely(&self) {
        let first_call = {
            let mut state = self.state();
            !std::mem::replace(&mut state.closed, true)
        };
        if first_call {
            info!(in_flight = self.tracker.len(), "Shutting down transfer manager");
        }

        self.tracker.close();
        self.tracker.wait().await;

        let leftovers: Vec<DownloadHandle> = self.state().downloads.drain().map(|(_, h)| h).collect();
        for handle in leftovers {
            if let Err(e) = remove_scratch_file(handle.path()).await {
                warn!(path = %handle.path().display(), error = %e, "Failed to remove scratch file");
            }
        }

        if first_call {
            info!("Transfer manager shut down");
        }
    }
}

async fn remove_scratch_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
