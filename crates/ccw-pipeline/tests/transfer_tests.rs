//! Transfer manager tests
//!
//! Download deduplication, failure replacement, scratch cleanup and the
//! shutdown contract.

mod common;

use anyhow::Result;
use ccw_common::PipelineError;
use ccw_pipeline::ingest::{DataSetManifest, DataSetQueue, ExtractionOptions, RelocationTask};
use ccw_pipeline::storage::InMemoryObjectStore;
use common::{init_tracing, within, DataSetFixture, Harness};
use std::sync::Arc;
use std::time::Duration;

async fn pending_manifest(harness: &Harness) -> Result<DataSetManifest> {
    let mut queue = DataSetQueue::new(Arc::clone(&harness.transfer), ExtractionOptions::default())?;
    queue.update_pending_data_sets().await?;
    queue
        .next_data_set_to_process()
        .ok_or_else(|| anyhow::anyhow!("expected a pending data set"))
}

// ============================================================================
// Downloads
// ============================================================================

#[tokio::test]
async fn test_download_writes_file_to_scratch_dir() -> Result<()> {
    init_tracing();
    let harness = Harness::new(InMemoryObjectStore::new())?;
    let fixture = DataSetFixture::new(1, &["CARRIER"]);
    fixture.put_all(&harness.store);
    let manifest = pending_manifest(&harness).await?;

    let handle = harness.transfer.download_async(&manifest, &manifest.entries()[0])?;
    let file = within(handle.wait()).await??;

    assert_eq!(file.key, fixture.entry_key("carrier.rif"));
    assert!(file.path.starts_with(harness.transfer.scratch_dir()));
    assert_eq!(std::fs::read_to_string(&file.path)?, fixture.content_of("carrier.rif"));
    assert_eq!(file.size, fixture.content_of("carrier.rif").len() as u64);
    assert!(handle.is_complete());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_requests_share_one_download() -> Result<()> {
    init_tracing();
    let harness = Harness::new(InMemoryObjectStore::new().with_download_delay(Duration::from_millis(50)))?;
    let fixture = DataSetFixture::new(1, &["PDE"]);
    fixture.put_all(&harness.store);
    let manifest = pending_manifest(&harness).await?;
    let entry = &manifest.entries()[0];

    let first = harness.transfer.download_async(&manifest, entry)?;
    let second = harness.transfer.download_async(&manifest, entry)?;
    assert_eq!(first.path(), second.path());

    let (a, b) = within(futures::future::join(first.wait(), second.wait())).await?;
    assert_eq!(a?, b?);

    // Asking again after completion reuses the finished download
    let third = harness.transfer.download_async(&manifest, entry)?;
    assert_eq!(third.path(), first.path());
    assert_eq!(harness.store.download_count(&fixture.entry_key("pde.rif")), 1);
    Ok(())
}

#[tokio::test]
async fn test_transient_download_failures_are_retried() -> Result<()> {
    init_tracing();
    let harness = Harness::new(InMemoryObjectStore::new())?;
    let fixture = DataSetFixture::new(1, &["SNF"]);
    fixture.put_all(&harness.store);
    harness.store.fail_next(fixture.entry_key("snf.rif"), 2);
    let manifest = pending_manifest(&harness).await?;

    let handle = harness.transfer.download_async(&manifest, &manifest.entries()[0])?;
    within(handle.wait()).await??;

    assert_eq!(harness.store.download_count(&fixture.entry_key("snf.rif")), 3);
    Ok(())
}

#[tokio::test]
async fn test_failed_download_is_replaced_on_next_request() -> Result<()> {
    init_tracing();
    let harness = Harness::new(InMemoryObjectStore::new())?;
    let fixture = DataSetFixture::new(1, &["HHA"]);
    fixture.put_all(&harness.store);
    // More failures than the retry policy allows
    harness.store.fail_next(fixture.entry_key("hha.rif"), 3);
    let manifest = pending_manifest(&harness).await?;
    let entry = &manifest.entries()[0];

    let failed = harness.transfer.download_async(&manifest, entry)?;
    let result = within(failed.wait()).await?;
    assert!(matches!(result, Err(PipelineError::Download { .. })));

    let retried = harness.transfer.download_async(&manifest, entry)?;
    assert_ne!(retried.path(), failed.path());
    let file = within(retried.wait()).await??;
    assert_eq!(std::fs::read_to_string(&file.path)?, fixture.content_of("hha.rif"));
    Ok(())
}

#[tokio::test]
async fn test_release_removes_local_copy() -> Result<()> {
    init_tracing();
    let harness = Harness::new(InMemoryObjectStore::new())?;
    let fixture = DataSetFixture::new(1, &["DME"]);
    fixture.put_all(&harness.store);
    let manifest = pending_manifest(&harness).await?;
    let entry = &manifest.entries()[0];

    let handle = harness.transfer.download_async(&manifest, entry)?;
    let file = within(handle.wait()).await??;
    assert!(file.path.exists());

    harness.transfer.release_download(&handle).await?;
    assert!(!file.path.exists());
    assert!(harness.scratch_files().is_empty());

    // Released downloads are fetched again when asked for
    let again = harness.transfer.download_async(&manifest, entry)?;
    assert_ne!(again.path(), handle.path());
    within(again.wait()).await??;
    assert_eq!(harness.store.download_count(&fixture.entry_key("dme.rif")), 2);
    Ok(())
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_no_new_work_after_shutdown() -> Result<()> {
    init_tracing();
    let harness = Harness::new(InMemoryObjectStore::new())?;
    let fixture = DataSetFixture::new(1, &["INPATIENT"]);
    fixture.put_all(&harness.store);
    let manifest = pending_manifest(&harness).await?;

    harness.transfer.shutdown_safely().await;

    assert!(matches!(
        harness.transfer.download_async(&manifest, &manifest.entries()[0]),
        Err(PipelineError::ShutDown)
    ));
    assert!(matches!(
        harness.transfer.submit(RelocationTask::new(manifest)),
        Err(PipelineError::ShutDown)
    ));
    // Nothing moved
    assert!(harness.store.contains(&fixture.manifest_key()));
    Ok(())
}

#[tokio::test]
async fn test_shutdown_waits_for_submitted_relocations() -> Result<()> {
    init_tracing();
    let harness = Harness::new(InMemoryObjectStore::new())?;
    let fixture = DataSetFixture::new(1, &["OUTPATIENT", "CARRIER"]);
    fixture.put_all(&harness.store);
    let manifest = pending_manifest(&harness).await?;

    harness.transfer.submit(RelocationTask::new(manifest))?;
    within(harness.transfer.shutdown_safely()).await?;

    assert!(harness.store.keys_with_prefix("Incoming/").is_empty());
    assert!(harness.store.contains(&fixture.relocated_key("Done", &fixture.manifest_file_name())));
    for name in fixture.entry_names() {
        assert!(harness.store.contains(&fixture.relocated_key("Done", &name)));
    }
    Ok(())
}

#[tokio::test]
async fn test_shutdown_removes_unreleased_downloads() -> Result<()> {
    init_tracing();
    let harness = Harness::new(InMemoryObjectStore::new())?;
    let fixture = DataSetFixture::new(1, &["BENEFICIARY", "PDE"]);
    fixture.put_all(&harness.store);
    let manifest = pending_manifest(&harness).await?;

    for entry in manifest.entries() {
        harness.transfer.download_async(&manifest, entry)?;
    }
    within(harness.transfer.shutdown_safely()).await?;

    assert!(harness.scratch_files().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_shutdown_twice_is_harmless() -> Result<()> {
    init_tracing();
    let harness = Harness::new(InMemoryObjectStore::new())?;

    within(harness.transfer.shutdown_safely()).await?;
    within(harness.transfer.shutdown_safely()).await?;

    assert!(harness.transfer.is_shut_down());
    Ok(())
}
