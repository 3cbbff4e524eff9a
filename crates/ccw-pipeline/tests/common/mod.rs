//! Shared fixtures for the pipeline integration tests
//!
//! Everything runs against [`InMemoryObjectStore`]; data sets are seeded with
//! the same key layout the data provider uses.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use ccw_pipeline::ingest::{
    DataSetListener, DataSetLoadJob, DataSetManifest, DataSetManifestId, ExtractionOptions,
    JobOptions, PreValidator, RifFilesEvent, ScratchSpace, StatusReporter, TransferManager,
    TransferOptions,
};
use ccw_pipeline::storage::{InMemoryObjectStore, RetryPolicy};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ccw_pipeline=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Timestamp folder for day `day` of January 2024
pub fn ts(day: u32) -> String {
    format!("2024-01-{:02}T10:00:00Z", day)
}

pub fn incoming_prefix(synthetic: bool) -> &'static str {
    if synthetic {
        "Synthetic/Incoming"
    } else {
        "Incoming"
    }
}

pub fn manifest_key(synthetic: bool, timestamp: &str, sequence: u32) -> String {
    format!("{}/{}/{}_manifest.xml", incoming_prefix(synthetic), timestamp, sequence)
}

pub fn manifest_xml(
    timestamp: &str,
    sequence: u32,
    synthetic: bool,
    entries: &[(&str, &str)],
    properties: &[(&str, &str)],
) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<dataSetManifest xmlns="http://cms.hhs.gov/bluebutton/api/schema/ccw-rif/v9" timestamp="{}" sequenceId="{}" syntheticData="{}">
"#,
        timestamp, sequence, synthetic
    );
    for (name, rif_type) in entries {
        xml.push_str(&format!("  <entry name=\"{}\" type=\"{}\"/>\n", name, rif_type));
    }
    if !properties.is_empty() {
        xml.push_str("  <preValidationProperties>\n");
        for (key, value) in properties {
            xml.push_str(&format!("    <{0}>{1}</{0}>\n", key, value));
        }
        xml.push_str("  </preValidationProperties>\n");
    }
    xml.push_str("</dataSetManifest>\n");
    xml
}

/// A data set the way the data provider uploads it
#[derive(Debug, Clone)]
pub struct DataSetFixture {
    pub synthetic: bool,
    pub timestamp: String,
    pub sequence: u32,
    pub entries: Vec<(String, String)>,
    pub properties: Vec<(String, String)>,
}

impl DataSetFixture {
    /// Production data set with one file per type
    pub fn new(day: u32, types: &[&str]) -> Self {
        Self {
            synthetic: false,
            timestamp: ts(day),
            sequence: 0,
            entries: types
                .iter()
                .map(|t| (format!("{}.rif", t.to_lowercase()), t.to_string()))
                .collect(),
            properties: Vec::new(),
        }
    }

    pub fn synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    pub fn sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.push((key.to_string(), value.to_string()));
        self
    }

    pub fn manifest_key(&self) -> String {
        manifest_key(self.synthetic, &self.timestamp, self.sequence)
    }

    pub fn entry_key(&self, name: &str) -> String {
        format!("{}/{}/{}", incoming_prefix(self.synthetic), self.timestamp, name)
    }

    /// Key of `name` after relocation to `location` (e.g. "Done", "Synthetic/Failed")
    pub fn relocated_key(&self, location: &str, name: &str) -> String {
        format!("{}/{}/{}", location, self.timestamp, name)
    }

    pub fn manifest_file_name(&self) -> String {
        format!("{}_manifest.xml", self.sequence)
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn id(&self) -> DataSetManifestId {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default();
        DataSetManifestId {
            timestamp,
            sequence_id: self.sequence,
            synthetic: self.synthetic,
        }
    }

    pub fn content_of(&self, name: &str) -> String {
        format!("{} rows for {}", name, self.timestamp)
    }

    pub fn put_manifest(&self, store: &InMemoryObjectStore) {
        let entries: Vec<(&str, &str)> = self.entries.iter().map(|(n, t)| (n.as_str(), t.as_str())).collect();
        let properties: Vec<(&str, &str)> =
            self.properties.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        store.put(
            self.manifest_key(),
            manifest_xml(&self.timestamp, self.sequence, self.synthetic, &entries, &properties),
        );
    }

    pub fn put_entry(&self, store: &InMemoryObjectStore, name: &str) {
        store.put(self.entry_key(name), self.content_of(name));
    }

    /// Upload manifest and every data file
    pub fn put_all(&self, store: &InMemoryObjectStore) {
        self.put_manifest(store);
        for name in self.entry_names() {
            self.put_entry(store, &name);
        }
    }
}

/// What the listener saw for one data set
#[derive(Debug, Clone)]
pub struct DeliveredDataSet {
    pub manifest_id: DataSetManifestId,
    pub timestamp: DateTime<Utc>,
    pub synthetic: bool,
    pub file_names: Vec<String>,
    pub contents: Vec<String>,
}

#[derive(Default)]
pub struct RecordingListener {
    delivered: Mutex<Vec<DeliveredDataSet>>,
    no_data_calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` deliveries after reading the files
    pub fn fail_next(&self, times: usize) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<DeliveredDataSet> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn delivered_ids(&self) -> Vec<DataSetManifestId> {
        self.delivered().iter().map(|d| d.manifest_id).collect()
    }

    pub fn no_data_calls(&self) -> usize {
        self.no_data_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSetListener for RecordingListener {
    async fn data_available(&self, event: &RifFilesEvent) -> anyhow::Result<()> {
        let mut contents = Vec::new();
        for file in &event.files {
            let downloaded = file.wait().await?;
            contents.push(tokio::fs::read_to_string(&downloaded.path).await?);
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("loader rejected data set {}", event.manifest_id);
        }

        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push(DeliveredDataSet {
                manifest_id: event.manifest_id,
                timestamp: event.timestamp,
                synthetic: event.synthetic,
                file_names: event.file_names().into_iter().map(str::to_string).collect(),
                contents,
            });
        }
        Ok(())
    }

    fn no_data_available(&self) {
        self.no_data_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reports a fixed amount of free scratch space
pub struct FixedScratchSpace(pub u64);

impl ScratchSpace for FixedScratchSpace {
    fn usable_bytes(&self) -> std::io::Result<u64> {
        Ok(self.0)
    }
}

/// Pre-validator with a fixed answer that counts its calls
pub struct FixedPreValidator {
    valid: bool,
    calls: AtomicUsize,
}

impl FixedPreValidator {
    pub fn new(valid: bool) -> Self {
        Self {
            valid,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PreValidator for FixedPreValidator {
    async fn is_valid(&self, _manifest: &DataSetManifest) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.valid)
    }
}

#[derive(Default)]
pub struct RecordingStatusReporter {
    events: Mutex<Vec<String>>,
}

impl RecordingStatusReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn record(&self, event: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl StatusReporter for RecordingStatusReporter {
    fn checking_bucket_for_manifest(&self) {
        self.record("checking".to_string());
    }

    fn awaiting_manifest_data(&self, manifest: &DataSetManifest) {
        self.record(format!("awaiting {}", manifest.id()));
    }

    fn processing_manifest_data(&self, manifest: &DataSetManifest) {
        self.record(format!("processing {}", manifest.id()));
    }

    fn completed_manifest(&self, manifest: &DataSetManifest) {
        self.record(format!("completed {}", manifest.id()));
    }

    fn nothing_to_do(&self) {
        self.record("nothing to do".to_string());
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

pub fn fast_job_options() -> JobOptions {
    JobOptions {
        poll_interval: Duration::from_millis(10),
        min_bytes_for_prefetch: 1024,
        idempotent: false,
        run_interval: None,
        dry_run: false,
    }
}

/// Store, transfer manager and listener wired together
pub struct Harness {
    pub store: Arc<InMemoryObjectStore>,
    pub transfer: Arc<TransferManager>,
    pub listener: Arc<RecordingListener>,
    pub scratch: TempDir,
}

impl Harness {
    pub fn new(store: InMemoryObjectStore) -> Result<Self> {
        let scratch = tempfile::tempdir()?;
        let store = Arc::new(store);
        let mut options = TransferOptions::new(scratch.path().join("downloads"));
        options.retry = fast_retry();
        options.max_concurrent_transfers = 4;
        let transfer = Arc::new(TransferManager::new(store.clone(), options));

        Ok(Self {
            store,
            transfer,
            listener: Arc::new(RecordingListener::new()),
            scratch,
        })
    }

    pub fn job(&self, options: JobOptions) -> Result<DataSetLoadJob> {
        let job = DataSetLoadJob::new(
            Arc::clone(&self.transfer),
            self.listener.clone(),
            ExtractionOptions::default(),
            options,
        )?
        .with_scratch_space(Arc::new(FixedScratchSpace(u64::MAX)));
        Ok(job)
    }

    /// Files currently in the scratch directory
    pub fn scratch_files(&self) -> Vec<String> {
        std::fs::read_dir(self.scratch.path().join("downloads"))
            .map(|dir| {
                dir.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Poll `condition` until it holds, failing after five seconds
pub async fn wait_until<F>(description: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timed out waiting for {}", description);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Fail the test if `future` does not finish within five seconds
pub async fn within<T>(future: impl Future<Output = T>) -> Result<T> {
    Ok(tokio::time::timeout(Duration::from_secs(5), future).await?)
}
