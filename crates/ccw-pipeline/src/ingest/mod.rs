//! CCW RIF data set ingestion
//!
//! The data provider uploads batches of RIF files ("data sets") into the
//! bucket under `Incoming/` (or `Synthetic/Incoming/` for synthetic data),
//! each described by a `<sequence>_manifest.xml`. [`DataSetLoadJob`] finds
//! the oldest complete data set, hands it to a [`DataSetListener`] and moves
//! its objects to `Done/` (or `Synthetic/Done/`, `Synthetic/Failed/`).
//!
//! Two independent mechanisms keep a data set from being loaded twice: the
//! [`DataSetQueue`] remembers recently processed data sets in memory, and the
//! relocation removes the objects from the incoming prefix for good.

pub mod config;
pub mod events;
pub mod job;
pub mod listener;
pub mod manifest;
pub mod prevalidation;
pub mod queue;
pub mod relocation;
pub mod scheduler;
pub mod scratch;
pub mod transfer;

pub use config::{ExtractionOptions, IngestConfig, JobOptions, TransferOptions};
pub use events::{
    DataSetListener, PreValidator, RifFile, RifFilesEvent, StatusReporter, TracingStatusReporter,
};
pub use job::{DataSetLoadJob, JobOutcome, JobState};
pub use listener::LoggingListener;
pub use manifest::{
    DataSetManifest, DataSetManifestEntry, DataSetManifestId, ManifestKeyMatcher, ManifestLocation,
    RifFileType,
};
pub use prevalidation::PropertiesPreValidator;
pub use queue::DataSetQueue;
pub use relocation::{RelocationReport, RelocationTask};
pub use scheduler::JobScheduler;
pub use scratch::{FsScratchSpace, ScratchSpace};
pub use transfer::{DownloadHandle, DownloadedFile, TransferManager};
