//! Error types for the CCW pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for the pipeline
///
/// Pre-validation rejecting a data set is not an error; it is the `false`
/// result of the pre-validator and only changes where the data set is moved.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed manifest '{key}': {reason}")]
    MalformedManifest { key: String, reason: String },

    /// Timeouts, throttling and 5xx responses. Retried inside the transfer manager.
    #[error("Transient object store error: {0}")]
    TransientStore(String),

    /// Permissions, bad keys, misconfiguration. Never retried.
    #[error("Object store error: {0}")]
    FatalStore(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Download of '{key}' failed: {message}")]
    Download { key: String, message: String },

    #[error("Transfer manager has been shut down")]
    ShutDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pre-validation failed to run: {0:#}")]
    PreValidation(anyhow::Error),

    #[error("Data set listener failed: {0:#}")]
    Listener(anyhow::Error),
}

impl PipelineError {
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::MalformedManifest {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientStore(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PipelineError::NotFound(_))
    }
}
