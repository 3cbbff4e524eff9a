//! Configuration management

use crate::ingest::IngestConfig;
use crate::storage::StorageConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
}

impl Config {
    /// Load configuration from `.env` and the environment
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            storage: StorageConfig::from_env().context("Invalid storage configuration")?,
            ingest: IngestConfig::from_env().context("Invalid ingest configuration")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.storage.validate()?;
        self.ingest.validate()?;

        if self.storage.endpoint.is_some() && !self.storage.path_style {
            tracing::warn!("Custom S3 endpoint without path-style addressing; MinIO usually needs S3_PATH_STYLE=true");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minio_config_validates() {
        let config = Config {
            storage: StorageConfig::for_minio("http://localhost:9000", "ccw-test"),
            ingest: IngestConfig::default(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_ingest_settings_fail_validation() {
        let config = Config {
            storage: StorageConfig::for_minio("http://localhost:9000", "ccw-test"),
            ingest: IngestConfig {
                list_max_keys: 0,
                ..IngestConfig::default()
            },
        };
        assert!(config.validate().is_err());
    }
}
