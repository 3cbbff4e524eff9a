use serde::{Deserialize, Serialize};
use std::env;

/// Default bucket the data provider delivers into
pub const DEFAULT_BUCKET: &str = "ccw-rif-data";

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Custom endpoint for MinIO/LocalStack; `None` talks to AWS
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Static credentials. When absent the default AWS credential chain is used.
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string()),
            bucket: env::var("S3_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.to_string()),
            access_key: env::var("S3_ACCESS_KEY").ok(),
            secret_key: env::var("S3_SECRET_KEY").ok(),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_REGION.to_string(),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bucket.trim().is_empty() {
            anyhow::bail!("S3_BUCKET cannot be empty");
        }
        if self.access_key.is_some() != self.secret_key.is_some() {
            anyhow::bail!("S3_ACCESS_KEY and S3_SECRET_KEY must be set together");
        }
        Ok(())
    }

    /// Static credentials, if both halves are configured
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key, &self.secret_key) {
            (Some(access), Some(secret)) => Some((access.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000", "test-bucket");
        assert_eq!(config.endpoint, Some("http://localhost:9000".to_string()));
        assert_eq!(config.bucket, "test-bucket");
        assert!(config.path_style);
        assert_eq!(config.static_credentials(), Some(("minioadmin", "minioadmin")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_half_configured_credentials_are_rejected() {
        let mut config = StorageConfig::for_minio("http://localhost:9000", "test-bucket");
        config.secret_key = None;
        assert!(config.validate().is_err());
        assert_eq!(config.static_credentials(), None);
    }

    #[test]
    fn test_empty_bucket_is_rejected() {
        let config = StorageConfig::for_minio("http://localhost:9000", " ");
        assert!(config.validate().is_err());
    }
}
