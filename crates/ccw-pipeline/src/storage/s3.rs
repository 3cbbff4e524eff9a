use super::{ListPage, ObjectStore, ObjectSummary, StorageConfig};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    Client,
};
use ccw_common::{PipelineError, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// Error codes S3 uses for throttling and server-side hiccups
const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];

const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NotFound"];

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PipelineError::Config(format!("{:#}", e)))?;
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing S3 object store");

        let mut builder = match config.static_credentials() {
            Some((access_key, secret_key)) => {
                let credentials = Credentials::new(access_key, secret_key, None, None, "ccw-pipeline");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            None => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!("Object store initialized for bucket: {}", config.bucket);

        Ok(Self::from_client(client, config.bucket))
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn copy_source(&self, source_key: &str) -> String {
        format!("{}/{}", self.bucket, urlencoding::encode(source_key))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn list_page(
        &self,
        prefix: &str,
        max_keys: i32,
        continuation_token: Option<String>,
    ) -> Result<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(max_keys)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(|e| classify(e, &format!("list s3://{}/{}", self.bucket, prefix)))?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|key| ObjectSummary {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj
                        .last_modified()
                        .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())),
                })
            })
            .collect::<Vec<_>>();

        let next_continuation_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        debug!(count = objects.len(), more = next_continuation_token.is_some(), "Listed page");

        Ok(ListPage {
            objects,
            next_continuation_token,
        })
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, &format!("get s3://{}/{}", self.bucket, key)))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| PipelineError::TransientStore(format!("reading body of {}: {}", key, e)))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);
        Ok(data)
    }

    #[instrument(skip(self, path), fields(path = %path.display()))]
    async fn download_to(&self, key: &str, path: &Path) -> Result<u64> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, &format!("download s3://{}/{}", self.bucket, key)))?;

        let mut body = response.body;
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;

        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| PipelineError::TransientStore(format!("streaming {}: {}", key, e)))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(bytes = written, "Download finished");
        Ok(written)
    }

    #[instrument(skip(self))]
    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(self.copy_source(source_key))
            .key(dest_key)
            .send()
            .await
            .map_err(|e| classify(e, &format!("copy {} to {}", source_key, dest_key)))?;

        debug!("Copied s3://{}/{} to {}", self.bucket, source_key, dest_key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, &format!("delete s3://{}/{}", self.bucket, key)))?;

        debug!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, &format!("head s3://{}/{}", self.bucket, key)) {
                PipelineError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}

fn classify<E>(err: SdkError<E>, context: &str) -> PipelineError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|raw| {
        let status_u16: u16 = raw.status().into();
        status_u16
    });
    let message = format!("{}: {}", context, DisplayErrorContext(&err));

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            PipelineError::TransientStore(message)
        },
        SdkError::ServiceError(_) => classify_service_error(err.code(), status, message),
        _ => PipelineError::FatalStore(message),
    }
}

fn classify_service_error(code: Option<&str>, status: Option<u16>, message: String) -> PipelineError {
    if code.is_some_and(|c| NOT_FOUND_CODES.contains(&c)) || status == Some(404) {
        return PipelineError::NotFound(message);
    }
    if code.is_some_and(|c| TRANSIENT_CODES.contains(&c))
        || status.is_some_and(|s| s == 429 || s >= 500)
    {
        return PipelineError::TransientStore(message);
    }
    PipelineError::FatalStore(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> S3ObjectStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(crate::storage::config::DEFAULT_REGION))
            .build();
        S3ObjectStore::from_client(Client::from_conf(config), "ccw-bucket")
    }

    #[test]
    fn test_copy_source_is_url_encoded() {
        let source = store().copy_source("Incoming/2024-01-18T10:00:00Z/0_manifest.xml");
        assert_eq!(
            source,
            "ccw-bucket/Incoming%2F2024-01-18T10%3A00%3A00Z%2F0_manifest.xml"
        );
    }

    #[test]
    fn test_missing_keys_are_not_found() {
        let err = classify_service_error(Some("NoSuchKey"), Some(404), "get".into());
        assert!(err.is_not_found());

        let err = classify_service_error(None, Some(404), "head".into());
        assert!(err.is_not_found());
    }

    #[test]
    fn test_throttling_and_server_errors_are_transient() {
        assert!(classify_service_error(Some("SlowDown"), Some(503), "list".into()).is_transient());
        assert!(classify_service_error(None, Some(429), "list".into()).is_transient());
        assert!(classify_service_error(None, Some(500), "copy".into()).is_transient());
    }

    #[test]
    fn test_access_denied_is_fatal() {
        let err = classify_service_error(Some("AccessDenied"), Some(403), "copy".into());
        assert!(matches!(err, PipelineError::FatalStore(_)));
    }
}
