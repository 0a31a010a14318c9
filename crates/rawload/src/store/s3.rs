//! S3 object source

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    Client,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use super::{with_timeout, ObjectSource};
use crate::config::StorageConfig;
use crate::error::{Endpoint, LoadError, Result};

/// Service error codes meaning the bucket cannot be reached with these credentials
const ACCESS_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "NoSuchBucket",
    "PermanentRedirect",
];

#[derive(Clone)]
pub struct S3ObjectSource {
    client: Client,
    bucket: String,
    prefix: String,
    timeout: Duration,
}

impl std::fmt::Debug for S3ObjectSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectSource")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl S3ObjectSource {
    pub fn new(config: &StorageConfig) -> Self {
        debug!("Initializing object source with config: {:?}", config);

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "rawload",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Object source initialized for s3://{}/{}", config.bucket, config.prefix);

        Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl ObjectSource for S3ObjectSource {
    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    fn key_for(&self, object_name: &str) -> String {
        format!("{}{}", self.prefix, object_name)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, prefix = %self.prefix))]
    async fn list_keys(&self) -> Result<Vec<String>> {
        with_timeout(Endpoint::ObjectStore, "list objects", self.timeout, async {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .into_paginator()
                .send();

            let mut keys = Vec::new();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| sdk_error("list objects", e))?;
                keys.extend(
                    page.contents()
                        .iter()
                        .filter_map(|obj| obj.key().map(|k| k.to_string())),
                );
            }

            debug!("Listed {} objects in {}", keys.len(), self.location());
            Ok(keys)
        })
        .await
    }

    #[instrument(skip(self, dest))]
    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        with_timeout(Endpoint::ObjectStore, "download", self.timeout, async {
            debug!("Downloading s3://{}/{}", self.bucket, key);

            let response = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| sdk_error("get object", e))?;

            let mut body = response.body;
            let mut file = tokio::fs::File::create(dest).await?;
            let mut written = 0u64;
            while let Some(bytes) = body.try_next().await.map_err(|e| {
                LoadError::connectivity(
                    Endpoint::ObjectStore,
                    format!("reading s3://{}/{}: {}", self.bucket, key, e),
                )
            })? {
                file.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }
            file.flush().await?;

            debug!("Downloaded {} bytes from s3://{}/{}", written, self.bucket, key);
            Ok(written)
        })
        .await
    }
}

fn sdk_error<E>(operation: &str, err: SdkError<E>) -> LoadError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{} failed: {}", operation, DisplayErrorContext(&err));
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            LoadError::connectivity(Endpoint::ObjectStore, message)
        },
        SdkError::ServiceError(service)
            if service
                .err()
                .code()
                .is_some_and(|code| ACCESS_ERROR_CODES.contains(&code)) =>
        {
            LoadError::connectivity(Endpoint::ObjectStore, message)
        },
        _ => LoadError::ObjectStore(message),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_relative_to_prefix() {
        let source = S3ObjectSource::new(&StorageConfig::for_minio("http://localhost:9000", "olist"));
        assert_eq!(source.location(), "s3://olist/raw/");
        assert_eq!(
            source.key_for("olist_orders_dataset.csv"),
            "raw/olist_orders_dataset.csv"
        );
    }

    #[test]
    fn test_debug_hides_client() {
        let source = S3ObjectSource::new(&StorageConfig::for_minio("http://localhost:9000", "olist"));
        let debug = format!("{:?}", source);
        assert!(debug.contains("olist"));
        assert!(!debug.contains("minioadmin"));
    }
}
