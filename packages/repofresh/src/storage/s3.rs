use std::path::Path;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_sdk_s3::config::BehaviorVersion;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Endpoint override, mainly for pointing the driver at a test double.
static ENDPOINT_URL: LazyLock<Option<String>> =
    LazyLock::new(|| std::env::var("S3_ENDPOINT_URL").ok());

/// When unset, cache invalidation is a no-op.
static DISTRIBUTION_ID: LazyLock<Option<String>> =
    LazyLock::new(|| std::env::var("CLOUDFRONT_DISTRIBUTION_ID").ok());

const SAME_CALLER_REFERENCE: &str = "Your request contains a caller reference that was used for a \
     previous invalidation batch for the same distribution";

pub(super) struct S3Backend {
    client: aws_sdk_s3::Client,
    cloudfront: Option<(aws_sdk_cloudfront::Client, String)>,
    bucket: String,
}

impl S3Backend {
    pub(super) async fn connect(bucket: String) -> Self {
        let base = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base);
        if let Some(endpoint) = ENDPOINT_URL.as_deref() {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        let cloudfront = DISTRIBUTION_ID
            .clone()
            .map(|id| (aws_sdk_cloudfront::Client::new(&base), id));
        S3Backend {
            client,
            cloudfront,
            bucket,
        }
    }

    pub(super) async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(Error::storage)?;
        Ok(())
    }

    pub(super) async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let missing = matches!(
                    &err,
                    SdkError::ServiceError(context) if context.err().is_no_such_key()
                );
                if missing {
                    Error::PackageNotFound(key.to_string())
                } else {
                    Error::storage(err)
                }
            })?;
        let data = response.body.collect().await.map_err(Error::storage)?;
        Ok(data.into_bytes().to_vec())
    }

    pub(super) async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let body = ByteStream::from_path(source).await.map_err(Error::storage)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(Error::storage)?;
        Ok(())
    }

    pub(super) async fn remove(&self, key: &str) -> Result<()> {
        // Delete only when the key exists, so re-driving an event produced
        // by the deletion itself stays a no-op.
        if !self.exists(key).await? {
            return Ok(());
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(Error::storage)?;
        Ok(())
    }

    pub(super) async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let missing = matches!(
                    &err,
                    SdkError::ServiceError(context) if context.err().is_not_found()
                );
                if missing {
                    Ok(false)
                } else {
                    Err(Error::storage(err))
                }
            }
        }
    }

    pub(super) async fn invalidate_cache(&self, keys: Vec<String>) -> Result<()> {
        use aws_sdk_cloudfront::error::ProvideErrorMetadata as _;
        use aws_sdk_cloudfront::types::{InvalidationBatch, Paths};

        let Some((client, distribution_id)) = &self.cloudfront else {
            debug!("no CDN distribution configured, skipping invalidation");
            return Ok(());
        };

        let items: Vec<String> = keys.iter().map(|key| format!("/{key}")).collect();
        let caller_reference = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string();
        loop {
            let paths = Paths::builder()
                .quantity(items.len() as i32)
                .set_items(Some(items.clone()))
                .build()
                .map_err(Error::storage)?;
            let batch = InvalidationBatch::builder()
                .paths(paths)
                .caller_reference(caller_reference.clone())
                .build()
                .map_err(Error::storage)?;
            let result = client
                .create_invalidation()
                .distribution_id(distribution_id)
                .invalidation_batch(batch)
                .send()
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(err) => {
                    let code = err.code().map(str::to_string);
                    let message = err.message().map(str::to_string).unwrap_or_default();
                    match code.as_deref() {
                        Some("Throttling") => {
                            warn!("invalidation request throttled, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        Some("InvalidationBatchAlreadyExists") => return Ok(()),
                        Some("InvalidArgument") if message.contains(SAME_CALLER_REFERENCE) => {
                            return Ok(());
                        }
                        _ => return Err(Error::storage(err)),
                    }
                }
            }
        }
    }
}
