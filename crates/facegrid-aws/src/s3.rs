//! S3-backed blob store.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tracing::debug;

use facegrid_core::{BlobStore, PipelineError, PipelineResult};

pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    /// Custom endpoints (LocalStack, MinIO) get path-style addressing.
    pub fn new(sdk_config: &SdkConfig, bucket: impl Into<String>) -> Self {
        let config = aws_sdk_s3::config::Builder::from(sdk_config)
            .force_path_style(sdk_config.endpoint_url().is_some())
            .build();
        Self::with_client(Client::from_conf(config), bucket)
    }

    pub fn with_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Bucket every key is read from and written to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, data: Bytes) -> PipelineResult<()> {
        let len = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                PipelineError::Blob(format!(
                    "put s3://{}/{key}: {}",
                    self.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;
        debug!(bucket = %self.bucket, %key, bytes = len, "object stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> PipelineResult<Bytes> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(sdk_error) => {
                let err = sdk_error.into_service_error();
                if err.is_no_such_key() {
                    return Err(PipelineError::BlobNotFound(format!("s3://{}/{key}", self.bucket)));
                }
                return Err(PipelineError::Blob(format!(
                    "get s3://{}/{key}: {}",
                    self.bucket,
                    DisplayErrorContext(&err)
                )));
            }
        };

        let data = output.body.collect().await.map_err(|e| {
            PipelineError::Blob(format!(
                "read body of s3://{}/{key}: {}",
                self.bucket,
                DisplayErrorContext(&e)
            ))
        })?;
        Ok(data.into_bytes())
    }
}
