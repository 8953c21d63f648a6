//! facegrid-aws — AWS implementations of the facegrid service traits.
//!
//! | Trait | Adapter | Service |
//! |---|---|---|
//! | `BlobStore` | [`S3BlobStore`] | S3, one bucket |
//! | `QueueService` | [`SqsQueue`] | SQS standard queue |
//! | `InstanceProvider` | [`Ec2Fleet`] | EC2, filtered by `Name` tag |
//!
//! All adapters share one `SdkConfig` built by [`load_sdk_config`].
//! SDK errors are flattened into `PipelineError` strings with their full
//! source chain so they can be logged by the loops.

pub mod ec2;
pub mod s3;
pub mod sqs;

pub use ec2::Ec2Fleet;
pub use s3::S3BlobStore;
pub use sqs::SqsQueue;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use facegrid_core::config::AwsConfig;
use tracing::debug;

/// Build the shared SDK configuration (credentials from the default chain).
pub async fn load_sdk_config(aws: &AwsConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(aws.region.clone()));
    if let Some(endpoint_url) = &aws.endpoint_url {
        debug!(%endpoint_url, "using custom AWS endpoint");
        loader = loader.endpoint_url(endpoint_url);
    }
    loader.load().await
}
