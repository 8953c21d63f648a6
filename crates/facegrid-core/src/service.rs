//! Service boundaries.
//!
//! Each trait is object safe and used as `Arc<dyn Trait>` so a role can be
//! wired against AWS in production and against `crate::memory` in tests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::PipelineResult;
use crate::types::{Instance, InstanceId, ReceiptHandle, ReceivedMessage, Recognition};

/// An at-least-once message channel with visibility timeouts.
///
/// A received message stays hidden from other receivers until it is
/// deleted or its visibility timeout lapses, after which it is delivered
/// again.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Human-readable queue name, used in log fields.
    fn name(&self) -> &str;

    async fn send(&self, body: &str) -> PipelineResult<()>;

    /// Long-poll for up to `max_messages`, waiting at most `wait`.
    ///
    /// An empty vector is a normal outcome, not an error.
    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> PipelineResult<Vec<ReceivedMessage>>;

    async fn delete(&self, receipt: &ReceiptHandle) -> PipelineResult<()>;

    /// Approximate number of messages currently visible.
    async fn approximate_depth(&self) -> PipelineResult<u64>;
}

/// Key-addressed byte storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous object.
    async fn put(&self, key: &str, data: Bytes) -> PipelineResult<()>;

    /// Fetch the object under `key`. Missing keys yield `PipelineError::BlobNotFound`.
    async fn get(&self, key: &str) -> PipelineResult<Bytes>;
}

/// Lifecycle control over a pool of pre-provisioned instances.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Pool members currently in a controllable state (stopped, pending, running).
    async fn list(&self) -> PipelineResult<Vec<Instance>>;

    async fn start(&self, ids: &[InstanceId]) -> PipelineResult<()>;

    async fn stop(&self, ids: &[InstanceId]) -> PipelineResult<()>;
}

/// The recognition function: image bytes in, label and distance out.
///
/// Synchronous and potentially CPU heavy; async callers should run it on
/// the blocking pool.
pub trait Recognizer: Send + Sync {
    fn recognize(&self, image: &[u8]) -> PipelineResult<Recognition>;
}
