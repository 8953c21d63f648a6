//! SQS-backed queue.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::QueueAttributeName;
use tracing::{debug, warn};

use facegrid_core::{PipelineError, PipelineResult, QueueService, ReceiptHandle, ReceivedMessage};

/// SQS accepts at most 10 messages per receive.
pub const MAX_BATCH: u32 = 10;

/// SQS long polls for at most 20 seconds.
pub const MAX_WAIT: Duration = Duration::from_secs(20);

pub struct SqsQueue {
    client: Client,
    name: String,
    url: String,
}

impl SqsQueue {
    /// Connect to a queue given its name or full URL.
    pub async fn connect(sdk_config: &SdkConfig, name_or_url: &str) -> PipelineResult<Self> {
        let client = Client::new(sdk_config);
        if is_queue_url(name_or_url) {
            return Ok(Self::with_client(client, queue_name_from_url(name_or_url), name_or_url));
        }

        let output = client
            .get_queue_url()
            .queue_name(name_or_url)
            .send()
            .await
            .map_err(|e| {
                PipelineError::Queue(format!(
                    "resolve queue {name_or_url}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        let url = output
            .queue_url()
            .ok_or_else(|| PipelineError::Queue(format!("queue {name_or_url} has no URL")))?;
        debug!(queue = %name_or_url, %url, "queue resolved");
        Ok(Self::with_client(client, name_or_url, url))
    }

    pub fn with_client(client: Client, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
            url: url.into(),
        }
    }

    /// Resolved queue URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn err(&self, op: &str, e: impl std::error::Error) -> PipelineError {
        PipelineError::Queue(format!("{op} on {}: {}", self.name, DisplayErrorContext(e)))
    }
}

#[async_trait]
impl QueueService for SqsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: &str) -> PipelineResult<()> {
        self.client
            .send_message()
            .queue_url(&self.url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| self.err("send_message", e))?;
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> PipelineResult<Vec<ReceivedMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(clamp_batch(max_messages))
            .wait_time_seconds(clamp_wait(wait))
            .send()
            .await
            .map_err(|e| self.err("receive_message", e))?;

        let mut received = Vec::with_capacity(output.messages().len());
        for message in output.messages() {
            match (message.body(), message.receipt_handle()) {
                (Some(body), Some(receipt)) => received.push(ReceivedMessage {
                    body: body.to_string(),
                    receipt: ReceiptHandle(receipt.to_string()),
                }),
                _ => warn!(
                    queue = %self.name,
                    message_id = ?message.message_id(),
                    "message without body or receipt handle skipped"
                ),
            }
        }
        Ok(received)
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> PipelineResult<()> {
        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(&receipt.0)
            .send()
            .await
            .map_err(|e| self.err("delete_message", e))?;
        Ok(())
    }

    async fn approximate_depth(&self) -> PipelineResult<u64> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| self.err("get_queue_attributes", e))?;

        let raw = output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages));
        match raw {
            Some(value) => value.parse().map_err(|_| {
                PipelineError::Queue(format!(
                    "{}: unparseable ApproximateNumberOfMessages {value:?}",
                    self.name
                ))
            }),
            None => Ok(0),
        }
    }
}

fn is_queue_url(s: &str) -> bool {
    s.starts_with("https://") || s.starts_with("http://")
}

fn queue_name_from_url(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}

fn clamp_batch(max_messages: u32) -> i32 {
    max_messages.clamp(1, MAX_BATCH) as i32
}

fn clamp_wait(wait: Duration) -> i32 {
    wait.min(MAX_WAIT).as_secs() as i32
}
