use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use facegrid_core::config::WorkerConfig;
use facegrid_core::{
    BlobStore, JobId, PipelineResult, QueueService, ReceivedMessage, Recognition, Recognizer,
    RequestMessage, ResponseMessage,
};

/// What happened to one received request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing arrived within the long-poll window.
    Idle,
    /// Result published and the request deleted.
    Completed(ResponseMessage),
    /// Input missing or unrecognizable; the request was deleted and no
    /// response sent.
    Abandoned { job_id: JobId, reason: String },
}

pub struct Worker {
    requests: Arc<dyn QueueService>,
    responses: Arc<dyn QueueService>,
    inputs: Arc<dyn BlobStore>,
    outputs: Arc<dyn BlobStore>,
    recognizer: Arc<dyn Recognizer>,
    receive_wait: Duration,
    idle_pause: Duration,
    error_pause: Duration,
}

impl Worker {
    pub fn new(
        requests: Arc<dyn QueueService>,
        responses: Arc<dyn QueueService>,
        inputs: Arc<dyn BlobStore>,
        outputs: Arc<dyn BlobStore>,
        recognizer: Arc<dyn Recognizer>,
        settings: &WorkerConfig,
    ) -> Self {
        Self {
            requests,
            responses,
            inputs,
            outputs,
            recognizer,
            receive_wait: settings.receive_wait,
            idle_pause: settings.idle_pause,
            error_pause: settings.error_pause,
        }
    }

    /// Receive at most one request and process it.
    pub async fn poll_once(&self) -> PipelineResult<Outcome> {
        let received = self.receive_one().await?;
        Ok(self.handle(received).await)
    }

    async fn receive_one(&self) -> PipelineResult<Option<ReceivedMessage>> {
        let mut received = self.requests.receive(1, self.receive_wait).await?;
        Ok(received.pop())
    }

    async fn handle(&self, received: Option<ReceivedMessage>) -> Outcome {
        match received {
            Some(message) => self.process(message).await,
            None => Outcome::Idle,
        }
    }

    /// Run one request through fetch → recognize → publish → delete.
    pub async fn process(&self, message: ReceivedMessage) -> Outcome {
        let request = RequestMessage::from_body(&message.body);
        let job_id = request.job_id();
        info!(%job_id, filename = %request.filename, "processing job");

        let image = match self.inputs.get(&request.filename).await {
            Ok(image) => image,
            Err(e) => {
                error!(%job_id, filename = %request.filename, error = %e, "failed to fetch input, abandoning job");
                self.delete_request(&message, &job_id).await;
                return Outcome::Abandoned {
                    job_id,
                    reason: e.to_string(),
                };
            }
        };

        let recognition = match self.recognize(image).await {
            Ok(recognition) => recognition,
            Err(reason) => {
                warn!(%job_id, %reason, "recognition failed, abandoning job");
                self.delete_request(&message, &job_id).await;
                return Outcome::Abandoned { job_id, reason };
            }
        };
        debug!(%job_id, label = %recognition.label, distance = recognition.distance, "recognized");

        let label = recognition.label;
        match self
            .outputs
            .put(&job_id, Bytes::from(label.clone()))
            .await
        {
            Ok(()) => debug!(%job_id, "stored result"),
            Err(e) => error!(%job_id, error = %e, "failed to store result"),
        }

        let response = ResponseMessage::new(job_id.clone(), label);
        match self.responses.send(&response.body()).await {
            Ok(()) => info!(%response, "sent response"),
            Err(e) => error!(%job_id, error = %e, "failed to send response"),
        }

        self.delete_request(&message, &job_id).await;
        Outcome::Completed(response)
    }

    /// Inference is CPU-bound, so it runs off the async executor. A panic
    /// inside the recognizer counts as a failed recognition.
    async fn recognize(&self, image: Bytes) -> Result<Recognition, String> {
        let recognizer = self.recognizer.clone();
        match tokio::task::spawn_blocking(move || recognizer.recognize(&image)).await {
            Ok(Ok(recognition)) => Ok(recognition),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("recognizer panicked: {e}")),
        }
    }

    async fn delete_request(&self, message: &ReceivedMessage, job_id: &str) {
        match self.requests.delete(&message.receipt).await {
            Ok(()) => debug!(%job_id, "deleted request"),
            Err(e) => error!(%job_id, error = %e, "failed to delete request"),
        }
    }

    /// Poll until shutdown. Shutdown interrupts the long-poll but never a
    /// job that is already being processed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.requests.name(), "worker started");

        let mut ticker = interval(self.idle_pause);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let received = tokio::select! {
                received = self.receive_one() => received,
                _ = shutdown.changed() => break,
            };

            match received {
                Ok(received) => {
                    self.handle(received).await;
                }
                Err(e) => {
                    error!(error = %e, "failed to receive requests");
                    tokio::select! {
                        _ = tokio::time::sleep(self.error_pause) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!("worker shutting down");
    }
}
