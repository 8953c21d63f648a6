//! Response drainer — moves results from the response queue into the
//! correlation table.
//!
//! Every received message is deleted after it is looked at, whether or not
//! it parsed. Delete failures are logged and left to the queue's own
//! redelivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use facegrid_core::config::GatewayConfig;
use facegrid_core::{PipelineResult, QueueService, ReceivedMessage, ResponseMessage};

use crate::correlation::CorrelationTable;

/// Counters from one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub received: usize,
    pub stored: usize,
    pub malformed: usize,
    pub delete_failures: usize,
    pub evicted: usize,
}

pub struct ResponseDrainer {
    responses: Arc<dyn QueueService>,
    results: Arc<CorrelationTable>,
    batch: u32,
    wait: Duration,
    pause: Duration,
    result_ttl: Duration,
}

impl ResponseDrainer {
    /// Batch size, long-poll wait, pause and TTL come from `settings`.
    pub fn new(
        responses: Arc<dyn QueueService>,
        results: Arc<CorrelationTable>,
        settings: &GatewayConfig,
    ) -> Self {
        Self {
            responses,
            results,
            batch: settings.drain_batch,
            wait: settings.drain_wait,
            pause: settings.drain_pause,
            result_ttl: settings.result_ttl,
        }
    }

    /// Receive one batch, store what parses, delete everything received,
    /// then evict stale results.
    pub async fn drain_once(&self) -> PipelineResult<DrainStats> {
        let messages = self.responses.receive(self.batch, self.wait).await?;
        Ok(self.settle(messages).await)
    }

    async fn settle(&self, messages: Vec<ReceivedMessage>) -> DrainStats {
        let mut stats = DrainStats {
            received: messages.len(),
            ..DrainStats::default()
        };

        for message in messages {
            match ResponseMessage::parse(&message.body) {
                Some(response) => {
                    info!(job_id = %response.job_id, label = %response.label, "result stored");
                    if self.results.insert(response.job_id, response.label).is_some() {
                        debug!("duplicate result replaced an unclaimed entry");
                    }
                    stats.stored += 1;
                }
                None => {
                    warn!(body = %message.body, "malformed response message dropped");
                    stats.malformed += 1;
                }
            }

            if let Err(e) = self.responses.delete(&message.receipt).await {
                error!(queue = %self.responses.name(), error = %e, "failed to delete response message");
                stats.delete_failures += 1;
            }
        }

        stats.evicted = self.results.evict_older_than(self.result_ttl);
        if stats.evicted > 0 {
            warn!(count = stats.evicted, "evicted unclaimed results");
        }
        stats
    }

    /// Drain until shutdown. Shutdown cuts a long-poll short; a batch
    /// already received is always settled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.responses.name(), batch = self.batch, "response drainer started");

        let mut ticker = tokio::time::interval(self.pause);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let received = tokio::select! {
                received = self.responses.receive(self.batch, self.wait) => received,
                _ = shutdown.changed() => break,
            };

            match received {
                Ok(messages) => {
                    let stats = self.settle(messages).await;
                    if stats.received > 0 {
                        debug!(
                            received = stats.received,
                            stored = stats.stored,
                            malformed = stats.malformed,
                            pending = self.results.len(),
                            "drain pass complete"
                        );
                    }
                }
                Err(e) => error!(error = %e, "response queue poll failed"),
            }
        }

        info!("response drainer shutting down");
    }
}

#[cfg(test)]
mod tests {
    use facegrid_core::memory::MemoryQueue;

    use super::*;

    fn drainer(queue: Arc<MemoryQueue>, table: Arc<CorrelationTable>) -> ResponseDrainer {
        let settings = GatewayConfig {
            drain_wait: Duration::ZERO,
            result_ttl: Duration::from_secs(300),
            ..GatewayConfig::default()
        };
        ResponseDrainer::new(queue, table, &settings)
    }

    #[tokio::test(start_paused = true)]
    async fn stores_results_and_deletes_messages() {
        let queue = Arc::new(MemoryQueue::new("resp"));
        let table = Arc::new(CorrelationTable::new());
        queue.send("photo:alice").await.unwrap();
        queue.send("test_01:bob").await.unwrap();

        let stats = drainer(queue.clone(), table.clone()).drain_once().await.unwrap();

        assert_eq!(stats.received, 2);
        assert_eq!(stats.stored, 2);
        assert_eq!(table.take("photo").as_deref(), Some("alice"));
        assert_eq!(table.take("test_01").as_deref(), Some("bob"));
        assert_eq!(queue.visible_len(), 0);
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_message_is_deleted_without_insert() {
        let queue = Arc::new(MemoryQueue::new("resp"));
        let table = Arc::new(CorrelationTable::new());
        queue.send("garbage").await.unwrap();

        let stats = drainer(queue.clone(), table.clone()).drain_once().await.unwrap();

        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.stored, 0);
        assert!(table.is_empty());
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn label_may_contain_separator() {
        let queue = Arc::new(MemoryQueue::new("resp"));
        let table = Arc::new(CorrelationTable::new());
        queue.send("photo:mr:smith").await.unwrap();

        drainer(queue, table.clone()).drain_once().await.unwrap();
        assert_eq!(table.take("photo").as_deref(), Some("mr:smith"));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_failure_is_reported() {
        let queue = Arc::new(MemoryQueue::new("resp"));
        queue.set_unavailable(true);
        let table = Arc::new(CorrelationTable::new());

        assert!(drainer(queue, table).drain_once().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_results_are_evicted() {
        let queue = Arc::new(MemoryQueue::new("resp"));
        let table = Arc::new(CorrelationTable::new());
        table.insert("abandoned", "alice");
        tokio::time::advance(Duration::from_secs(301)).await;

        let stats = drainer(queue, table.clone()).drain_once().await.unwrap();
        assert_eq!(stats.evicted, 1);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_until_shutdown() {
        let queue = Arc::new(MemoryQueue::new("resp"));
        let table = Arc::new(CorrelationTable::new());
        let drainer = Arc::new(drainer(queue.clone(), table.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let drainer = drainer.clone();
            async move { drainer.run(shutdown_rx).await }
        });

        queue.send("photo:alice").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(table.contains("photo"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_long_poll() {
        let queue = Arc::new(MemoryQueue::new("resp"));
        let table = Arc::new(CorrelationTable::new());
        let settings = GatewayConfig {
            drain_wait: Duration::from_secs(20),
            ..GatewayConfig::default()
        };
        let drainer = ResponseDrainer::new(queue, table, &settings);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { drainer.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = tokio::time::Instant::now();
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("drainer kept long-polling after shutdown")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
