//! In-memory at-least-once queue.
//!
//! Received messages move to an in-flight set keyed by receipt handle.
//! They leave it either by `delete` or by their visibility timeout lapsing,
//! in which case they become visible again and the old receipt is void.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{PipelineError, PipelineResult};
use crate::memory::lock;
use crate::service::QueueService;
use crate::types::{ReceiptHandle, ReceivedMessage};

/// Visibility timeout used by `MemoryQueue::new`.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

struct InFlight {
    body: String,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<String>,
    in_flight: HashMap<String, InFlight>,
}

impl QueueState {
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, msg)| msg.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(msg) = self.in_flight.remove(&receipt) {
                trace!(%receipt, "visibility timeout lapsed, message visible again");
                self.visible.push_back(msg.body);
            }
        }
    }

    fn take_visible(&mut self, max: usize, visible_at: Instant) -> Vec<ReceivedMessage> {
        let count = max.min(self.visible.len());
        let mut batch = Vec::with_capacity(count);

        for body in self.visible.drain(..count) {
            let receipt = uuid::Uuid::new_v4().to_string();
            self.in_flight.insert(
                receipt.clone(),
                InFlight {
                    body: body.clone(),
                    visible_at,
                },
            );
            batch.push(ReceivedMessage {
                body,
                receipt: ReceiptHandle(receipt),
            });
        }
        batch
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|msg| msg.visible_at).min()
    }
}

pub struct MemoryQueue {
    name: String,
    visibility_timeout: Duration,
    state: Mutex<QueueState>,
    arrivals: Notify,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    /// An empty queue with the default visibility timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_visibility_timeout(name, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            state: Mutex::new(QueueState::default()),
            arrivals: Notify::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages waiting to be received.
    pub fn visible_len(&self) -> usize {
        let mut state = lock(&self.state);
        state.requeue_expired(Instant::now());
        state.visible.len()
    }

    /// Messages received but neither deleted nor expired.
    pub fn in_flight_len(&self) -> usize {
        let mut state = lock(&self.state);
        state.requeue_expired(Instant::now());
        state.in_flight.len()
    }

    /// Bodies of the visible messages, oldest first.
    pub fn visible_bodies(&self) -> Vec<String> {
        let mut state = lock(&self.state);
        state.requeue_expired(Instant::now());
        state.visible.iter().cloned().collect()
    }

    fn check_available(&self) -> PipelineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::Queue(format!("{}: queue unavailable", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueService for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: &str) -> PipelineResult<()> {
        self.check_available()?;
        lock(&self.state).visible.push_back(body.to_string());
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> PipelineResult<Vec<ReceivedMessage>> {
        self.check_available()?;
        let deadline = Instant::now() + wait;
        let max = max_messages.max(1) as usize;

        loop {
            // Register for wakeups before inspecting the queue so a send
            // landing in between is not missed.
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let wake_at = {
                let mut state = lock(&self.state);
                let now = Instant::now();
                state.requeue_expired(now);

                let batch = state.take_visible(max, now + self.visibility_timeout);
                if !batch.is_empty() {
                    return Ok(batch);
                }
                if now >= deadline {
                    return Ok(Vec::new());
                }
                state
                    .next_expiry()
                    .map_or(deadline, |expiry| expiry.min(deadline))
            };

            let _ = tokio::time::timeout_at(wake_at, arrival).await;
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> PipelineResult<()> {
        self.check_available()?;
        let mut state = lock(&self.state);
        state.requeue_expired(Instant::now());
        match state.in_flight.remove(&receipt.0) {
            Some(_) => Ok(()),
            None => Err(PipelineError::Queue(format!(
                "{}: unknown receipt handle {receipt}",
                self.name
            ))),
        }
    }

    async fn approximate_depth(&self) -> PipelineResult<u64> {
        self.check_available()?;
        Ok(self.visible_len() as u64)
    }
}
