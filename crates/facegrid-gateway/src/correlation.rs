//! Correlation table — job id to label, bridging asynchronous results to
//! blocked HTTP requests.
//!
//! The drainer inserts, request handlers `take`. `take` removes under the
//! lock, so a result is claimed by at most one caller.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use facegrid_core::JobId;

struct PendingResult {
    label: String,
    arrived_at: Instant,
}

#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<JobId, PendingResult>>,
}

impl CorrelationTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, PendingResult>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a result. Returns the label it replaced, if any.
    pub fn insert(&self, job_id: impl Into<JobId>, label: impl Into<String>) -> Option<String> {
        let entry = PendingResult {
            label: label.into(),
            arrived_at: Instant::now(),
        };
        self.lock()
            .insert(job_id.into(), entry)
            .map(|previous| previous.label)
    }

    /// Remove and return the result for `job_id`.
    pub fn take(&self, job_id: &str) -> Option<String> {
        self.lock().remove(job_id).map(|entry| entry.label)
    }

    /// Whether a result for `job_id` is waiting to be claimed.
    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    /// Number of unclaimed results.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop results nobody claimed within `ttl`. Returns how many were dropped.
    pub fn evict_older_than(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.arrived_at) < ttl);
        before - entries.len()
    }

    /// Poll for `job_id` every `poll_interval` until it shows up or `window`
    /// elapses.
    ///
    /// The first check happens immediately and one last check happens at
    /// the deadline, so a result that landed inside the window is never
    /// left behind.
    pub async fn wait_for(
        &self,
        job_id: &str,
        poll_interval: Duration,
        window: Duration,
    ) -> Option<String> {
        let poll = async {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Some(label) = self.take(job_id) {
                    return label;
                }
            }
        };

        match tokio::time::timeout(window, poll).await {
            Ok(label) => Some(label),
            Err(_) => self.take(job_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn take_removes_the_entry() {
        let table = CorrelationTable::new();
        assert_eq!(table.insert("photo", "alice"), None);
        assert!(table.contains("photo"));

        assert_eq!(table.take("photo").as_deref(), Some("alice"));
        assert_eq!(table.take("photo"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn take_leaves_other_jobs_alone() {
        let table = CorrelationTable::new();
        table.insert("a", "alice");
        table.insert("b", "bob");

        assert_eq!(table.take("a").as_deref(), Some("alice"));
        assert!(table.contains("b"));
    }

    #[test]
    fn duplicate_result_replaces_label() {
        let table = CorrelationTable::new();
        table.insert("photo", "alice");
        assert_eq!(table.insert("photo", "alice").as_deref(), Some("alice"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_takers_claim_once() {
        let table = Arc::new(CorrelationTable::new());
        table.insert("photo", "alice");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || table.take("photo"))
            })
            .collect();
        let claimed = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();

        assert_eq!(claimed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_drops_only_stale_entries() {
        let table = CorrelationTable::new();
        table.insert("old", "alice");
        tokio::time::advance(Duration::from_secs(120)).await;
        table.insert("fresh", "bob");

        assert_eq!(table.evict_older_than(Duration::from_secs(60)), 1);
        assert!(!table.contains("old"));
        assert!(table.contains("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_returns_result_inserted_later() {
        let table = Arc::new(CorrelationTable::new());
        let inserter = {
            let table = table.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                table.insert("photo", "alice");
            }
        };

        let started = Instant::now();
        let (label, ()) = tokio::join!(
            table.wait_for("photo", Duration::from_millis(500), Duration::from_secs(60)),
            inserter
        );

        assert_eq!(label.as_deref(), Some("alice"));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_times_out() {
        let table = CorrelationTable::new();
        let started = Instant::now();

        let label = table
            .wait_for("photo", Duration::from_millis(500), Duration::from_secs(60))
            .await;

        assert_eq!(label, None);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(!table.contains("photo"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_stays_unclaimed_after_timeout() {
        let table = CorrelationTable::new();
        let label = table
            .wait_for("photo", Duration::from_millis(500), Duration::from_secs(1))
            .await;
        assert_eq!(label, None);

        table.insert("photo", "alice");
        assert!(table.contains("photo"));
    }
}
