//! Autoscaler — the pure scaling decision and the tick loop that applies it.
//!
//! [`decide`] takes the previous [`ScalerState`] and returns the next one
//! inside its [`Evaluation`], so the grace-period timer is plain data and
//! every decision can be tested without a clock or a cloud.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use facegrid_core::config::AutoscalerConfig;
use facegrid_core::{Instance, InstanceId, InstanceProvider, InstanceState, QueueService};

/// Limits the autoscaler works within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    /// Hard ceiling on active instances.
    pub max_instances: u32,
    /// How long over-provisioning must last before instances are stopped.
    pub grace_period: Duration,
}

impl From<&AutoscalerConfig> for ScalingPolicy {
    fn from(config: &AutoscalerConfig) -> Self {
        Self {
            max_instances: config.max_instances,
            grace_period: config.grace_period,
        }
    }
}

/// Timer state carried from one tick to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalerState {
    /// When the pool was first seen with more active instances than desired.
    pub over_capacity_since: Option<Instant>,
}

/// A lifecycle action for the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Start these stopped instances.
    Start(Vec<InstanceId>),
    /// Stop these active instances.
    Stop(Vec<InstanceId>),
    /// Over capacity, but the grace period has not yet elapsed.
    AwaitGrace { remaining: Duration },
    /// No change needed.
    NoChange,
}

/// Result of one call to [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub desired: u32,
    pub active: usize,
    pub decision: ScaleDecision,
    pub state: ScalerState,
}

/// Decide what to do given queue depth and the current pool.
///
/// Instances that are neither active nor stopped are ignored. Stops are
/// taken from the tail of the active list, starts from the head of the
/// stopped list.
pub fn decide(
    policy: &ScalingPolicy,
    state: ScalerState,
    depth: u64,
    instances: &[Instance],
    now: Instant,
) -> Evaluation {
    let desired = depth.min(u64::from(policy.max_instances)) as u32;
    let target = desired as usize;

    let active: Vec<&Instance> = instances.iter().filter(|i| i.state.is_active()).collect();
    let stopped = instances
        .iter()
        .filter(|i| i.state == InstanceState::Stopped);

    let evaluation = |decision, state| Evaluation {
        desired,
        active: active.len(),
        decision,
        state,
    };

    if active.len() < target {
        let to_start: Vec<InstanceId> = stopped
            .take(target - active.len())
            .map(|i| i.id.clone())
            .collect();
        let decision = if to_start.is_empty() {
            ScaleDecision::NoChange
        } else {
            ScaleDecision::Start(to_start)
        };
        return evaluation(decision, ScalerState::default());
    }

    if active.len() > target {
        let Some(since) = state.over_capacity_since else {
            let state = ScalerState {
                over_capacity_since: Some(now),
            };
            let remaining = policy.grace_period;
            return evaluation(ScaleDecision::AwaitGrace { remaining }, state);
        };

        let elapsed = now.saturating_duration_since(since);
        if elapsed >= policy.grace_period {
            let to_stop = active[target..].iter().map(|i| i.id.clone()).collect();
            return evaluation(ScaleDecision::Stop(to_stop), state);
        }
        let remaining = policy.grace_period - elapsed;
        return evaluation(ScaleDecision::AwaitGrace { remaining }, state);
    }

    evaluation(ScaleDecision::NoChange, ScalerState::default())
}

/// Applies [`decide`] to a live queue and instance pool.
pub struct Autoscaler {
    queue: Arc<dyn QueueService>,
    fleet: Arc<dyn InstanceProvider>,
    policy: ScalingPolicy,
    state: ScalerState,
}

impl Autoscaler {
    pub fn new(
        queue: Arc<dyn QueueService>,
        fleet: Arc<dyn InstanceProvider>,
        policy: ScalingPolicy,
    ) -> Self {
        Self {
            queue,
            fleet,
            policy,
            state: ScalerState::default(),
        }
    }

    /// Grace-timer state carried between ticks.
    pub fn state(&self) -> ScalerState {
        self.state
    }

    /// Run one evaluation and apply its decision.
    ///
    /// Returns `None` when the tick was skipped because the queue depth or
    /// the pool could not be read; the timer state is left untouched.
    pub async fn tick(&mut self) -> Option<Evaluation> {
        let depth = match self.queue.approximate_depth().await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(queue = %self.queue.name(), error = %e, "failed to read queue depth, skipping tick");
                return None;
            }
        };
        let instances = match self.fleet.list().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "failed to list instances, skipping tick");
                return None;
            }
        };

        let evaluation = decide(&self.policy, self.state, depth, &instances, Instant::now());
        self.state = evaluation.state;
        debug!(
            depth,
            active = evaluation.active,
            desired = evaluation.desired,
            decision = ?evaluation.decision,
            "autoscaler tick"
        );

        match &evaluation.decision {
            ScaleDecision::Start(ids) => {
                info!(count = ids.len(), ?ids, desired = evaluation.desired, "starting instances");
                if let Err(e) = self.fleet.start(ids).await {
                    error!(?ids, error = %e, "failed to start instances");
                }
            }
            ScaleDecision::Stop(ids) => {
                info!(count = ids.len(), ?ids, desired = evaluation.desired, "stopping instances");
                if let Err(e) = self.fleet.stop(ids).await {
                    error!(?ids, error = %e, "failed to stop instances");
                }
            }
            ScaleDecision::AwaitGrace { .. } | ScaleDecision::NoChange => {}
        }

        Some(evaluation)
    }

    /// Run the autoscaler loop.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = interval.as_millis() as u64,
            max_instances = self.policy.max_instances,
            grace_period_ms = self.policy.grace_period.as_millis() as u64,
            "autoscaler started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}
