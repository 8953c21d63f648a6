//! In-memory instance fleet.
//!
//! State transitions mirror the cloud lifecycle in two steps: `start`
//! moves stopped → pending and `stop` moves pending/running → stopping.
//! `settle` completes the transition (pending → running, stopping →
//! stopped), standing in for the time a real instance takes to boot or
//! halt.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use regex::Regex;

use crate::error::{PipelineError, PipelineResult};
use crate::memory::lock;
use crate::service::InstanceProvider;
use crate::types::{Instance, InstanceId, InstanceState};

/// A lifecycle command received by the fleet, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCommand {
    Start(Vec<InstanceId>),
    Stop(Vec<InstanceId>),
}

pub struct MemoryFleet {
    pattern: Regex,
    instances: Mutex<BTreeMap<InstanceId, Instance>>,
    commands: Mutex<Vec<FleetCommand>>,
    unavailable: AtomicBool,
}

impl MemoryFleet {
    /// Create a fleet whose pool membership is decided by a `*`/`?` glob
    /// on the instance name, e.g. `app-tier-instance-*`.
    pub fn new(name_pattern: &str) -> Self {
        Self {
            pattern: glob_regex(name_pattern),
            instances: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Provision `count` stopped instances named `{prefix}{n}` with ids `i-{n}`.
    pub fn with_stopped(name_pattern: &str, prefix: &str, count: usize) -> Self {
        let fleet = Self::new(name_pattern);
        for n in 0..count {
            fleet.add(Instance::new(
                format!("i-{n:04}"),
                format!("{prefix}{n}"),
                InstanceState::Stopped,
            ));
        }
        fleet
    }

    /// Register an instance, replacing one with the same id.
    pub fn add(&self, instance: Instance) {
        lock(&self.instances).insert(instance.id.clone(), instance);
    }

    /// Force an instance into a state, e.g. to simulate it crashing.
    pub fn set_state(&self, id: &str, state: InstanceState) {
        if let Some(instance) = lock(&self.instances).get_mut(id) {
            instance.state = state;
        }
    }

    /// Current state of `id`, if it exists.
    pub fn state_of(&self, id: &str) -> Option<InstanceState> {
        lock(&self.instances).get(id).map(|i| i.state)
    }

    /// Complete in-progress transitions.
    pub fn settle(&self) {
        for instance in lock(&self.instances).values_mut() {
            instance.state = match instance.state {
                InstanceState::Pending => InstanceState::Running,
                InstanceState::Stopping => InstanceState::Stopped,
                other => other,
            };
        }
    }

    /// Pool members that are pending or running.
    pub fn active_count(&self) -> usize {
        lock(&self.instances)
            .values()
            .filter(|i| self.pattern.is_match(&i.name) && i.state.is_active())
            .count()
    }

    /// Every command received so far.
    pub fn commands(&self) -> Vec<FleetCommand> {
        lock(&self.commands).clone()
    }

    /// Make every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> PipelineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::Instance("instance api unavailable".to_string()));
        }
        Ok(())
    }

    fn transition(
        &self,
        ids: &[InstanceId],
        from: impl Fn(InstanceState) -> bool,
        to: InstanceState,
    ) -> PipelineResult<()> {
        let mut instances = lock(&self.instances);
        if let Some(unknown) = ids.iter().find(|id| !instances.contains_key(*id)) {
            return Err(PipelineError::Instance(format!("unknown instance {unknown}")));
        }
        for id in ids {
            if let Some(instance) = instances.get_mut(id)
                && from(instance.state)
            {
                instance.state = to;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceProvider for MemoryFleet {
    async fn list(&self) -> PipelineResult<Vec<Instance>> {
        self.check_available()?;
        Ok(lock(&self.instances)
            .values()
            .filter(|i| self.pattern.is_match(&i.name) && i.state.is_controllable())
            .cloned()
            .collect())
    }

    async fn start(&self, ids: &[InstanceId]) -> PipelineResult<()> {
        self.check_available()?;
        lock(&self.commands).push(FleetCommand::Start(ids.to_vec()));
        self.transition(
            ids,
            |state| state == InstanceState::Stopped,
            InstanceState::Pending,
        )
    }

    async fn stop(&self, ids: &[InstanceId]) -> PipelineResult<()> {
        self.check_available()?;
        lock(&self.commands).push(FleetCommand::Stop(ids.to_vec()));
        self.transition(ids, InstanceState::is_active, InstanceState::Stopping)
    }
}

/// Translate a `*`/`?` glob into an anchored regex.
fn glob_regex(pattern: &str) -> Regex {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).expect("escaped glob is a valid regex")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        let re = glob_regex("app-tier-instance-*");
        assert!(re.is_match("app-tier-instance-1"));
        assert!(re.is_match("app-tier-instance-"));
        assert!(!re.is_match("web-tier"));
        assert!(!re.is_match("xapp-tier-instance-1"));

        let re = glob_regex("node-?.a");
        assert!(re.is_match("node-1.a"));
        assert!(!re.is_match("node-1xa"));
    }

    #[tokio::test]
    async fn list_filters_by_name_and_state() {
        let fleet = MemoryFleet::with_stopped("app-tier-instance-*", "app-tier-instance-", 2);
        fleet.add(Instance::new("i-web", "web-tier", InstanceState::Running));
        fleet.add(Instance::new(
            "i-dead",
            "app-tier-instance-9",
            InstanceState::Terminated,
        ));

        let listed = fleet.list().await.unwrap();
        let ids: Vec<_> = listed.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i-0000", "i-0001"]);
    }

    #[tokio::test]
    async fn start_and_stop_follow_the_lifecycle() {
        let fleet = MemoryFleet::with_stopped("w-*", "w-", 2);
        let ids = vec!["i-0000".to_string()];

        fleet.start(&ids).await.unwrap();
        assert_eq!(fleet.state_of("i-0000"), Some(InstanceState::Pending));
        assert_eq!(fleet.active_count(), 1);

        fleet.settle();
        assert_eq!(fleet.state_of("i-0000"), Some(InstanceState::Running));

        fleet.stop(&ids).await.unwrap();
        assert_eq!(fleet.state_of("i-0000"), Some(InstanceState::Stopping));
        assert_eq!(fleet.active_count(), 0);
        // Stopping instances are not part of the controllable pool.
        assert_eq!(fleet.list().await.unwrap().len(), 1);

        fleet.settle();
        assert_eq!(fleet.state_of("i-0000"), Some(InstanceState::Stopped));
        assert_eq!(
            fleet.commands(),
            vec![FleetCommand::Start(ids.clone()), FleetCommand::Stop(ids)]
        );
    }

    #[tokio::test]
    async fn unknown_instance_is_rejected() {
        let fleet = MemoryFleet::with_stopped("w-*", "w-", 1);
        let err = fleet.start(&["i-nope".to_string()]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Instance(_)));
        assert_eq!(fleet.state_of("i-0000"), Some(InstanceState::Stopped));
    }

    #[tokio::test]
    async fn unavailable_fleet_records_nothing() {
        let fleet = MemoryFleet::with_stopped("w-*", "w-", 1);
        fleet.set_unavailable(true);
        assert!(fleet.list().await.is_err());
        assert!(fleet.start(&["i-0000".to_string()]).await.is_err());
        assert!(fleet.commands().is_empty());
    }
}
