//! EC2-backed instance fleet.
//!
//! Pool membership is a `Name` tag pattern (EC2 filter wildcards apply, so
//! `app-tier-instance-*` works as expected). Only pre-provisioned
//! instances are started and stopped; nothing is launched or terminated.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::{self as ec2, Filter, InstanceStateName};
use tracing::debug;

use facegrid_core::{
    Instance, InstanceId, InstanceProvider, InstanceState, PipelineError, PipelineResult,
};

pub struct Ec2Fleet {
    client: Client,
    name_pattern: String,
}

impl Ec2Fleet {
    /// Pool members are instances whose `Name` tag matches `name_pattern`.
    pub fn new(sdk_config: &SdkConfig, name_pattern: impl Into<String>) -> Self {
        Self::with_client(Client::new(sdk_config), name_pattern)
    }

    pub fn with_client(client: Client, name_pattern: impl Into<String>) -> Self {
        Self {
            client,
            name_pattern: name_pattern.into(),
        }
    }

    fn filters(&self) -> Vec<Filter> {
        vec![
            Filter::builder()
                .name("tag:Name")
                .values(&self.name_pattern)
                .build(),
            Filter::builder()
                .name("instance-state-name")
                .values("stopped")
                .values("pending")
                .values("running")
                .build(),
        ]
    }
}

#[async_trait]
impl InstanceProvider for Ec2Fleet {
    async fn list(&self) -> PipelineResult<Vec<Instance>> {
        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .describe_instances()
                .set_filters(Some(self.filters()))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    PipelineError::Instance(format!(
                        "describe_instances: {}",
                        DisplayErrorContext(&e)
                    ))
                })?;

            instances.extend(
                output
                    .reservations()
                    .iter()
                    .flat_map(|r| r.instances())
                    .filter_map(convert_instance),
            );

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(pattern = %self.name_pattern, count = instances.len(), "listed pool instances");
        Ok(instances)
    }

    async fn start(&self, ids: &[InstanceId]) -> PipelineResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .start_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| {
                PipelineError::Instance(format!("start_instances: {}", DisplayErrorContext(&e)))
            })?;
        Ok(())
    }

    async fn stop(&self, ids: &[InstanceId]) -> PipelineResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .stop_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| {
                PipelineError::Instance(format!("stop_instances: {}", DisplayErrorContext(&e)))
            })?;
        Ok(())
    }
}

fn convert_state(name: &InstanceStateName) -> Option<InstanceState> {
    match name {
        InstanceStateName::Pending => Some(InstanceState::Pending),
        InstanceStateName::Running => Some(InstanceState::Running),
        InstanceStateName::Stopping => Some(InstanceState::Stopping),
        InstanceStateName::Stopped => Some(InstanceState::Stopped),
        InstanceStateName::ShuttingDown | InstanceStateName::Terminated => {
            Some(InstanceState::Terminated)
        }
        _ => None,
    }
}

/// Map an SDK instance, dropping ones without an id or a known state.
fn convert_instance(instance: &ec2::Instance) -> Option<Instance> {
    let id = instance.instance_id()?;
    let state = instance
        .state()
        .and_then(|s| s.name())
        .and_then(convert_state)?;
    let name = instance
        .tags()
        .iter()
        .find(|tag| tag.key() == Some("Name"))
        .and_then(|tag| tag.value())
        .unwrap_or_default();
    Some(Instance::new(id, name, state))
}
