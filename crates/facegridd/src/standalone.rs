//! Standalone mode — the whole pipeline in one process.
//!
//! Queues and blob stores are in-memory. The worker pool is a
//! [`LocalFleet`]: "starting" an instance spawns a worker task and
//! "stopping" it signals that task to finish, so the autoscaler drives
//! real concurrency exactly as it would drive EC2.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use facegrid_autoscale::{Autoscaler, ScalingPolicy};
use facegrid_core::config::WorkerConfig;
use facegrid_core::memory::{MemoryBlobStore, MemoryFleet, MemoryQueue};
use facegrid_core::{
    FacegridConfig, Instance, InstanceId, InstanceProvider, PipelineResult, Recognizer, Role,
};
use facegrid_gateway::{CorrelationTable, GatewayState, ResponseDrainer, build_router};
use facegrid_worker::Worker;

use crate::serve_gateway;

/// Name prefix for local worker instances.
pub const LOCAL_WORKER_PREFIX: &str = "local-worker-";

/// Everything a local worker needs, shared by every worker task.
#[derive(Clone)]
pub struct WorkerTemplate {
    pub requests: Arc<MemoryQueue>,
    pub responses: Arc<MemoryQueue>,
    pub inputs: Arc<MemoryBlobStore>,
    pub outputs: Arc<MemoryBlobStore>,
    pub recognizer: Arc<dyn Recognizer>,
    pub settings: WorkerConfig,
}

impl WorkerTemplate {
    fn build(&self) -> Worker {
        Worker::new(
            self.requests.clone(),
            self.responses.clone(),
            self.inputs.clone(),
            self.outputs.clone(),
            self.recognizer.clone(),
            &self.settings,
        )
    }
}

struct LocalWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Worker tasks by lifecycle. A stopped worker may still be finishing
/// its current job, so its handle is kept until it is joined.
#[derive(Default)]
struct Workers {
    running: HashMap<InstanceId, LocalWorker>,
    stopping: Vec<(InstanceId, JoinHandle<()>)>,
}

/// Instance pool whose instances are worker tasks in this process.
pub struct LocalFleet {
    inventory: MemoryFleet,
    template: WorkerTemplate,
    workers: Mutex<Workers>,
}

impl LocalFleet {
    /// A pool of `size` stopped instances.
    pub fn new(size: usize, template: WorkerTemplate) -> Self {
        let pattern = format!("{LOCAL_WORKER_PREFIX}*");
        Self {
            inventory: MemoryFleet::with_stopped(&pattern, LOCAL_WORKER_PREFIX, size),
            template,
            workers: Mutex::new(Workers::default()),
        }
    }

    fn workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Worker tasks that have been started and not yet told to stop.
    pub fn running_workers(&self) -> usize {
        self.workers().running.len()
    }

    /// Signal every worker, then wait for running and stopping workers
    /// alike to finish.
    pub async fn shutdown(&self) {
        let (running, stopping) = {
            let mut workers = self.workers();
            let running: Vec<_> = workers.running.drain().collect();
            (running, std::mem::take(&mut workers.stopping))
        };

        for (_, worker) in &running {
            let _ = worker.shutdown.send(true);
        }
        let handles = running
            .into_iter()
            .map(|(id, worker)| (id, worker.handle))
            .chain(stopping);
        for (id, handle) in handles {
            let _ = handle.await;
            debug!(instance = %id, "local worker joined");
        }
    }
}

#[async_trait]
impl InstanceProvider for LocalFleet {
    async fn list(&self) -> PipelineResult<Vec<Instance>> {
        self.inventory.list().await
    }

    async fn start(&self, ids: &[InstanceId]) -> PipelineResult<()> {
        self.inventory.start(ids).await?;
        self.inventory.settle();

        let mut workers = self.workers();
        for id in ids {
            if workers.running.contains_key(id) {
                continue;
            }
            let (shutdown, shutdown_rx) = watch::channel(false);
            let worker = self.template.build();
            let handle = tokio::spawn(async move {
                worker.run(shutdown_rx).await;
            });
            workers
                .running
                .insert(id.clone(), LocalWorker { shutdown, handle });
            info!(instance = %id, "local worker started");
        }
        Ok(())
    }

    async fn stop(&self, ids: &[InstanceId]) -> PipelineResult<()> {
        self.inventory.stop(ids).await?;
        self.inventory.settle();

        let mut workers = self.workers();
        workers.stopping.retain(|(_, handle)| !handle.is_finished());
        for id in ids {
            if let Some(worker) = workers.running.remove(id) {
                let _ = worker.shutdown.send(true);
                workers.stopping.push((id.clone(), worker.handle));
                info!(instance = %id, "local worker stopping");
            }
        }
        Ok(())
    }
}

/// All in-memory components of a standalone pipeline.
pub struct Standalone {
    pub config: FacegridConfig,
    pub requests: Arc<MemoryQueue>,
    pub responses: Arc<MemoryQueue>,
    pub inputs: Arc<MemoryBlobStore>,
    pub outputs: Arc<MemoryBlobStore>,
    pub results: Arc<CorrelationTable>,
    pub fleet: Arc<LocalFleet>,
}

impl Standalone {
    /// Assemble the pipeline; the pool holds `max_instances` stopped workers.
    pub fn new(config: FacegridConfig, recognizer: Arc<dyn Recognizer>) -> Self {
        let requests = Arc::new(MemoryQueue::new("requests"));
        let responses = Arc::new(MemoryQueue::new("responses"));
        let inputs = Arc::new(MemoryBlobStore::new());
        let outputs = Arc::new(MemoryBlobStore::new());

        let template = WorkerTemplate {
            requests: requests.clone(),
            responses: responses.clone(),
            inputs: inputs.clone(),
            outputs: outputs.clone(),
            recognizer,
            settings: config.worker.clone(),
        };
        let fleet = Arc::new(LocalFleet::new(
            config.autoscaler.max_instances as usize,
            template,
        ));

        Self {
            config,
            requests,
            responses,
            inputs,
            outputs,
            results: Arc::new(CorrelationTable::new()),
            fleet,
        }
    }

    pub fn gateway_state(&self) -> GatewayState {
        GatewayState {
            inputs: self.inputs.clone(),
            requests: self.requests.clone(),
            results: self.results.clone(),
            settings: Arc::new(self.config.gateway.clone()),
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.gateway_state())
    }

    pub fn drainer(&self) -> ResponseDrainer {
        ResponseDrainer::new(
            self.responses.clone(),
            self.results.clone(),
            &self.config.gateway,
        )
    }

    pub fn autoscaler(&self) -> Autoscaler {
        Autoscaler::new(
            self.requests.clone(),
            self.fleet.clone(),
            ScalingPolicy::from(&self.config.autoscaler),
        )
    }

    /// Serve HTTP and run the autoscaler until `shutdown` flips, then
    /// stop every local worker.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.config.validate(Role::Standalone)?;
        info!(
            listen = %self.config.gateway.listen,
            pool = self.config.autoscaler.max_instances,
            "facegrid standalone starting"
        );

        let mut autoscaler = self.autoscaler();
        let tick = self.config.autoscaler.tick;
        let autoscale_shutdown = shutdown.clone();
        let autoscale_handle = tokio::spawn(async move {
            autoscaler.run(tick, autoscale_shutdown).await;
        });

        let served = serve_gateway(
            self.gateway_state(),
            self.responses.clone(),
            self.config.gateway.listen,
            shutdown,
        )
        .await;

        if served.is_err() {
            autoscale_handle.abort();
        }
        let _ = autoscale_handle.await;
        self.fleet.shutdown().await;
        info!("standalone stopped");
        served
    }
}
