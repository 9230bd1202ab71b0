//! Worker pools
//!
//! Two pools drain the broker's logical queues. Standard workers run
//! side-by-side (cooperative concurrency across the pool); the ml pool
//! defaults to a single worker so heavy inference is strictly serial with
//! bounded memory. Each worker loops over its own bounded channel, so no
//! worker prefetches beyond what it is actively processing.

pub mod runner;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::finalize::Finalizer;
use crate::ledger::JobStore;
use crate::observability::Metrics;
use crate::plan::QueueName;
use crate::processing::ImageEngine;
use crate::queue::{BrokerReceivers, ChordTracker, FjallQueue, TaskEnvelope};
use crate::storage::StorageClient;

/// Per-task-class soft timeouts
#[derive(Debug, Clone, Copy)]
pub struct TaskTimeouts {
    pub standard: Duration,
    pub ml: Duration,
}

impl TaskTimeouts {
    pub fn for_queue(&self, queue: QueueName) -> Duration {
        match queue {
            QueueName::Standard => self.standard,
            QueueName::MlInference => self.ml,
        }
    }
}

impl Default for TaskTimeouts {
    fn default() -> Self {
        Self {
            standard: Duration::from_secs(60),
            ml: Duration::from_secs(300),
        }
    }
}

/// Everything a worker needs to execute tasks
pub struct WorkerContext {
    pub queue: Arc<FjallQueue>,
    pub storage: Arc<StorageClient>,
    pub engine: Arc<dyn ImageEngine>,
    pub tracker: Arc<ChordTracker>,
    pub finalizer: Arc<Finalizer>,
    pub store: Arc<JobStore>,
    pub metrics: Arc<Metrics>,
    pub timeouts: TaskTimeouts,
}

/// Spawn both pools from the broker's receivers. Handles are returned so the
/// server can abort them on shutdown.
pub fn spawn_workers(ctx: Arc<WorkerContext>, receivers: BrokerReceivers) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for (worker_id, rx) in receivers.standard.into_iter().enumerate() {
        handles.push(spawn_worker_loop(
            Arc::clone(&ctx),
            QueueName::Standard,
            worker_id,
            rx,
        ));
    }
    for (worker_id, rx) in receivers.ml.into_iter().enumerate() {
        handles.push(spawn_worker_loop(
            Arc::clone(&ctx),
            QueueName::MlInference,
            worker_id,
            rx,
        ));
    }

    info!(workers = handles.len(), "worker pools started");
    handles
}

fn spawn_worker_loop(
    ctx: Arc<WorkerContext>,
    queue: QueueName,
    worker_id: usize,
    mut rx: mpsc::Receiver<TaskEnvelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(%queue, worker_id, "worker started");
        while let Some(envelope) = rx.recv().await {
            runner::run_task(&ctx, envelope).await;
        }
        debug!(%queue, worker_id, "worker channel closed, exiting");
    })
}
