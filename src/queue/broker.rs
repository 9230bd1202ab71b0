use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::plan::{Plan, QueueName, TaskKind, TaskMessage};

use super::chord::ChordTracker;
use super::store::{FjallQueue, QueueError, Result};

/// TaskEnvelope pairs a task with its queue sequence number (the ack handle)
#[derive(Clone, Debug)]
pub struct TaskEnvelope {
    pub seq: u64,
    pub task: TaskMessage,
}

/// Receivers handed to the worker pools, one per worker
pub struct BrokerReceivers {
    pub standard: Vec<mpsc::Receiver<TaskEnvelope>>,
    pub ml: Vec<mpsc::Receiver<TaskEnvelope>>,
}

/// TaskBroker routes task messages to the two logical queues.
///
/// 1. The dispatcher persists each task to the FjallQueue (atomic, gets seq)
/// 2. The envelope is sent to a worker over a bounded mpsc channel
/// 3. `standard` distributes round-robin across its pool; `ml_inference`
///    funnels into a single serial worker by default
/// 4. Bounded channels give backpressure: a worker holds at most its channel
///    capacity beyond the task it is processing
///
/// The broker is not a separate task: API handlers and the finalizer call its
/// methods directly.
pub struct TaskBroker {
    queue: Arc<FjallQueue>,
    tracker: Arc<ChordTracker>,
    standard: Vec<mpsc::Sender<TaskEnvelope>>,
    ml: Vec<mpsc::Sender<TaskEnvelope>>,
    next_standard: AtomicUsize,
    next_ml: AtomicUsize,
}

impl TaskBroker {
    /// Create a broker with its worker channels.
    /// Returns the broker plus the receivers to spawn workers from.
    pub fn new(
        queue: Arc<FjallQueue>,
        standard_workers: usize,
        ml_workers: usize,
        channel_capacity: usize,
    ) -> (Self, BrokerReceivers) {
        info!(
            standard_workers,
            ml_workers, channel_capacity, "creating task broker"
        );

        let make_pool = |count: usize| {
            let mut senders = Vec::with_capacity(count);
            let mut receivers = Vec::with_capacity(count);
            for _ in 0..count.max(1) {
                let (tx, rx) = mpsc::channel(channel_capacity.max(1));
                senders.push(tx);
                receivers.push(rx);
            }
            (senders, receivers)
        };

        let (standard, standard_rx) = make_pool(standard_workers);
        let (ml, ml_rx) = make_pool(ml_workers);

        let broker = Self {
            queue,
            tracker: Arc::new(ChordTracker::new()),
            standard,
            ml,
            next_standard: AtomicUsize::new(0),
            next_ml: AtomicUsize::new(0),
        };

        (
            broker,
            BrokerReceivers {
                standard: standard_rx,
                ml: ml_rx,
            },
        )
    }

    pub fn tracker(&self) -> Arc<ChordTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn queue_store(&self) -> Arc<FjallQueue> {
        Arc::clone(&self.queue)
    }

    /// Dispatch a submission plan: register the chord join, then persist and
    /// route every task. Registration happens first so a fast worker cannot
    /// report an outcome before the join exists.
    pub async fn dispatch(&self, plan: &Plan) -> Result<()> {
        if let Some(task) = plan.tasks().first() {
            self.tracker.register(&task.job_id, plan.expected_outcomes());
        }
        for task in plan.tasks() {
            self.enqueue(task.clone()).await?;
        }
        Ok(())
    }

    /// Persist one task and hand it to a worker. Returns the sequence number.
    pub async fn enqueue(&self, task: TaskMessage) -> Result<u64> {
        let seq = self.queue.enqueue(&task)?;
        self.route(TaskEnvelope { seq, task }).await;
        Ok(seq)
    }

    async fn route(&self, envelope: TaskEnvelope) {
        let queue_name = envelope.task.queue();
        let (pool, cursor) = match queue_name {
            QueueName::Standard => (&self.standard, &self.next_standard),
            QueueName::MlInference => (&self.ml, &self.next_ml),
        };

        let idx = cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        let seq = envelope.seq;

        // Bounded send: blocks under backpressure instead of hoarding
        if pool[idx].send(envelope).await.is_err() {
            // Worker is gone; the task stays persisted and unacked, so the
            // next startup requeue picks it up
            warn!(seq, queue = %queue_name, "worker channel closed, task parked for requeue");
        } else {
            debug!(seq, queue = %queue_name, worker = idx, "task routed");
        }
    }

    /// Re-dispatch every persisted-but-unacked task (startup after a crash or
    /// worker loss). Chord joins are re-registered from the pending set
    /// before any task is routed.
    pub async fn recover(&self) -> Result<usize> {
        let pending = self.queue.pending()?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut expected: HashMap<String, usize> = HashMap::new();
        for (_, task) in &pending {
            if matches!(task.kind, TaskKind::Process { .. }) {
                *expected.entry(task.job_id.clone()).or_default() += 1;
            }
        }
        for (job_id, count) in expected {
            self.tracker.register(&job_id, count);
        }

        let count = pending.len();
        for (seq, task) in pending {
            self.route(TaskEnvelope { seq, task }).await;
        }

        info!(count, "requeued unacknowledged tasks");
        Ok(count)
    }

    pub fn standard_workers(&self) -> usize {
        self.standard.len()
    }

    pub fn ml_workers(&self) -> usize {
        self.ml.len()
    }

    /// All worker channels still open
    pub fn health_check(&self) -> bool {
        self.standard.iter().chain(self.ml.iter()).all(|ch| !ch.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::Operation;
    use crate::plan::build_plan;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn open_queue(temp: &TempDir) -> Arc<FjallQueue> {
        Arc::new(FjallQueue::open(temp.path().join("queue")).unwrap())
    }

    fn plan_for(job_id: &str, ops: &[Operation]) -> Plan {
        build_plan(
            job_id,
            &format!("raw/{job_id}/in.png"),
            ops,
            &BTreeMap::new(),
            "corr",
        )
    }

    #[tokio::test]
    async fn dispatch_routes_by_queue() {
        let temp = TempDir::new().unwrap();
        let (broker, mut rx) = TaskBroker::new(open_queue(&temp), 2, 1, 8);

        let plan = plan_for("j", &[Operation::Webp, Operation::Denoise]);
        broker.dispatch(&plan).await.unwrap();

        // webp lands in the standard pool (round-robin starts at worker 0)
        let standard = rx.standard[0].recv().await.unwrap();
        assert_eq!(standard.task.label(), "webp");

        // denoise lands in the ml pool
        let ml = rx.ml[0].recv().await.unwrap();
        assert_eq!(ml.task.label(), "denoise");
        assert_eq!(ml.task.queue(), QueueName::MlInference);
    }

    #[tokio::test]
    async fn dispatch_registers_the_chord_before_routing() {
        let temp = TempDir::new().unwrap();
        let (broker, _rx) = TaskBroker::new(open_queue(&temp), 1, 1, 8);

        let plan = plan_for("j", &[Operation::Webp, Operation::Avif]);
        broker.dispatch(&plan).await.unwrap();

        assert!(broker.tracker().is_pending("j"));
    }

    #[tokio::test]
    async fn round_robin_across_standard_pool() {
        let temp = TempDir::new().unwrap();
        let (broker, mut rx) = TaskBroker::new(open_queue(&temp), 3, 1, 8);

        for job in ["a", "b", "c", "d", "e", "f"] {
            broker.dispatch(&plan_for(job, &[Operation::Png])).await.unwrap();
        }

        // Each of the three workers receives two tasks
        for worker in rx.standard.iter_mut() {
            assert!(worker.recv().await.is_some());
            assert!(worker.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn tasks_survive_dead_workers() {
        let temp = TempDir::new().unwrap();
        let (broker, rx) = TaskBroker::new(open_queue(&temp), 1, 1, 8);
        drop(rx); // all workers gone

        broker.dispatch(&plan_for("j", &[Operation::Webp])).await.unwrap();

        // Task is parked in the persistent queue for the next startup
        let pending = broker.queue_store().pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!broker.health_check());
    }

    #[tokio::test]
    async fn recover_requeues_and_reregisters() {
        let temp = TempDir::new().unwrap();

        {
            let (broker, rx) = TaskBroker::new(open_queue(&temp), 1, 1, 8);
            drop(rx);
            let plan = plan_for("j", &[Operation::Webp, Operation::Avif]);
            broker.dispatch(&plan).await.unwrap();
            broker.queue_store().flush().unwrap();
        }

        // New process: fresh broker over the same queue directory
        let (broker, mut rx) = TaskBroker::new(open_queue(&temp), 1, 1, 8);
        let recovered = broker.recover().await.unwrap();
        assert_eq!(recovered, 2);
        assert!(broker.tracker().is_pending("j"));

        let first = rx.standard[0].recv().await.unwrap();
        let second = rx.standard[0].recv().await.unwrap();
        assert_eq!(first.task.job_id, "j");
        assert_eq!(second.task.job_id, "j");
    }
}
