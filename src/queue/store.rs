use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::plan::TaskMessage;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("task codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("task not found: seq={0}")]
    TaskNotFound(u64),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Permanently failed task, preserved for inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: TaskMessage,
    pub failure_code: String,
    pub failure_message: String,
    pub attempts: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub failed_at: DateTime<Utc>,
}

/// FjallQueue persists task messages and the dead-letter queue.
///
/// Partitions:
/// - `tasks`: u64 (big-endian) → TaskMessage (JSON); entries live until acked
/// - `metadata`: "next_seq" → u64 counter (crash recovery)
/// - `dlq`: u64 (big-endian) → DeadLetterEntry (JSON)
///
/// Tasks are persisted atomically before being sent to workers; unacked
/// entries found at startup are the requeue set.
pub struct FjallQueue {
    keyspace: Keyspace,
    tasks: PartitionHandle,
    metadata: PartitionHandle,
    dlq: PartitionHandle,
    seq_counter: AtomicU64,
}

impl FjallQueue {
    /// Open or create a queue at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("opening task queue at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;

        let tasks = keyspace.open_partition("tasks", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;
        let dlq = keyspace.open_partition("dlq", PartitionCreateOptions::default())?;

        let current_seq = metadata
            .get(b"next_seq")?
            .map(|bytes| u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0u8; 8])))
            .unwrap_or(0);

        debug!(current_seq, "task queue opened");

        Ok(Self {
            keyspace,
            tasks,
            metadata,
            dlq,
            seq_counter: AtomicU64::new(current_seq),
        })
    }

    /// Persist a task and return its sequence number
    pub fn enqueue(&self, task: &TaskMessage) -> Result<u64> {
        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);

        let value = serde_json::to_vec(task)?;
        self.tasks.insert(seq.to_be_bytes(), value)?;

        // Persist the counter for crash recovery
        self.metadata.insert(b"next_seq", (seq + 1).to_be_bytes())?;

        debug!(seq, job_id = %task.job_id, task = task.label(), "task persisted");
        Ok(seq)
    }

    pub fn get_task(&self, seq: u64) -> Result<Option<TaskMessage>> {
        match self.tasks.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Late acknowledgement: remove the task once its runner finished.
    /// Tasks that were never acked are re-dispatched on startup.
    pub fn ack(&self, seq: u64) -> Result<()> {
        self.tasks.remove(seq.to_be_bytes())?;
        debug!(seq, "task acked");
        Ok(())
    }

    /// All persisted-but-unacked tasks, in sequence order
    pub fn pending(&self) -> Result<Vec<(u64, TaskMessage)>> {
        let mut out = Vec::new();
        for item in self.tasks.iter() {
            let (key, value) = item?;
            let seq = u64::from_be_bytes(key.as_ref().try_into().unwrap_or([0u8; 8]));
            match serde_json::from_slice(&value) {
                Ok(task) => out.push((seq, task)),
                Err(e) => warn!(seq, error = %e, "skipping undecodable pending task"),
            }
        }
        Ok(out)
    }

    /// Move a task to the dead-letter queue after its retries are exhausted
    /// or it hit an unrecoverable error. The task is acked as part of the
    /// move so it is never both requeued and dead-lettered.
    pub fn move_to_dlq(
        &self,
        seq: u64,
        failure_code: &str,
        failure_message: &str,
        attempts: u32,
    ) -> Result<()> {
        let task = self.get_task(seq)?.ok_or(QueueError::TaskNotFound(seq))?;

        let entry = DeadLetterEntry {
            task,
            failure_code: failure_code.to_string(),
            failure_message: failure_message.to_string(),
            attempts,
            failed_at: Utc::now(),
        };

        self.dlq.insert(seq.to_be_bytes(), serde_json::to_vec(&entry)?)?;
        self.tasks.remove(seq.to_be_bytes())?;

        info!(seq, failure_code, attempts, "task moved to dead-letter queue");
        Ok(())
    }

    pub fn get_dlq_task(&self, seq: u64) -> Result<Option<DeadLetterEntry>> {
        match self.dlq.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List dead-letter entries for inspection
    pub fn list_dlq(&self, limit: usize) -> Result<Vec<(u64, DeadLetterEntry)>> {
        let mut results = Vec::new();
        for item in self.dlq.iter().take(limit) {
            let (key, value) = item?;
            let seq = u64::from_be_bytes(key.as_ref().try_into().unwrap_or([0u8; 8]));
            results.push((seq, serde_json::from_slice(&value)?));
        }
        Ok(results)
    }

    pub fn current_seq(&self) -> u64 {
        self.seq_counter.load(Ordering::SeqCst)
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Health check - verify the keyspace is accessible
    pub fn health_check(&self) -> bool {
        self.metadata.get(b"next_seq").is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{Operation, OperationParams};
    use crate::plan::{RetryPolicy, TaskKind};
    use tempfile::TempDir;

    fn test_task(job_id: &str, operation: Operation) -> TaskMessage {
        // Second precision, to survive the wire encoding unchanged
        let dispatched_at = chrono::DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap();
        TaskMessage {
            job_id: job_id.to_string(),
            kind: TaskKind::Process {
                operation,
                params: OperationParams::default(),
            },
            source_key: format!("raw/{job_id}/in.png"),
            correlation_id: "corr".to_string(),
            dispatched_at,
            attempt: 0,
            retry: RetryPolicy::default(),
        }
    }

    #[test]
    fn enqueue_and_retrieve() {
        let temp = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp.path().join("queue")).unwrap();

        let task = test_task("job-1", Operation::Webp);
        let seq = queue.enqueue(&task).unwrap();
        assert_eq!(seq, 0);

        let retrieved = queue.get_task(seq).unwrap().unwrap();
        assert_eq!(retrieved, task);
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let temp = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp.path().join("queue")).unwrap();

        for expected in 0..3 {
            let seq = queue.enqueue(&test_task("j", Operation::Png)).unwrap();
            assert_eq!(seq, expected);
        }
    }

    #[test]
    fn ack_removes_from_pending() {
        let temp = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp.path().join("queue")).unwrap();

        let seq1 = queue.enqueue(&test_task("j1", Operation::Webp)).unwrap();
        let seq2 = queue.enqueue(&test_task("j2", Operation::Avif)).unwrap();

        queue.ack(seq1).unwrap();

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, seq2);
    }

    #[test]
    fn unacked_tasks_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("queue");

        {
            let queue = FjallQueue::open(&path).unwrap();
            queue.enqueue(&test_task("j1", Operation::Webp)).unwrap();
            let acked = queue.enqueue(&test_task("j2", Operation::Avif)).unwrap();
            queue.ack(acked).unwrap();
            queue.flush().unwrap();
        }

        let queue = FjallQueue::open(&path).unwrap();
        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.job_id, "j1");
        // Counter continues past both
        assert_eq!(queue.current_seq(), 2);
    }

    #[test]
    fn move_to_dlq_preserves_the_task() {
        let temp = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp.path().join("queue")).unwrap();

        let seq = queue.enqueue(&test_task("j", Operation::Denoise)).unwrap();
        queue
            .move_to_dlq(seq, "TASK_TIMEOUT", "denoise exceeded 300s", 3)
            .unwrap();

        let entry = queue.get_dlq_task(seq).unwrap().unwrap();
        assert_eq!(entry.failure_code, "TASK_TIMEOUT");
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.task.job_id, "j");

        // Dead-lettered tasks are no longer pending
        assert!(queue.pending().unwrap().is_empty());
        assert_eq!(queue.list_dlq(10).unwrap().len(), 1);
    }

    #[test]
    fn move_to_dlq_missing_task_errors() {
        let temp = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp.path().join("queue")).unwrap();
        assert!(matches!(
            queue.move_to_dlq(99, "X", "y", 1),
            Err(QueueError::TaskNotFound(99))
        ));
    }
}
