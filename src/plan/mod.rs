//! Dispatch-plan builder
//!
//! Turns a validated operation list into the work the broker executes:
//! either a single task chained to finalization, or a fan-out group whose
//! siblings are joined by the finalize callback (a chord).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::api::models::{Operation, OperationParams};

/// Logical queue a task is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Standard,
    MlInference,
}

impl QueueName {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Standard => "standard",
            QueueName::MlInference => "ml_inference",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy carried per task: transient failures are retried with
/// exponential backoff; exhaustion routes the task to the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(self.backoff_base_ms * 2u64.saturating_pow(attempt))
    }
}

/// What a task does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Run one operation against the source object
    Process {
        operation: Operation,
        #[serde(default)]
        params: OperationParams,
    },
    /// Bundle the listed result artifacts into a ZIP (post-finalize)
    Archive {
        result_keys: BTreeMap<Operation, String>,
    },
}

/// Broker task message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    pub source_key: String,
    /// Propagated from submission for log correlation
    pub correlation_id: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub dispatched_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl TaskMessage {
    /// Routing: denoise goes to the ml queue, everything else is standard
    pub fn queue(&self) -> QueueName {
        match &self.kind {
            TaskKind::Process {
                operation: Operation::Denoise,
                ..
            } => QueueName::MlInference,
            _ => QueueName::Standard,
        }
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match &self.kind {
            TaskKind::Process { operation, .. } => operation.as_str(),
            TaskKind::Archive { .. } => "archive",
        }
    }
}

/// Dispatch plan: a single task chained to finalize, or a parallel fan-out
/// joined by the finalize callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Chain { task: TaskMessage },
    Chord { siblings: Vec<TaskMessage> },
}

impl Plan {
    pub fn tasks(&self) -> &[TaskMessage] {
        match self {
            Plan::Chain { task } => std::slice::from_ref(task),
            Plan::Chord { siblings } => siblings,
        }
    }

    /// Number of fan-out outcomes the finalizer will observe
    pub fn expected_outcomes(&self) -> usize {
        self.tasks().len()
    }
}

/// Build the dispatch plan for a job.
///
/// Duplicate operations are collapsed preserving first-seen order; the caller
/// guarantees the list is non-empty (submission validation rejects an empty
/// list upstream).
pub fn build_plan(
    job_id: &str,
    source_key: &str,
    operations: &[Operation],
    params: &BTreeMap<Operation, OperationParams>,
    correlation_id: &str,
) -> Plan {
    debug_assert!(!operations.is_empty());

    let mut seen = BTreeSet::new();
    let now = Utc::now();

    let tasks: Vec<TaskMessage> = operations
        .iter()
        .copied()
        .filter(|op| seen.insert(*op))
        .map(|operation| TaskMessage {
            job_id: job_id.to_string(),
            kind: TaskKind::Process {
                operation,
                params: params.get(&operation).cloned().unwrap_or_default(),
            },
            source_key: source_key.to_string(),
            correlation_id: correlation_id.to_string(),
            dispatched_at: now,
            attempt: 0,
            retry: RetryPolicy::default(),
        })
        .collect();

    match <[TaskMessage; 1]>::try_from(tasks) {
        Ok([task]) => Plan::Chain { task },
        Err(siblings) => Plan::Chord { siblings },
    }
}

/// Build the post-finalize archive task for a completed job
pub fn archive_task(
    job_id: &str,
    source_key: &str,
    result_keys: BTreeMap<Operation, String>,
    correlation_id: &str,
) -> TaskMessage {
    TaskMessage {
        job_id: job_id.to_string(),
        kind: TaskKind::Archive { result_keys },
        source_key: source_key.to_string(),
        correlation_id: correlation_id.to_string(),
        dispatched_at: Utc::now(),
        attempt: 0,
        retry: RetryPolicy::default(),
    }
}
