//! Chord join tracking
//!
//! A chord is a fan-out of sibling tasks joined by the finalize callback.
//! The tracker counts one outcome per sibling and releases the aggregated
//! list exactly once, on the last sibling's termination. Chain plans are the
//! degenerate case with a single expected outcome.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::api::models::Operation;

/// Per-sibling result observed by the finalizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// An image-producing operation stored its artifact
    Stored { operation: Operation, key: String },
    /// The metadata operation extracted its key/value map
    Extracted { metadata: BTreeMap<String, String> },
    /// The operation failed after its retry budget
    Failed { operation: Operation, error: String },
}

impl TaskOutcome {
    pub fn operation(&self) -> Operation {
        match self {
            TaskOutcome::Stored { operation, .. } => *operation,
            TaskOutcome::Extracted { .. } => Operation::Metadata,
            TaskOutcome::Failed { operation, .. } => *operation,
        }
    }
}

#[derive(Debug)]
struct PendingJoin {
    expected: usize,
    outcomes: Vec<TaskOutcome>,
}

/// Tracks in-flight chords by job id
#[derive(Debug, Default)]
pub struct ChordTracker {
    joins: Mutex<HashMap<String, PendingJoin>>,
}

impl ChordTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job's fan-out before any sibling is dispatched.
    /// Re-registering an already-pending job (startup requeue) keeps the
    /// larger expectation so no outcome is lost.
    pub fn register(&self, job_id: &str, expected: usize) {
        debug_assert!(expected > 0);
        let mut joins = self.joins.lock();
        joins
            .entry(job_id.to_string())
            .and_modify(|join| join.expected = join.expected.max(expected))
            .or_insert(PendingJoin {
                expected,
                outcomes: Vec::new(),
            });
        debug!(job_id, expected, "chord registered");
    }

    /// Record one sibling outcome. Returns the aggregated list exactly once,
    /// when the last sibling reports in.
    pub fn complete(&self, job_id: &str, outcome: TaskOutcome) -> Option<Vec<TaskOutcome>> {
        let mut joins = self.joins.lock();
        let Some(join) = joins.get_mut(job_id) else {
            // Outcome for a job we never registered: a redelivered message
            // for an already-finalized chord. Drop it; the finalizer's
            // terminal guard covers the job record side.
            warn!(job_id, "outcome for unregistered chord dropped");
            return None;
        };

        join.outcomes.push(outcome);
        if join.outcomes.len() >= join.expected {
            let join = joins.remove(job_id)?;
            debug!(job_id, count = join.outcomes.len(), "chord complete");
            return Some(join.outcomes);
        }
        None
    }

    pub fn is_pending(&self, job_id: &str) -> bool {
        self.joins.lock().contains_key(job_id)
    }

    pub fn pending_count(&self) -> usize {
        self.joins.lock().len()
    }
}
