//! Retention enforcement for the ledger partitions

use chrono::{DateTime, Utc};
use fjall::PartitionHandle;
use std::time::Duration;
use tracing::debug;

use crate::api::models::JobRecord;

use super::error::Result;
use super::partitions::encode_meta_key;
use super::store::IdempotencyRecord;

const META_LAST_PRUNE_JOBS: &str = "last_prune_jobs";

/// Pruning statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    pub jobs_pruned: usize,
    pub idempotency_pruned: usize,
}

/// Delete terminal jobs created before `cutoff`. Non-terminal jobs are kept
/// regardless of age; they still have a finalization pending (or lost) and
/// stay visible for operators.
pub fn prune_jobs(
    jobs: &PartitionHandle,
    metadata: &PartitionHandle,
    cutoff: DateTime<Utc>,
) -> Result<Vec<JobRecord>> {
    let mut pruned = Vec::new();
    let mut expired_keys = Vec::new();

    for item in jobs.iter() {
        let (key, value) = item?;
        let record: JobRecord = match serde_json::from_slice(&value) {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, "skipping undecodable job record during prune");
                continue;
            }
        };

        if record.status.is_terminal() && record.created_at < cutoff {
            expired_keys.push(key);
            pruned.push(record);
        }
    }

    for key in expired_keys {
        jobs.remove(key)?;
    }

    metadata.insert(
        encode_meta_key(META_LAST_PRUNE_JOBS),
        Utc::now().timestamp().to_string().as_bytes(),
    )?;

    debug!(count = pruned.len(), "pruned expired jobs");
    Ok(pruned)
}

/// Delete idempotency records older than `ttl`
pub fn prune_idempotency(
    idempotency: &PartitionHandle,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut expired_keys = Vec::new();

    for item in idempotency.iter() {
        let (key, value) = item?;
        let record: IdempotencyRecord = match serde_json::from_slice(&value) {
            Ok(record) => record,
            Err(_) => {
                // Undecodable entries cannot be trusted to expire; drop them
                expired_keys.push(key);
                continue;
            }
        };

        let age = now.signed_duration_since(record.stored_at);
        if age.num_seconds() >= ttl.as_secs() as i64 {
            expired_keys.push(key);
        }
    }

    let count = expired_keys.len();
    for key in expired_keys {
        idempotency.remove(key)?;
    }

    debug!(count, "pruned expired idempotency records");
    Ok(count)
}
