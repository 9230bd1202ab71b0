use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::models::{JobRecord, JobStatus, Operation};

use super::error::{LedgerError, Result};
use super::partitions::{encode_idem_key, encode_job_key};
use super::pruning::{self, PruneStats};

/// Idempotency record: client key → the job it produced, with the set time
/// used for TTL expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub job_id: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub stored_at: DateTime<Utc>,
}

/// Fjall-backed job store + idempotency cache
#[derive(Clone)]
pub struct JobStore {
    keyspace: Keyspace,
    jobs: PartitionHandle,
    idempotency: PartitionHandle,
    metadata: PartitionHandle,
    /// Serializes read-modify-write of job records and idempotency set-if-absent
    write_guard: std::sync::Arc<Mutex<()>>,
}

impl JobStore {
    /// Open or create a job store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("opening job ledger at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;

        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let idempotency =
            keyspace.open_partition("idempotency", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            jobs,
            idempotency,
            metadata,
            write_guard: std::sync::Arc::new(Mutex::new(())),
        })
    }

    /// Insert a new job record; the record must not already exist
    pub fn create(&self, record: &JobRecord) -> Result<()> {
        let _guard = self.write_guard.lock();
        let key = encode_job_key(&record.job_id);
        if self.jobs.get(&key)?.is_some() {
            return Err(LedgerError::JobExists(record.job_id.clone()));
        }
        self.jobs.insert(key, serde_json::to_vec(record)?)?;
        debug!(job_id = %record.job_id, "job created");
        Ok(())
    }

    pub fn load(&self, job_id: &str) -> Result<Option<JobRecord>> {
        match self.jobs.get(encode_job_key(job_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Load-mutate-store under the write guard. Returns the updated record,
    /// or `None` when the job does not exist.
    fn mutate<F>(&self, job_id: &str, f: F) -> Result<Option<JobRecord>>
    where
        F: FnOnce(&mut JobRecord),
    {
        let _guard = self.write_guard.lock();
        let key = encode_job_key(job_id);
        let Some(value) = self.jobs.get(&key)? else {
            return Ok(None);
        };

        let mut record: JobRecord = serde_json::from_slice(&value)?;
        f(&mut record);
        record.updated_at = Utc::now();
        self.jobs.insert(key, serde_json::to_vec(&record)?)?;
        Ok(Some(record))
    }

    /// PENDING → PROCESSING, written by the submission endpoint once the
    /// dispatch succeeded
    pub fn mark_processing(&self, job_id: &str) -> Result<()> {
        self.mutate(job_id, |record| {
            if record.status == JobStatus::Pending {
                record.status = JobStatus::Processing;
            }
        })?
        .map(|_| ())
        .ok_or_else(|| LedgerError::JobNotFound(job_id.to_string()))
    }

    /// Terminal transition performed by the finalizer. Returns `false` (and
    /// writes nothing) when the job is already terminal, which makes
    /// redelivered finalizations no-ops.
    pub fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        result_keys: BTreeMap<Operation, String>,
        metadata: Option<BTreeMap<String, String>>,
        error: Option<String>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let mut transitioned = false;
        self.mutate(job_id, |record| {
            if record.status.is_terminal() {
                return;
            }
            record.status = status;
            record.result_keys = result_keys;
            if metadata.is_some() {
                record.metadata = metadata;
            }
            record.error = error;
            transitioned = true;
        })?
        .ok_or_else(|| LedgerError::JobNotFound(job_id.to_string()))?;
        Ok(transitioned)
    }

    /// COMPLETED → COMPLETED_WEBHOOK_FAILED; any other state is left alone
    pub fn set_webhook_failed(&self, job_id: &str) -> Result<bool> {
        let mut transitioned = false;
        self.mutate(job_id, |record| {
            if record.status == JobStatus::Completed {
                record.status = JobStatus::CompletedWebhookFailed;
                transitioned = true;
            }
        })?
        .ok_or_else(|| LedgerError::JobNotFound(job_id.to_string()))?;
        Ok(transitioned)
    }

    /// Written by the archive task after the ZIP object exists
    pub fn set_archive_key(&self, job_id: &str, archive_key: &str) -> Result<()> {
        self.mutate(job_id, |record| {
            record.archive_key = Some(archive_key.to_string());
        })?
        .map(|_| ())
        .ok_or_else(|| LedgerError::JobNotFound(job_id.to_string()))
    }

    /// Idempotency lookup. Expired entries are removed and reported as a miss.
    pub fn check_idempotent(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        let idem_key = encode_idem_key(key);
        let Some(value) = self.idempotency.get(&idem_key)? else {
            return Ok(None);
        };

        let record: IdempotencyRecord = serde_json::from_slice(&value)?;
        let age = Utc::now().signed_duration_since(record.stored_at);
        if age.num_seconds() >= ttl.as_secs() as i64 {
            self.idempotency.remove(idem_key)?;
            return Ok(None);
        }
        Ok(Some(record.job_id))
    }

    /// Atomic set-if-absent: at most one concurrent caller wins; losers learn
    /// the winner's job id on a later `check_idempotent`. Returns whether this
    /// caller won.
    pub fn set_idempotent_if_absent(&self, key: &str, job_id: &str) -> Result<bool> {
        let _guard = self.write_guard.lock();
        let idem_key = encode_idem_key(key);
        if self.idempotency.get(&idem_key)?.is_some() {
            return Ok(false);
        }
        let record = IdempotencyRecord {
            job_id: job_id.to_string(),
            stored_at: Utc::now(),
        };
        self.idempotency.insert(idem_key, serde_json::to_vec(&record)?)?;
        debug!(key, job_id, "idempotency mapping stored");
        Ok(true)
    }

    /// Delete terminal jobs created before `cutoff`; returns the removed
    /// records so the caller can clean up their artifacts
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let _guard = self.write_guard.lock();
        pruning::prune_jobs(&self.jobs, &self.metadata, cutoff)
    }

    /// Drop idempotency records past their TTL; returns the count removed
    pub fn prune_idempotent(&self, ttl: Duration) -> Result<usize> {
        pruning::prune_idempotency(&self.idempotency, ttl, Utc::now())
    }

    /// Combined maintenance pass over both partitions
    pub fn prune_expired(
        &self,
        cutoff: DateTime<Utc>,
        idempotency_ttl: Duration,
    ) -> Result<(Vec<JobRecord>, PruneStats)> {
        let pruned = self.prune_before(cutoff)?;
        let idem = self.prune_idempotent(idempotency_ttl)?;
        let stats = PruneStats {
            jobs_pruned: pruned.len(),
            idempotency_pruned: idem,
        };
        if stats.jobs_pruned > 0 || stats.idempotency_pruned > 0 {
            info!(?stats, "ledger pruning complete");
        }
        Ok((pruned, stats))
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Health check - verify the keyspace is accessible
    pub fn health_check(&self) -> bool {
        match self.jobs.get(b"job:__health__") {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "ledger health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (JobStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = JobStore::open(temp_dir.path().join("ledger")).unwrap();
        (store, temp_dir)
    }

    fn sample_record(job_id: &str) -> JobRecord {
        JobRecord::new(
            job_id.to_string(),
            vec![Operation::Webp, Operation::Metadata],
            format!("raw/{job_id}/input.png"),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn create_and_load() {
        let (store, _temp) = create_test_store();
        store.create(&sample_record("job-1")).unwrap();

        let loaded = store.load("job-1").unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.operations.len(), 2);
        assert!(store.load("job-2").unwrap().is_none());
    }

    #[test]
    fn create_rejects_duplicates() {
        let (store, _temp) = create_test_store();
        store.create(&sample_record("job-1")).unwrap();
        assert!(matches!(
            store.create(&sample_record("job-1")),
            Err(LedgerError::JobExists(_))
        ));
    }

    #[test]
    fn finish_is_idempotent() {
        let (store, _temp) = create_test_store();
        store.create(&sample_record("job-1")).unwrap();
        store.mark_processing("job-1").unwrap();

        let mut keys = BTreeMap::new();
        keys.insert(Operation::Webp, "processed/job-1/webp.webp".to_string());

        let first = store
            .finish("job-1", JobStatus::Completed, keys.clone(), None, None)
            .unwrap();
        assert!(first);

        // A redelivered finalization must not rewrite the record
        let second = store
            .finish(
                "job-1",
                JobStatus::Failed,
                BTreeMap::new(),
                None,
                Some("late duplicate".to_string()),
            )
            .unwrap();
        assert!(!second);

        let loaded = store.load("job-1").unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.result_keys, keys);
        assert!(loaded.error.is_none());
    }

    #[test]
    fn webhook_failed_only_from_completed() {
        let (store, _temp) = create_test_store();
        store.create(&sample_record("job-1")).unwrap();

        assert!(!store.set_webhook_failed("job-1").unwrap());

        store
            .finish("job-1", JobStatus::Completed, BTreeMap::new(), None, None)
            .unwrap();
        assert!(store.set_webhook_failed("job-1").unwrap());

        let loaded = store.load("job-1").unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::CompletedWebhookFailed);
    }

    #[test]
    fn archive_key_set_after_completion() {
        let (store, _temp) = create_test_store();
        store.create(&sample_record("job-1")).unwrap();
        store
            .finish("job-1", JobStatus::Completed, BTreeMap::new(), None, None)
            .unwrap();

        store.set_archive_key("job-1", "archives/job-1.zip").unwrap();
        let loaded = store.load("job-1").unwrap().unwrap();
        assert_eq!(loaded.archive_key.as_deref(), Some("archives/job-1.zip"));
        // Archive write does not disturb the terminal status
        assert_eq!(loaded.status, JobStatus::Completed);
    }

    #[test]
    fn idempotency_set_if_absent() {
        let (store, _temp) = create_test_store();
        let ttl = Duration::from_secs(3600);

        assert!(store.check_idempotent("k1", ttl).unwrap().is_none());
        assert!(store.set_idempotent_if_absent("k1", "job-1").unwrap());
        assert!(!store.set_idempotent_if_absent("k1", "job-2").unwrap());

        // Losers converge on the winner
        assert_eq!(
            store.check_idempotent("k1", ttl).unwrap().as_deref(),
            Some("job-1")
        );
    }

    #[test]
    fn idempotency_expires_after_ttl() {
        let (store, _temp) = create_test_store();
        store.set_idempotent_if_absent("k1", "job-1").unwrap();

        assert!(
            store
                .check_idempotent("k1", Duration::from_secs(0))
                .unwrap()
                .is_none()
        );
        // Expired entry was removed, so a new submission can claim the key
        assert!(store.set_idempotent_if_absent("k1", "job-2").unwrap());
    }

    #[test]
    fn survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger");

        {
            let store = JobStore::open(&path).unwrap();
            store.create(&sample_record("job-1")).unwrap();
            store.persist().unwrap();
        }

        let store = JobStore::open(&path).unwrap();
        assert!(store.load("job-1").unwrap().is_some());
    }
}
