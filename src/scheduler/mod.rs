//! Maintenance scheduler
//!
//! A fixed-cadence tick (default hourly) that prunes terminal jobs past the
//! retention window, deletes their artifacts, expires idempotency records,
//! and sweeps the object-store retention rules.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, RetentionConfig};
use crate::ledger::JobStore;
use crate::storage::{self, StorageClient, StorageError};

#[derive(Debug, Default, Clone, Copy)]
pub struct MaintenanceReport {
    pub jobs_pruned: usize,
    pub idempotency_pruned: usize,
    pub objects_deleted: usize,
}

pub struct Maintenance {
    store: Arc<JobStore>,
    storage: Arc<StorageClient>,
    job_retention: ChronoDuration,
    idempotency_ttl: Duration,
    interval: Duration,
}

impl Maintenance {
    pub fn new(
        store: Arc<JobStore>,
        storage: Arc<StorageClient>,
        retention: &RetentionConfig,
    ) -> Self {
        Self {
            store,
            storage,
            job_retention: ChronoDuration::hours(retention.job_retention_hours as i64),
            idempotency_ttl: retention.idempotency_ttl(),
            interval: retention.maintenance_interval(),
        }
    }

    /// Run the maintenance loop until the task is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The immediate first tick doubles as the startup retention check
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    /// One maintenance pass
    pub async fn tick(&self) -> MaintenanceReport {
        let now = Utc::now();
        let cutoff = now - self.job_retention;
        let mut report = MaintenanceReport::default();

        match self.store.prune_expired(cutoff, self.idempotency_ttl) {
            Ok((records, stats)) => {
                report.jobs_pruned = stats.jobs_pruned;
                report.idempotency_pruned = stats.idempotency_pruned;

                // Remove artifacts the pruned records still reference
                for record in records {
                    let mut keys: Vec<String> =
                        record.result_keys.values().cloned().collect();
                    keys.push(record.source_key.clone());
                    if let Some(archive_key) = &record.archive_key {
                        keys.push(archive_key.clone());
                    }

                    for key in keys {
                        match self.storage.delete(&key).await {
                            Ok(()) => report.objects_deleted += 1,
                            // Already expired by the retention rules
                            Err(StorageError::NotFound(_)) => {}
                            Err(e) => {
                                warn!(key, error = %e, "artifact delete failed during prune")
                            }
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "ledger prune failed"),
        }

        match self.storage.apply_retention(now).await {
            Ok(deleted) => report.objects_deleted += deleted,
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }

        if let Err(e) = self.store.persist() {
            warn!(error = %e, "ledger persist after prune failed");
        }

        info!(
            jobs = report.jobs_pruned,
            idempotency = report.idempotency_pruned,
            objects = report.objects_deleted,
            "maintenance tick complete"
        );
        report
    }
}

/// One-shot maintenance pass for `pixtools prune`
pub async fn prune_once(
    config: &Config,
) -> Result<MaintenanceReport, Box<dyn std::error::Error + Send + Sync>> {
    let store = Arc::new(JobStore::open(config.server.ledger_path())?);
    let storage = Arc::new(storage::build_storage(config)?);
    storage.ensure_retention();

    let maintenance = Maintenance::new(store, storage, &config.retention);
    Ok(maintenance.tick().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{JobRecord, JobStatus, Operation};
    use crate::storage::UrlSigner;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn retention_hours(hours: u64) -> RetentionConfig {
        RetentionConfig {
            job_retention_hours: hours,
            idempotency_ttl_seconds: 3600,
            maintenance_interval_seconds: 3600,
        }
    }

    async fn terminal_job_with_artifacts(
        store: &JobStore,
        storage: &StorageClient,
        job_id: &str,
        age_hours: i64,
    ) {
        let created = Utc::now() - ChronoDuration::hours(age_hours);
        let source_key = format!("raw/{job_id}/in.png");
        let result_key = format!("processed/{job_id}/webp.webp");

        storage
            .put_raw(&source_key, Bytes::from_static(b"src"))
            .await
            .unwrap();
        storage
            .put_processed(&result_key, Bytes::from_static(b"out"))
            .await
            .unwrap();

        let record = JobRecord::new(
            job_id.to_string(),
            vec![Operation::Webp],
            source_key,
            None,
            created,
        );
        store.create(&record).unwrap();

        let mut keys = BTreeMap::new();
        keys.insert(Operation::Webp, result_key);
        store
            .finish(job_id, JobStatus::Completed, keys, None, None)
            .unwrap();
    }

    #[tokio::test]
    async fn tick_prunes_expired_jobs_and_their_artifacts() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(JobStore::open(temp.path().join("ledger")).unwrap());
        let storage = Arc::new(StorageClient::in_memory(UrlSigner::new(
            "test",
            "http://localhost:8080",
            Duration::from_secs(600),
        )));

        terminal_job_with_artifacts(&store, &storage, "old", 48).await;
        terminal_job_with_artifacts(&store, &storage, "fresh", 1).await;

        let maintenance = Maintenance::new(
            Arc::clone(&store),
            Arc::clone(&storage),
            &retention_hours(24),
        );
        let report = maintenance.tick().await;

        assert_eq!(report.jobs_pruned, 1);
        assert!(store.load("old").unwrap().is_none());
        assert!(store.load("fresh").unwrap().is_some());

        // Pruned artifacts are gone; the fresh job's remain
        assert!(!storage.exists("raw/old/in.png").await.unwrap());
        assert!(!storage.exists("processed/old/webp.webp").await.unwrap());
        assert!(storage.exists("processed/fresh/webp.webp").await.unwrap());
    }

    #[tokio::test]
    async fn tick_is_safe_on_an_empty_store() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(JobStore::open(temp.path().join("ledger")).unwrap());
        let storage = Arc::new(StorageClient::in_memory(UrlSigner::new(
            "test",
            "http://localhost:8080",
            Duration::from_secs(600),
        )));

        let maintenance = Maintenance::new(store, storage, &retention_hours(24));
        let report = maintenance.tick().await;

        assert_eq!(report.jobs_pruned, 0);
        assert_eq!(report.objects_deleted, 0);
    }
}
