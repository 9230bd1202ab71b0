//! Finalization: the join-point invoked after all siblings of a chord (or
//! the single task of a chain) terminate.
//!
//! The finalizer is the only writer of terminal job state. Redelivered
//! invocations find the job already terminal and exit without side effects.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::api::models::{JobRecord, JobStatus, Operation};
use crate::ledger::JobStore;
use crate::observability::Metrics;
use crate::plan::archive_task;
use crate::queue::{TaskBroker, TaskOutcome};
use crate::storage::StorageClient;
use crate::webhook::{DeliveryResult, WebhookDelivery, WebhookPayload};

pub struct Finalizer {
    store: Arc<JobStore>,
    storage: Arc<StorageClient>,
    broker: Arc<TaskBroker>,
    webhook: Arc<WebhookDelivery>,
    metrics: Arc<Metrics>,
    bundling_enabled: bool,
}

impl Finalizer {
    pub fn new(
        store: Arc<JobStore>,
        storage: Arc<StorageClient>,
        broker: Arc<TaskBroker>,
        webhook: Arc<WebhookDelivery>,
        metrics: Arc<Metrics>,
        bundling_enabled: bool,
    ) -> Self {
        Self {
            store,
            storage,
            broker,
            webhook,
            metrics,
            bundling_enabled,
        }
    }

    /// Aggregate the fan-out outcomes for `job_id` and drive the job to its
    /// terminal state. Errors are absorbed and logged; a join-point task has
    /// nobody left to propagate to.
    pub async fn run(&self, job_id: &str, outcomes: Vec<TaskOutcome>) {
        let job = match self.store.load(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id, "finalization for unknown job dropped");
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "failed to load job for finalization");
                return;
            }
        };

        if job.status.is_terminal() {
            info!(job_id, status = job.status.as_str(), "job already terminal, finalization is a no-op");
            return;
        }

        let mut result_keys: BTreeMap<Operation, String> = BTreeMap::new();
        let mut metadata: Option<BTreeMap<String, String>> = None;
        let mut failures: Vec<(Operation, String)> = Vec::new();

        for outcome in outcomes {
            match outcome {
                TaskOutcome::Stored { operation, key } => {
                    result_keys.insert(operation, key);
                }
                TaskOutcome::Extracted { metadata: map } => {
                    metadata.get_or_insert_with(BTreeMap::new).extend(map);
                }
                TaskOutcome::Failed { operation, error } => {
                    failures.push((operation, error));
                }
            }
        }

        let error_text = if failures.is_empty() {
            None
        } else {
            Some(
                failures
                    .iter()
                    .map(|(op, err)| format!("{op}: {err}"))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };

        // Partial failure is permitted, but the FAILED decision looks only at
        // image-producing outcomes: a surviving metadata extraction is merged
        // either way and does not rescue the job. Metadata-only jobs have no
        // image outcomes and complete on the strength of the extraction alone.
        let image_ops_requested = job.operations.iter().any(|op| op.produces_image());
        let status = if image_ops_requested {
            if result_keys.is_empty() {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            }
        } else if metadata.is_some() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };

        let transitioned = match self.store.finish(
            job_id,
            status,
            result_keys.clone(),
            metadata.clone(),
            error_text.clone(),
        ) {
            Ok(t) => t,
            Err(e) => {
                error!(job_id, error = %e, "terminal transition failed");
                return;
            }
        };
        if !transitioned {
            info!(job_id, "lost the terminal race, skipping side effects");
            return;
        }

        match status {
            JobStatus::Completed => self.metrics.job_completed(),
            _ => self.metrics.job_failed(),
        }
        info!(
            job_id,
            status = status.as_str(),
            results = result_keys.len(),
            failures = failures.len(),
            "job finalized"
        );

        // The archive races the client's first status poll by design; the
        // COMPLETED transition above is already durable
        if status == JobStatus::Completed && self.bundling_enabled && !result_keys.is_empty() {
            let task = archive_task(job_id, &job.source_key, result_keys.clone(), &job.job_id);
            if let Err(e) = self.broker.enqueue(task).await {
                warn!(job_id, error = %e, "archive dispatch failed, job stays completed without a bundle");
            }
        }

        if let Some(url) = job.webhook_url.clone() {
            let payload = self
                .build_payload(&job, status, &result_keys, metadata, error_text)
                .await;
            match self.webhook.deliver(&url, &payload).await {
                DeliveryResult::Delivered => {}
                DeliveryResult::Skipped | DeliveryResult::Failed => {
                    if let Err(e) = self.store.set_webhook_failed(job_id) {
                        error!(job_id, error = %e, "failed to record webhook failure");
                    }
                }
            }
        }
    }

    /// Sign fresh URLs for the payload; unsignable keys are omitted rather
    /// than failing the delivery
    async fn build_payload(
        &self,
        job: &JobRecord,
        status: JobStatus,
        result_keys: &BTreeMap<Operation, String>,
        metadata: Option<BTreeMap<String, String>>,
        error: Option<String>,
    ) -> WebhookPayload {
        let mut result_urls = BTreeMap::new();
        for (operation, key) in result_keys {
            match self.storage.sign(key).await {
                Ok(url) => {
                    result_urls.insert(*operation, url);
                }
                Err(e) => warn!(job_id = %job.job_id, key, error = %e, "could not sign result url"),
            }
        }

        let archive_url = match &job.archive_key {
            Some(key) => self.storage.sign(key).await.ok(),
            None => None,
        };

        WebhookPayload {
            job_id: job.job_id.clone(),
            status,
            result_urls,
            archive_url,
            metadata,
            error,
        }
    }
}
