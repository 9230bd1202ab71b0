//! Task runner: executes one task message, reports its fan-out outcome, and
//! acknowledges the message late (only after the outcome is settled).

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::api::models::{Operation, OperationParams};
use crate::archive;
use crate::plan::{TaskKind, TaskMessage};
use crate::processing::{EngineError, sniff_format};
use crate::queue::{TaskEnvelope, TaskOutcome};
use crate::storage::{StorageClient, StorageError};

use super::WorkerContext;

#[derive(Debug, Error)]
enum TaskError {
    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("source bytes are not a recognized image container")]
    UnrecognizedSource,

    #[error("task exceeded its {0:?} time bound")]
    Timeout(std::time::Duration),
}

impl TaskError {
    fn is_transient(&self) -> bool {
        match self {
            TaskError::Storage(e) => e.is_transient(),
            TaskError::Engine(e) => e.is_transient(),
            TaskError::UnrecognizedSource => false,
            // A timed-out task is marked failed, not retried
            TaskError::Timeout(_) => false,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            TaskError::Storage(StorageError::NotFound(_)) => "SOURCE_NOT_FOUND",
            TaskError::Storage(_) => "STORAGE_ERROR",
            TaskError::Engine(_) => "ENGINE_ERROR",
            TaskError::UnrecognizedSource => "UNRECOGNIZED_SOURCE",
            TaskError::Timeout(_) => "TASK_TIMEOUT",
        }
    }
}

/// Execute one envelope end-to-end: run, ack (or dead-letter), report the
/// outcome, and fire finalization when this was the chord's last sibling.
pub async fn run_task(ctx: &WorkerContext, envelope: TaskEnvelope) {
    let TaskEnvelope { seq, task } = envelope;

    match task.kind.clone() {
        TaskKind::Process { operation, params } => {
            run_process(ctx, seq, &task, operation, &params).await;
        }
        TaskKind::Archive { result_keys } => {
            run_archive(ctx, seq, &task, &result_keys).await;
        }
    }
}

async fn run_process(
    ctx: &WorkerContext,
    seq: u64,
    task: &TaskMessage,
    operation: Operation,
    params: &OperationParams,
) {
    let timeout = ctx.timeouts.for_queue(task.queue());
    let mut attempt = task.attempt;

    // `dead_letter` carries (code, message, attempts) when the task exhausted
    // its budget; None means it succeeded
    let (outcome, dead_letter) = loop {
        let result = match tokio::time::timeout(
            timeout,
            execute(ctx, task, operation, params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TaskError::Timeout(timeout)),
        };

        match result {
            Ok(outcome) => {
                debug!(
                    seq,
                    job_id = %task.job_id,
                    operation = %operation,
                    correlation_id = %task.correlation_id,
                    "task succeeded"
                );
                break (outcome, None);
            }
            Err(err) if err.is_transient() && attempt < task.retry.max_retries => {
                warn!(
                    seq,
                    job_id = %task.job_id,
                    operation = %operation,
                    attempt,
                    error = %err,
                    "transient task failure, retrying"
                );
                ctx.metrics.task_retried();
                tokio::time::sleep(task.retry.backoff(attempt)).await;
                attempt += 1;
            }
            Err(err) => {
                info!(
                    seq,
                    job_id = %task.job_id,
                    operation = %operation,
                    attempts = attempt + 1,
                    error = %err,
                    "task failed permanently"
                );
                let failure = (err.code(), err.to_string(), attempt + 1);
                break (
                    TaskOutcome::Failed {
                        operation,
                        error: err.to_string(),
                    },
                    Some(failure),
                );
            }
        }
    };

    report(ctx, &task.job_id, outcome).await;

    // Settle the message only after the outcome reached the chord join (late
    // ack): a worker killed before this point leaves the task pending, so the
    // startup requeue redelivers and re-reports it instead of losing it
    match dead_letter {
        None => {
            if let Err(e) = ctx.queue.ack(seq) {
                warn!(seq, error = %e, "ack failed, task may be redelivered");
            }
        }
        Some((code, message, attempts)) => {
            if let Err(e) = ctx.queue.move_to_dlq(seq, code, &message, attempts) {
                error!(seq, error = %e, "dead-letter move failed");
            }
            ctx.metrics.task_dead_lettered();
        }
    }
}

/// One attempt: fetch the source, run the engine, store the artifact
async fn execute(
    ctx: &WorkerContext,
    task: &TaskMessage,
    operation: Operation,
    params: &OperationParams,
) -> Result<TaskOutcome, TaskError> {
    let input = ctx.storage.get(&task.source_key).await?;

    match operation {
        Operation::Metadata => {
            let metadata = ctx.engine.extract_metadata(input).await?;
            Ok(TaskOutcome::Extracted { metadata })
        }
        Operation::Denoise => {
            let output = ctx.engine.denoise(input).await?;
            let key = store_artifact(ctx, &task.job_id, operation, output).await?;
            Ok(TaskOutcome::Stored { operation, key })
        }
        conversion => {
            let source = sniff_format(&input).ok_or(TaskError::UnrecognizedSource)?;
            let output = ctx.engine.convert(input, source, conversion, params).await?;
            let key = store_artifact(ctx, &task.job_id, conversion, output).await?;
            Ok(TaskOutcome::Stored {
                operation: conversion,
                key,
            })
        }
    }
}

async fn store_artifact(
    ctx: &WorkerContext,
    job_id: &str,
    operation: Operation,
    bytes: Bytes,
) -> Result<String, TaskError> {
    let key = StorageClient::processed_key(job_id, operation);
    ctx.storage.put_processed(&key, bytes).await?;
    Ok(key)
}

/// Feed the outcome into the chord join; the last sibling runs finalization
async fn report(ctx: &WorkerContext, job_id: &str, outcome: TaskOutcome) {
    if let Some(outcomes) = ctx.tracker.complete(job_id, outcome) {
        ctx.finalizer.run(job_id, outcomes).await;
    }
}

async fn run_archive(
    ctx: &WorkerContext,
    seq: u64,
    task: &TaskMessage,
    result_keys: &std::collections::BTreeMap<Operation, String>,
) {
    match archive::build_and_store(&ctx.storage, &task.job_id, result_keys).await {
        Ok(archive_key) => {
            if let Err(e) = ctx.store.set_archive_key(&task.job_id, &archive_key) {
                error!(job_id = %task.job_id, error = %e, "archive key write failed");
            }
            ctx.metrics.archive_written();
            if let Err(e) = ctx.queue.ack(seq) {
                warn!(seq, error = %e, "ack failed for archive task");
            }
        }
        Err(err) => {
            // Non-fatal for the job: it stays COMPLETED without an archive.
            // The message is preserved in the dead-letter queue for operators.
            warn!(job_id = %task.job_id, error = %err, "archive task failed");
            if let Err(e) = ctx
                .queue
                .move_to_dlq(seq, "ARCHIVE_FAILED", &err.to_string(), task.attempt + 1)
            {
                error!(seq, error = %e, "dead-letter move failed for archive task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{JobRecord, JobStatus};
    use crate::config::WebhookConfig;
    use crate::finalize::Finalizer;
    use crate::ledger::JobStore;
    use crate::observability::Metrics;
    use crate::plan::{Plan, build_plan};
    use crate::processing::test_fixtures::png_bytes;
    use crate::processing::{ImageEngine, ImageFormat, PassthroughEngine};
    use crate::queue::{FjallQueue, TaskBroker};
    use crate::storage::UrlSigner;
    use crate::webhook::WebhookDelivery;
    use crate::worker::TaskTimeouts;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Engine whose denoise path always fails permanently
    struct BrokenDenoise;

    #[async_trait]
    impl ImageEngine for BrokenDenoise {
        async fn convert(
            &self,
            input: Bytes,
            source: ImageFormat,
            target: Operation,
            params: &OperationParams,
        ) -> Result<Bytes, EngineError> {
            PassthroughEngine::new().convert(input, source, target, params).await
        }

        async fn denoise(&self, _input: Bytes) -> Result<Bytes, EngineError> {
            Err(EngineError::Permanent("model weights missing".to_string()))
        }

        async fn extract_metadata(
            &self,
            input: Bytes,
        ) -> Result<BTreeMap<String, String>, EngineError> {
            PassthroughEngine::new().extract_metadata(input).await
        }
    }

    struct Fixture {
        ctx: Arc<WorkerContext>,
        store: Arc<JobStore>,
        queue: Arc<FjallQueue>,
        broker: Arc<TaskBroker>,
        _temp: TempDir,
    }

    fn fixture(engine: Arc<dyn ImageEngine>) -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(JobStore::open(temp.path().join("ledger")).unwrap());
        let storage = Arc::new(StorageClient::in_memory(UrlSigner::new(
            "test",
            "http://localhost:8080",
            Duration::from_secs(600),
        )));
        let queue = Arc::new(FjallQueue::open(temp.path().join("queue")).unwrap());
        let metrics = Arc::new(Metrics::new());
        let (broker, _rx) = TaskBroker::new(Arc::clone(&queue), 1, 1, 8);
        let broker = Arc::new(broker);
        let webhook = Arc::new(WebhookDelivery::new(
            &WebhookConfig::default(),
            Arc::clone(&metrics),
        ));
        let finalizer = Arc::new(Finalizer::new(
            Arc::clone(&store),
            Arc::clone(&storage),
            Arc::clone(&broker),
            webhook,
            Arc::clone(&metrics),
            true,
        ));

        let ctx = Arc::new(WorkerContext {
            queue: Arc::clone(&queue),
            storage,
            engine,
            tracker: broker.tracker(),
            finalizer,
            store: Arc::clone(&store),
            metrics,
            timeouts: TaskTimeouts::default(),
        });

        Fixture {
            ctx,
            store,
            queue,
            broker,
            _temp: temp,
        }
    }

    async fn seed_job(fx: &Fixture, job_id: &str, operations: &[Operation]) -> Plan {
        let source_key = format!("raw/{job_id}/in.png");
        fx.ctx
            .storage
            .put_raw(&source_key, Bytes::from(png_bytes()))
            .await
            .unwrap();

        let record = JobRecord::new(
            job_id.to_string(),
            operations.to_vec(),
            source_key.clone(),
            None,
            Utc::now(),
        );
        fx.store.create(&record).unwrap();
        fx.store.mark_processing(job_id).unwrap();

        let plan = build_plan(job_id, &source_key, operations, &BTreeMap::new(), job_id);
        fx.broker.tracker().register(job_id, plan.expected_outcomes());
        plan
    }

    fn envelope_for(fx: &Fixture, task: &TaskMessage) -> TaskEnvelope {
        let seq = fx.queue.enqueue(task).unwrap();
        TaskEnvelope {
            seq,
            task: task.clone(),
        }
    }

    #[tokio::test]
    async fn single_conversion_runs_to_completion() {
        let fx = fixture(Arc::new(PassthroughEngine::new()));
        let plan = seed_job(&fx, "j", &[Operation::Webp]).await;

        for task in plan.tasks() {
            run_task(&fx.ctx, envelope_for(&fx, task)).await;
        }

        let job = fx.store.load("j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            job.result_keys.get(&Operation::Webp).map(String::as_str),
            Some("processed/j/webp.webp")
        );
        assert!(fx.ctx.storage.exists("processed/j/webp.webp").await.unwrap());
    }

    #[tokio::test]
    async fn failing_denoise_dead_letters_and_partially_completes() {
        let fx = fixture(Arc::new(BrokenDenoise));
        let plan = seed_job(&fx, "j", &[Operation::Webp, Operation::Denoise]).await;

        for task in plan.tasks() {
            run_task(&fx.ctx, envelope_for(&fx, task)).await;
        }

        let job = fx.store.load("j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result_keys.contains_key(&Operation::Webp));
        assert!(!job.result_keys.contains_key(&Operation::Denoise));
        assert!(job.error.unwrap().contains("model weights missing"));

        let dlq = fx.queue.list_dlq(10).unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].1.failure_code, "ENGINE_ERROR");
    }

    #[tokio::test]
    async fn metadata_outcome_populates_the_job() {
        let fx = fixture(Arc::new(PassthroughEngine::new()));
        let plan = seed_job(&fx, "j", &[Operation::Metadata]).await;

        for task in plan.tasks() {
            run_task(&fx.ctx, envelope_for(&fx, task)).await;
        }

        let job = fx.store.load("j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result_keys.is_empty());
        let metadata = job.metadata.unwrap();
        assert_eq!(metadata.get("format").map(String::as_str), Some("png"));
    }

    #[tokio::test]
    async fn missing_source_fails_the_operation() {
        let fx = fixture(Arc::new(PassthroughEngine::new()));
        // Job record exists but the raw object was never uploaded
        let record = JobRecord::new(
            "j".to_string(),
            vec![Operation::Webp],
            "raw/j/in.png".to_string(),
            None,
            Utc::now(),
        );
        fx.store.create(&record).unwrap();
        fx.broker.tracker().register("j", 1);

        let plan = build_plan("j", "raw/j/in.png", &[Operation::Webp], &BTreeMap::new(), "j");
        for task in plan.tasks() {
            run_task(&fx.ctx, envelope_for(&fx, task)).await;
        }

        let job = fx.store.load("j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        let dlq = fx.queue.list_dlq(10).unwrap();
        assert_eq!(dlq[0].1.failure_code, "SOURCE_NOT_FOUND");
    }

    #[tokio::test]
    async fn archive_task_writes_the_bundle_and_the_key() {
        let fx = fixture(Arc::new(PassthroughEngine::new()));
        let plan = seed_job(&fx, "j", &[Operation::Webp]).await;

        for task in plan.tasks() {
            run_task(&fx.ctx, envelope_for(&fx, task)).await;
        }

        // The finalizer queued an archive task; run it like a worker would
        let pending = fx.queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        let (seq, task) = pending.into_iter().next().unwrap();
        run_task(&fx.ctx, TaskEnvelope { seq, task }).await;

        let job = fx.store.load("j").unwrap().unwrap();
        assert_eq!(job.archive_key.as_deref(), Some("archives/j.zip"));
        assert!(fx.ctx.storage.exists("archives/j.zip").await.unwrap());
        assert!(fx.queue.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn task_timeout_is_a_permanent_failure() {
        struct SlowEngine;

        #[async_trait]
        impl ImageEngine for SlowEngine {
            async fn convert(
                &self,
                _input: Bytes,
                _source: ImageFormat,
                _target: Operation,
                _params: &OperationParams,
            ) -> Result<Bytes, EngineError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }

            async fn denoise(&self, input: Bytes) -> Result<Bytes, EngineError> {
                Ok(input)
            }

            async fn extract_metadata(
                &self,
                _input: Bytes,
            ) -> Result<BTreeMap<String, String>, EngineError> {
                Ok(BTreeMap::new())
            }
        }

        let mut fx = fixture(Arc::new(SlowEngine));
        let ctx = Arc::get_mut(&mut fx.ctx).unwrap();
        ctx.timeouts = TaskTimeouts {
            standard: Duration::from_millis(50),
            ml: Duration::from_millis(50),
        };

        let plan = seed_job(&fx, "j", &[Operation::Webp]).await;
        for task in plan.tasks() {
            run_task(&fx.ctx, envelope_for(&fx, task)).await;
        }

        let job = fx.store.load("j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        let dlq = fx.queue.list_dlq(10).unwrap();
        assert_eq!(dlq[0].1.failure_code, "TASK_TIMEOUT");
    }
}
