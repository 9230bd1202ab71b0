use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::services::{get_artifact, get_job, health, submit_job};
use super::state::AppState;
use crate::config::Config;
use crate::finalize::Finalizer;
use crate::ledger::JobStore;
use crate::observability::Metrics;
use crate::processing::{ImageEngine, PassthroughEngine};
use crate::queue::{FjallQueue, TaskBroker};
use crate::scheduler::Maintenance;
use crate::storage;
use crate::webhook::WebhookDelivery;
use crate::worker::{TaskTimeouts, WorkerContext, spawn_workers};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Headroom for multipart framing on top of the file-size limit
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// A fully wired service: shared state plus the running worker pools.
/// The maintenance loop is returned unspawned so callers (and tests) decide
/// when it ticks.
pub struct Service {
    pub state: AppState,
    pub workers: Vec<JoinHandle<()>>,
    pub maintenance: Arc<Maintenance>,
}

/// Wire every component from configuration: ledger, queue, storage, broker,
/// worker pools, finalizer, webhook delivery. Unacknowledged tasks from a
/// previous run are requeued before this returns.
pub async fn build(config: Config, engine: Arc<dyn ImageEngine>) -> Result<Service, AnyError> {
    let config = Arc::new(config);

    info!(path = %config.server.ledger_path().display(), "opening job ledger");
    let store = Arc::new(JobStore::open(config.server.ledger_path())?);

    info!(path = %config.server.queue_path().display(), "opening task queue");
    let queue = Arc::new(FjallQueue::open(config.server.queue_path())?);

    let storage = Arc::new(storage::build_storage(&config)?);
    storage.ensure_retention();

    let metrics = Arc::new(Metrics::new());

    let (broker, receivers) = TaskBroker::new(
        Arc::clone(&queue),
        config.workers.standard_concurrency,
        config.workers.ml_concurrency,
        config.workers.channel_capacity,
    );
    let broker = Arc::new(broker);

    let webhook = Arc::new(WebhookDelivery::new(&config.webhook, Arc::clone(&metrics)));
    let finalizer = Arc::new(Finalizer::new(
        Arc::clone(&store),
        Arc::clone(&storage),
        Arc::clone(&broker),
        webhook,
        Arc::clone(&metrics),
        config.bundling.enabled,
    ));

    let ctx = Arc::new(WorkerContext {
        queue: Arc::clone(&queue),
        storage: Arc::clone(&storage),
        engine,
        tracker: broker.tracker(),
        finalizer,
        store: Arc::clone(&store),
        metrics: Arc::clone(&metrics),
        timeouts: TaskTimeouts {
            standard: config.workers.standard_task_timeout(),
            ml: config.workers.ml_task_timeout(),
        },
    });
    let workers = spawn_workers(ctx, receivers);

    // Requeue whatever a previous process left unacknowledged
    broker.recover().await?;

    let maintenance = Arc::new(Maintenance::new(
        Arc::clone(&store),
        Arc::clone(&storage),
        &config.retention,
    ));

    let state = AppState::new(config, store, storage, broker, metrics);

    Ok(Service {
        state,
        workers,
        maintenance,
    })
}

/// Assemble the HTTP router over a wired state
pub fn router(state: AppState) -> Router {
    let body_cap =
        (state.config.limits.max_upload_bytes.as_u64() + MULTIPART_OVERHEAD) as usize;

    Router::new()
        .route("/api/process", post(submit_job))
        .route("/api/jobs/{job_id}", get(get_job))
        .route("/api/artifacts/{*key}", get(get_artifact))
        .route("/api/health", get(health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_cap))
        .layer(RequestBodyLimitLayer::new(body_cap))
        .layer(TraceLayer::new_for_http())
}

/// Run the full service: API, worker pools and maintenance scheduler in one
/// process.
pub async fn run(config: Config) -> Result<(), AnyError> {
    let bind_addr = config.server.bind_addr;
    let service = build(config, Arc::new(PassthroughEngine::new())).await?;

    let maintenance_handle = Arc::clone(&service.maintenance).spawn();
    let app = router(service.state.clone());

    let listener = TcpListener::bind(bind_addr).await?;
    info!(address = %bind_addr, "pixtools API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance_handle.abort();
    for worker in service.workers {
        worker.abort();
    }
    service.state.store.persist()?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
