use std::sync::Arc;

use crate::config::Config;
use crate::ledger::JobStore;
use crate::observability::Metrics;
use crate::queue::TaskBroker;
use crate::storage::StorageClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<JobStore>,
    pub storage: Arc<StorageClient>,
    pub broker: Arc<TaskBroker>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<JobStore>,
        storage: Arc<StorageClient>,
        broker: Arc<TaskBroker>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            store,
            storage,
            broker,
            metrics,
        }
    }
}
