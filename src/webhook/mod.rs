//! Webhook delivery guarded by a per-host circuit breaker
//!
//! Delivery is at-least-once: a job whose webhook could not be delivered ends
//! in `completed_webhook_failed` and its payload stays retrievable via the
//! status endpoint.

pub mod breaker;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitState};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::models::{JobStatus, Operation};
use crate::config::WebhookConfig;
use crate::observability::Metrics;

/// Outbound completion payload. URLs are freshly signed before each delivery
/// attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub job_id: String,
    pub status: JobStatus,
    pub result_urls: BTreeMap<Operation, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The endpoint acknowledged with 2xx
    Delivered,
    /// The breaker was open; no POST was attempted
    Skipped,
    /// Retries exhausted (or the URL was unusable)
    Failed,
}

/// Webhook delivery layer: bounded retries inside the Closed state, one
/// breaker consultation per delivery.
pub struct WebhookDelivery {
    client: reqwest::Client,
    breakers: BreakerRegistry,
    retry_attempts: u32,
    retry_backoff: Duration,
    metrics: Arc<Metrics>,
}

impl WebhookDelivery {
    pub fn new(config: &WebhookConfig, metrics: Arc<Metrics>) -> Self {
        // Builder failure means the TLS backend is unusable; nothing to
        // deliver webhooks with in that case
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .expect("http client");

        Self {
            client,
            breakers: BreakerRegistry::new(
                BreakerConfig {
                    fail_threshold: config.fail_threshold,
                    reset_timeout: config.reset_timeout(),
                },
                Arc::clone(&metrics),
            ),
            retry_attempts: config.retry_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            metrics,
        }
    }

    /// POST the payload to `url`. An exhausted delivery counts as exactly one
    /// breaker failure for the destination host.
    pub async fn deliver(&self, url: &str, payload: &WebhookPayload) -> DeliveryResult {
        let Some(host) = host_of(url) else {
            warn!(url, "webhook url has no host, delivery failed");
            self.metrics.webhook_failed();
            return DeliveryResult::Failed;
        };

        let breaker = self.breakers.host(&host);
        if !breaker.can_proceed() {
            debug!(host, job_id = %payload.job_id, "webhook skipped, breaker open");
            self.metrics.webhook_skipped();
            return DeliveryResult::Skipped;
        }

        for attempt in 0..self.retry_attempts {
            match self.post_once(url, payload).await {
                Ok(()) => {
                    breaker.record_success();
                    self.metrics.webhook_delivered();
                    debug!(host, job_id = %payload.job_id, "webhook delivered");
                    return DeliveryResult::Delivered;
                }
                Err(err) => {
                    warn!(
                        host,
                        job_id = %payload.job_id,
                        attempt,
                        error = %err,
                        "webhook attempt failed"
                    );
                    if attempt + 1 < self.retry_attempts {
                        tokio::time::sleep(
                            self.retry_backoff * 4u32.saturating_pow(attempt),
                        )
                        .await;
                    }
                }
            }
        }

        breaker.record_failure();
        self.metrics.webhook_failed();
        DeliveryResult::Failed
    }

    async fn post_once(&self, url: &str, payload: &WebhookPayload) -> Result<(), String> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("endpoint returned {}", response.status()))
        }
    }

    /// Breaker state for a destination host (ops/test introspection)
    pub fn breaker_state(&self, host: &str) -> Option<CircuitState> {
        self.breakers.state_of(host)
    }
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Syntactic validation only; reachability is the breaker's problem
pub fn validate_webhook_url(raw: &str) -> Result<(), String> {
    let parsed = url::Url::parse(raw).map_err(|e| e.to_string())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme: {}", parsed.scheme()));
    }
    if parsed.host_str().is_none() {
        return Err("url has no host".to_string());
    }
    Ok(())
}
