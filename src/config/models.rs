use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub bundling: BundlingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Root directory for the fjall ledger and task queue
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Prefix baked into every signed artifact URL
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl ServerConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("queue")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            public_base_url: default_public_base_url(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

/// Request limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Uploads above this are rejected with 413; exactly at the limit is accepted
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: ByteSize,
    #[serde(default = "default_idempotency_key_max_bytes")]
    pub idempotency_key_max_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            idempotency_key_max_bytes: default_idempotency_key_max_bytes(),
        }
    }
}

fn default_max_upload_bytes() -> ByteSize {
    ByteSize(10 * 1024 * 1024)
}

fn default_idempotency_key_max_bytes() -> usize {
    128
}

/// Object store provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    Memory,
    S3,
}

/// Object store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// S3 access key (loaded from environment, never from config files)
    #[serde(skip)]
    pub access_key: Option<String>,
    /// S3 secret key (loaded from environment, never from config files)
    #[serde(skip)]
    pub secret_key: Option<String>,
    /// Expiry applied to the raw/, processed/ and archives/ prefixes
    #[serde(default = "default_s3_retention_days")]
    pub s3_retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            bucket: default_bucket(),
            endpoint: None,
            region: None,
            access_key: None,
            secret_key: None,
            s3_retention_days: default_s3_retention_days(),
        }
    }
}

fn default_bucket() -> String {
    "pixtools".to_string()
}

fn default_s3_retention_days() -> u32 {
    1
}

/// Signed-URL configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SigningConfig {
    #[serde(default = "default_signing_secret")]
    pub secret: String,
    /// TTL applied to every signed URL
    #[serde(default = "default_presigned_url_expiry_seconds")]
    pub presigned_url_expiry_seconds: u64,
}

impl SigningConfig {
    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.presigned_url_expiry_seconds)
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            secret: default_signing_secret(),
            presigned_url_expiry_seconds: default_presigned_url_expiry_seconds(),
        }
    }
}

fn default_signing_secret() -> String {
    "pixtools-dev-secret".to_string()
}

fn default_presigned_url_expiry_seconds() -> u64 {
    600
}

/// Retention configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Terminal jobs older than this are pruned by the maintenance scheduler
    #[serde(default = "default_job_retention_hours")]
    pub job_retention_hours: u64,
    #[serde(default = "default_idempotency_ttl_seconds")]
    pub idempotency_ttl_seconds: u64,
    #[serde(default = "default_maintenance_interval_seconds")]
    pub maintenance_interval_seconds: u64,
}

impl RetentionConfig {
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_seconds)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_seconds)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            job_retention_hours: default_job_retention_hours(),
            idempotency_ttl_seconds: default_idempotency_ttl_seconds(),
            maintenance_interval_seconds: default_maintenance_interval_seconds(),
        }
    }
}

fn default_job_retention_hours() -> u64 {
    24
}

fn default_idempotency_ttl_seconds() -> u64 {
    86_400
}

fn default_maintenance_interval_seconds() -> u64 {
    3_600
}

/// Webhook delivery + circuit breaker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,
    #[serde(default = "default_reset_timeout_seconds")]
    pub reset_timeout_seconds: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Attempts per delivery while the breaker is closed
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl WebhookConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            fail_threshold: default_fail_threshold(),
            reset_timeout_seconds: default_reset_timeout_seconds(),
            request_timeout_seconds: default_request_timeout_seconds(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_fail_threshold() -> u32 {
    5
}

fn default_reset_timeout_seconds() -> u64 {
    60
}

fn default_request_timeout_seconds() -> u64 {
    5
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Standard pool size; each worker drains its own bounded channel
    #[serde(default = "default_standard_concurrency")]
    pub standard_concurrency: usize,
    /// ML pool size; 1 keeps inference strictly serial for bounded memory
    #[serde(default = "default_ml_concurrency")]
    pub ml_concurrency: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_standard_task_timeout_seconds")]
    pub standard_task_timeout_seconds: u64,
    #[serde(default = "default_ml_task_timeout_seconds")]
    pub ml_task_timeout_seconds: u64,
}

impl WorkerConfig {
    pub fn standard_task_timeout(&self) -> Duration {
        Duration::from_secs(self.standard_task_timeout_seconds)
    }

    pub fn ml_task_timeout(&self) -> Duration {
        Duration::from_secs(self.ml_task_timeout_seconds)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            standard_concurrency: default_standard_concurrency(),
            ml_concurrency: default_ml_concurrency(),
            channel_capacity: default_channel_capacity(),
            standard_task_timeout_seconds: default_standard_task_timeout_seconds(),
            ml_task_timeout_seconds: default_ml_task_timeout_seconds(),
        }
    }
}

fn default_standard_concurrency() -> usize {
    4
}

fn default_ml_concurrency() -> usize {
    1
}

fn default_channel_capacity() -> usize {
    16
}

fn default_standard_task_timeout_seconds() -> u64 {
    60
}

fn default_ml_task_timeout_seconds() -> u64 {
    300
}

/// Archive bundling configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BundlingConfig {
    #[serde(default = "default_bundling_enabled")]
    pub enabled: bool,
}

impl Default for BundlingConfig {
    fn default() -> Self {
        Self {
            enabled: default_bundling_enabled(),
        }
    }
}

fn default_bundling_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = Config::default();

        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.limits.max_upload_bytes.as_u64(), 10 * 1024 * 1024);
        assert_eq!(config.signing.presigned_url_expiry_seconds, 600);
        assert_eq!(config.retention.job_retention_hours, 24);
        assert_eq!(config.webhook.fail_threshold, 5);
        assert_eq!(config.workers.ml_concurrency, 1);
        assert!(config.bundling.enabled);
    }
}
