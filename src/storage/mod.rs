//! Object store gateway
//!
//! Wraps the `object_store` crate behind the key layout and error classes the
//! rest of the service depends on:
//!
//! - `raw/{job_id}/{original_name}` - uploaded source bytes
//! - `processed/{job_id}/{operation}.{ext}` - per-operation artifacts
//! - `archives/{job_id}.zip` - bundled results
//!
//! Signed URLs are produced locally (HMAC, see [`signer`]) so the gateway
//! works identically over the in-memory backend and S3.

pub mod signer;

pub use signer::UrlSigner;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::TryStreamExt;
use object_store::{ObjectStore, path::Path as StoragePath};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::models::Operation;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transient object store failure: {0}")]
    Transient(String),

    #[error("object store failure: {0}")]
    Permanent(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StorageError::NotFound(path),
            object_store::Error::NotSupported { .. }
            | object_store::Error::NotImplemented
            | object_store::Error::InvalidPath { .. }
            | object_store::Error::Unauthenticated { .. }
            | object_store::Error::PermissionDenied { .. } => {
                StorageError::Permanent(err.to_string())
            }
            other => StorageError::Transient(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Prefixes covered by the retention rules, with their expiry in days
#[derive(Debug, Clone)]
pub struct RetentionRules {
    pub prefixes: Vec<(&'static str, u32)>,
}

/// Gateway over any `object_store` backend
#[derive(Clone)]
pub struct StorageClient {
    store: Arc<dyn ObjectStore>,
    pub bucket: String,
    signer: UrlSigner,
    retention_days: u32,
    retention_ready: Arc<AtomicBool>,
}

impl StorageClient {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: String,
        signer: UrlSigner,
        retention_days: u32,
    ) -> Self {
        Self {
            store,
            bucket,
            signer,
            retention_days,
            retention_ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// In-memory backend for local runs and tests
    pub fn in_memory(signer: UrlSigner) -> Self {
        Self::new(
            Arc::new(object_store::memory::InMemory::new()),
            "pixtools-local".to_string(),
            signer,
            1,
        )
    }

    pub fn raw_key(job_id: &str, original_name: &str) -> String {
        format!("raw/{job_id}/{original_name}")
    }

    pub fn processed_key(job_id: &str, operation: Operation) -> String {
        let ext = operation.output_ext().unwrap_or("bin");
        format!("processed/{job_id}/{operation}.{ext}")
    }

    pub fn archive_key(job_id: &str) -> String {
        format!("archives/{job_id}.zip")
    }

    /// Ensure retention rules exist for the three artifact prefixes.
    /// Idempotent; the rules are enforced by [`StorageClient::apply_retention`]
    /// since the `object_store` API carries no lifecycle calls.
    pub fn ensure_retention(&self) -> RetentionRules {
        let rules = RetentionRules {
            prefixes: vec![
                ("raw/", self.retention_days),
                ("processed/", self.retention_days),
                ("archives/", self.retention_days),
            ],
        };
        if !self.retention_ready.swap(true, Ordering::SeqCst) {
            info!(days = self.retention_days, "retention rules configured");
        }
        rules
    }

    pub async fn put_raw(&self, key: &str, data: Bytes) -> Result<()> {
        self.put(key, data).await
    }

    pub async fn put_processed(&self, key: &str, data: Bytes) -> Result<()> {
        self.put(key, data).await
    }

    pub async fn put_archive(&self, key: &str, data: Bytes) -> Result<()> {
        self.put(key, data).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = StoragePath::from(key);
        let size = data.len();
        self.store.put(&path, data.into()).await?;
        debug!(key, size, "stored object");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let path = StoragePath::from(key);
        let result = self.store.get(&path).await?;
        let bytes = result.bytes().await?;
        debug!(key, size = bytes.len(), "fetched object");
        Ok(bytes)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = StoragePath::from(key);
        self.store.delete(&path).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = StoragePath::from(key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Issue a signed URL for `key`. The URL embeds its own expiry; signing a
    /// key that does not currently exist is refused, though the object may
    /// still disappear before the URL is used.
    pub async fn sign(&self, key: &str) -> Result<String> {
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(self.signer.sign(key, Utc::now()))
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Enforce the retention rules: delete every object under the covered
    /// prefixes whose age exceeds its prefix expiry. Returns the number of
    /// objects deleted.
    pub async fn apply_retention(&self, now: DateTime<Utc>) -> Result<usize> {
        let rules = self.ensure_retention();
        let mut deleted = 0;

        for (prefix, days) in rules.prefixes {
            let cutoff = now - ChronoDuration::days(i64::from(days));
            let path = StoragePath::from(prefix.trim_end_matches('/'));
            let mut stream = self.store.list(Some(&path));

            while let Some(meta) = stream.try_next().await? {
                if meta.last_modified < cutoff {
                    if let Err(e) = self.store.delete(&meta.location).await {
                        warn!(key = %meta.location, error = %e, "retention delete failed");
                    } else {
                        deleted += 1;
                    }
                }
            }
        }

        if deleted > 0 {
            info!(deleted, "retention sweep removed expired objects");
        }
        Ok(deleted)
    }

    /// Cheap availability probe for the health endpoint
    pub async fn health(&self) -> bool {
        match self.store.head(&StoragePath::from("health/probe")).await {
            Ok(_) => true,
            Err(object_store::Error::NotFound { .. }) => true,
            Err(e) => {
                warn!(error = %e, "object store health probe failed");
                false
            }
        }
    }
}

/// Build the configured object-store backend
pub fn build_storage(config: &crate::config::Config) -> Result<StorageClient> {
    let signer = UrlSigner::new(
        config.signing.secret.as_bytes().to_vec(),
        &config.server.public_base_url,
        config.signing.url_ttl(),
    );
    let retention_days = config.storage.s3_retention_days;

    match config.storage.provider {
        crate::config::StorageProvider::Memory => Ok(StorageClient::new(
            Arc::new(object_store::memory::InMemory::new()),
            config.storage.bucket.clone(),
            signer,
            retention_days,
        )),
        crate::config::StorageProvider::S3 => {
            let mut builder = object_store::aws::AmazonS3Builder::new()
                .with_bucket_name(&config.storage.bucket);
            if let Some(region) = &config.storage.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &config.storage.endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            if let Some(access_key) = &config.storage.access_key {
                builder = builder.with_access_key_id(access_key);
            }
            if let Some(secret_key) = &config.storage.secret_key {
                builder = builder.with_secret_access_key(secret_key);
            }
            let store = builder.build().map_err(StorageError::from)?;
            Ok(StorageClient::new(
                Arc::new(store),
                config.storage.bucket.clone(),
                signer,
                retention_days,
            ))
        }
    }
}

/// Retry a storage operation while it fails transiently, with exponential
/// backoff starting at `base_delay`.
pub async fn with_retries<T, F, Fut>(attempts: u32, base_delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                attempt += 1;
                let backoff = base_delay * 2u32.saturating_pow(attempt - 1);
                debug!(attempt, ?backoff, error = %err, "retrying storage operation");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}
