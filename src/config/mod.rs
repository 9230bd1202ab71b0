//! Configuration management for PixTools
//!
//! Layered configuration loaded from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file (`config/pixtools.toml`, override via `PIXTOOLS_CONFIG`)
//! 3. `.env` file (via dotenvy)
//! 4. Environment variables (highest priority), pattern `PIXTOOLS__<section>__<key>`
//!
//! Examples:
//! - `PIXTOOLS__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `PIXTOOLS__LIMITS__MAX_UPLOAD_BYTES=20MB`
//! - `PIXTOOLS__WEBHOOK__FAIL_THRESHOLD=3`

mod models;
mod sources;

pub use crate::humanize::ByteSize;
pub use models::{
    BundlingConfig, Config, LimitsConfig, RetentionConfig, ServerConfig, SigningConfig,
    StorageConfig, StorageProvider, WebhookConfig, WorkerConfig,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl Config {
    /// Load configuration from all sources (file + .env + environment)
    pub fn load() -> Result<Self, ConfigError> {
        Ok(sources::load()?)
    }

    /// Load configuration from a specific path; useful for tests
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        Ok(sources::load_from_sources(path)?)
    }
}
