use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "PIXTOOLS_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/pixtools.toml";
const ENV_PREFIX: &str = "PIXTOOLS";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    // Load .env file if it exists (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;

    load_secrets(&mut config);

    Ok(config)
}

/// Load secrets from environment variables into config.
/// Secrets are never stored in TOML files, only in environment.
fn load_secrets(config: &mut Config) {
    if let Ok(access_key) = env::var("S3_ACCESS_KEY") {
        config.storage.access_key = Some(access_key);
    }
    if let Ok(secret_key) = env::var("S3_SECRET_KEY") {
        config.storage.secret_key = Some(secret_key);
    }

    // Alternative: AWS-style environment variable names
    if config.storage.access_key.is_none() {
        if let Ok(access_key) = env::var("AWS_ACCESS_KEY_ID") {
            config.storage.access_key = Some(access_key);
        }
    }
    if config.storage.secret_key.is_none() {
        if let Ok(secret_key) = env::var("AWS_SECRET_ACCESS_KEY") {
            config.storage.secret_key = Some(secret_key);
        }
    }

    if let Ok(secret) = env::var("PIXTOOLS_SIGNING_SECRET") {
        config.signing.secret = secret;
    }
}

/// Load configuration from a specific path and environment overrides
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::debug!(
            "configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // PIXTOOLS__SERVER__BIND_ADDR -> server.bind_addr
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn load_defaults_only() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("pixtools.toml");

        let toml_content = r#"
[server]
bind_addr = "127.0.0.1:9000"
data_dir = "/var/lib/pixtools"

[storage]
provider = "s3"
bucket = "pixtools-prod"
region = "eu-west-1"

[limits]
max_upload_bytes = "20MB"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.server.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(
            config.server.data_dir,
            std::path::PathBuf::from("/var/lib/pixtools")
        );
        assert_eq!(config.storage.bucket, "pixtools-prod");
        assert_eq!(config.limits.max_upload_bytes.as_u64(), 20 * 1024 * 1024);
    }
}
