//! Configuration loading and XDG path helpers.

use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;
use strum::{AsRefStr, EnumString};
use thiserror::Error;

use crate::paths::{AppPaths, PathError, project_dirs};

const CONFIG_FILE_STEM: &str = "settings";
const LOCAL_CONFIG_FILE: &str = "config/settings";
const ETC_CONFIG_DIR: &str = "/etc";
const ENV_PREFIX: &str = "DOCFLOW";
const ENV_ETC_CONFIG_DIR: &str = "DOCFLOW_ETC_CONFIG_DIR";
const ENV_CONFIG_FILE: &str = "DOCFLOW_CONFIG_FILE";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub stream: StreamConfig,
    pub checkpoint: CheckpointConfig,
    pub records: RecordsConfig,
    pub extraction: ExtractionConfig,
    pub downstream: DownstreamConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `fs` or `s3`.
    pub backend: String,
    /// Bucket holding inbound documents.
    pub bucket: String,
    /// Root directory of the `fs` backend.
    pub path: PathBuf,
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3StorageConfig {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    pub name: String,
    /// Event-stream connection; for the spool source this is a directory.
    pub connection: PathBuf,
    pub consumer_group: String,
    pub max_event_batch_size: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    pub container: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordsConfig {
    /// Document-store location (LMDB environment directory).
    pub connection: PathBuf,
    pub collection: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    pub request_timeout_secs: u64,
    pub requests_per_second: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuthScheme {
    /// `API-Key: <token>`
    ApiKey,
    /// `Authorization: Bearer <token>`
    Bearer,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownstreamConfig {
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub auth_scheme: AuthScheme,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_api_tries: u32,
    /// Base wait in seconds, doubled on every attempt.
    pub retry_exp_wait_multiplier: f64,
    /// Upper bound for a single wait in seconds.
    pub retry_wait_max: f64,
}

impl AppConfig {
    /// Reject settings the consumer cannot run with before any component is built.
    pub fn validate_for_consumer(&self) -> Result<(), AppConfigError> {
        if self.storage.bucket.trim().is_empty() {
            return Err(AppConfigError::Invalid("storage.bucket must be set".into()));
        }
        if self.extraction.endpoint.trim().is_empty() {
            return Err(AppConfigError::Invalid(
                "extraction.endpoint must be set".into(),
            ));
        }
        if self.downstream.api_url.trim().is_empty() {
            return Err(AppConfigError::Invalid(
                "downstream.api_url must be set".into(),
            ));
        }
        if self.stream.max_event_batch_size == 0 {
            return Err(AppConfigError::Invalid(
                "stream.max_event_batch_size must be > 0".into(),
            ));
        }
        self.validate_retry()
    }

    /// Retry tuning must be finite and ordered; checked by every command that retries.
    pub fn validate_retry(&self) -> Result<(), AppConfigError> {
        let retry = &self.retry;
        if retry.max_api_tries == 0 {
            return Err(AppConfigError::Invalid(
                "retry.max_api_tries must be > 0".into(),
            ));
        }
        let finite = retry.retry_exp_wait_multiplier.is_finite() && retry.retry_wait_max.is_finite();
        if !finite
            || retry.retry_exp_wait_multiplier <= 0.0
            || retry.retry_wait_max < retry.retry_exp_wait_multiplier
        {
            return Err(AppConfigError::Invalid(
                "retry waits must be finite, positive, and retry_wait_max >= retry_exp_wait_multiplier"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from defaults, config files, and `DOCFLOW__*` environment variables.
///
/// Later sources win: `/etc/docflow/settings.toml`, the XDG config directory,
/// `./config/settings.toml`, the file named by `DOCFLOW_CONFIG_FILE`, then the environment.
pub fn load() -> Result<AppConfig, AppConfigError> {
    let paths = default_paths()?;
    let objects_dir = paths.objects_dir()?;
    let spool_dir = paths.spool_dir()?;
    let lmdb_dir = paths.lmdb_env_dir()?;

    let etc_dir = std::env::var_os(ENV_ETC_CONFIG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(ETC_CONFIG_DIR));
    let etc_file = etc_dir.join("docflow").join(CONFIG_FILE_STEM);
    let xdg_file = project_dirs()
        .ok_or(AppConfigError::MissingProjectDirs)?
        .config_dir()
        .join(CONFIG_FILE_STEM);

    let mut builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default("storage.backend", "fs")?
        .set_default("storage.bucket", "documents")?
        .set_default("storage.path", lossy(objects_dir))?
        .set_default("stream.name", "documents")?
        .set_default("stream.connection", lossy(spool_dir))?
        .set_default("stream.consumer_group", "$Default")?
        .set_default("stream.max_event_batch_size", 10)?
        .set_default("stream.poll_interval_ms", 1_000)?
        .set_default("checkpoint.container", "checkpoints")?
        .set_default("records.connection", lossy(lmdb_dir))?
        .set_default("records.collection", "documents")?
        .set_default("extraction.endpoint", "")?
        .set_default("extraction.poll_interval_ms", 500)?
        .set_default("extraction.max_polls", 120)?
        .set_default("extraction.request_timeout_secs", 60)?
        .set_default("extraction.requests_per_second", 10)?
        .set_default("downstream.api_url", "")?
        .set_default("downstream.auth_scheme", "api_key")?
        .set_default("downstream.request_timeout_secs", 30)?
        .set_default("retry.max_api_tries", 3)?
        .set_default("retry.retry_exp_wait_multiplier", 1.0)?
        .set_default("retry.retry_wait_max", 60.0)?
        .add_source(File::with_name(&lossy(etc_file)).required(false))
        .add_source(File::with_name(&lossy(xdg_file)).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_FILE).required(false));

    if let Some(path) = std::env::var_os(ENV_CONFIG_FILE) {
        builder = builder.add_source(File::from(PathBuf::from(path)).required(false));
    }

    let cfg = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    Ok(cfg)
}

fn default_paths() -> Result<AppPaths, AppConfigError> {
    Ok(AppPaths::from_project_dirs()?)
}

fn lossy(path: PathBuf) -> String {
    path.to_string_lossy().to_string()
}
