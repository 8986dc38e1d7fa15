//! Configuration management for exportd
//!
//! Configuration is assembled from several sources:
//! - Configuration file (TOML format)
//! - Environment variables prefixed with `EXPORTD_`
//! - Command-line arguments
//!
//! Configuration precedence (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file
//! 4. Default values

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage backend configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Streaming pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Job state manager configuration
    #[serde(default)]
    pub state: StateConfig,

    /// Result cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Retention and sweeping configuration
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which storage backend holds jobs, queue, cache and records
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps, lost on exit
    Memory,
    /// MongoDB collections
    Mongodb,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// MongoDB connection URI
    #[serde(default = "default_uri")]
    pub uri: String,

    /// Database holding all collections
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_jobs_collection")]
    pub jobs_collection: String,

    #[serde(default = "default_queue_collection")]
    pub queue_collection: String,

    #[serde(default = "default_cache_collection")]
    pub cache_collection: String,

    /// Collection of exportable records
    #[serde(default = "default_records_collection")]
    pub records_collection: String,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,

    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: u32,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent export workers
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Capacity of each worker's control channel
    #[serde(default = "default_control_capacity")]
    pub control_capacity: usize,
}

/// Streaming pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Records fetched per cursor batch
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Records written between durable checkpoints
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Percentage step that triggers a progress report
    #[serde(default = "default_progress_step")]
    pub progress_step: u8,

    /// Records processed between control signal polls
    #[serde(default = "default_control_check_interval")]
    pub control_check_interval: u64,

    /// Directory holding partial and completed artifacts
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

/// Job state manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Attempts for terminal state writes
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Capacity of the status broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of lock stripes serializing lookups per fingerprint
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,

    /// Results up to this size use the small TTL
    #[serde(default = "default_small_result_bytes")]
    pub small_result_bytes: u64,

    /// Results at or above this size use the large TTL
    #[serde(default = "default_large_result_bytes")]
    pub large_result_bytes: u64,

    #[serde(default = "default_small_ttl")]
    pub small_ttl_secs: u64,

    #[serde(default = "default_medium_ttl")]
    pub medium_ttl_secs: u64,

    #[serde(default = "default_large_ttl")]
    pub large_ttl_secs: u64,
}

/// Retention and sweeping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Seconds between artifact sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Age after which terminal artifacts are deleted
    #[serde(default = "default_artifact_retention")]
    pub artifact_retention_secs: u64,

    /// Age after which terminal job records are deleted
    #[serde(default = "default_job_retention")]
    pub job_retention_secs: u64,

    /// Minimum age of an untracked file before it is treated as an orphan
    #[serde(default = "default_orphan_grace")]
    pub orphan_grace_secs: u64,

    /// Processing jobs without an update for this long are requeued
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    /// Seconds between stall checks
    #[serde(default = "default_stall_check_interval")]
    pub stall_check_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// Enable timestamps in logs
    #[serde(default = "default_log_timestamps")]
    pub timestamps: bool,
}

/// Log level options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// Default value functions
fn default_backend() -> StoreBackend {
    StoreBackend::Mongodb
}

fn default_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_database() -> String {
    "exportd".to_string()
}

fn default_jobs_collection() -> String {
    "export_jobs".to_string()
}

fn default_queue_collection() -> String {
    "export_queue".to_string()
}

fn default_cache_collection() -> String {
    "export_cache".to_string()
}

fn default_records_collection() -> String {
    "tasks".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_pool_size() -> u32 {
    10
}

fn default_min_pool_size() -> u32 {
    2
}

fn default_worker_count() -> usize {
    4
}

fn default_control_capacity() -> usize {
    16
}

fn default_batch_size() -> u32 {
    500
}

fn default_checkpoint_interval() -> u64 {
    200
}

fn default_progress_step() -> u8 {
    1
}

fn default_control_check_interval() -> u64 {
    50
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("exportd")
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_lock_stripes() -> usize {
    64
}

fn default_small_result_bytes() -> u64 {
    1024 * 1024
}

fn default_large_result_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_small_ttl() -> u64 {
    15 * 60
}

fn default_medium_ttl() -> u64 {
    60 * 60
}

fn default_large_ttl() -> u64 {
    6 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    5 * 60
}

fn default_artifact_retention() -> u64 {
    24 * 60 * 60
}

fn default_job_retention() -> u64 {
    7 * 24 * 60 * 60
}

fn default_orphan_grace() -> u64 {
    10 * 60
}

fn default_stall_timeout() -> u64 {
    5 * 60
}

fn default_stall_check_interval() -> u64 {
    30
}

fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

fn default_log_timestamps() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            uri: default_uri(),
            database: default_database(),
            jobs_collection: default_jobs_collection(),
            queue_collection: default_queue_collection(),
            cache_collection: default_cache_collection(),
            records_collection: default_records_collection(),
            timeout: default_timeout(),
            max_pool_size: default_max_pool_size(),
            min_pool_size: default_min_pool_size(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            control_capacity: default_control_capacity(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            checkpoint_interval: default_checkpoint_interval(),
            progress_step: default_progress_step(),
            control_check_interval: default_control_check_interval(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_stripes: default_lock_stripes(),
            small_result_bytes: default_small_result_bytes(),
            large_result_bytes: default_large_result_bytes(),
            small_ttl_secs: default_small_ttl(),
            medium_ttl_secs: default_medium_ttl(),
            large_ttl_secs: default_large_ttl(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            artifact_retention_secs: default_artifact_retention(),
            job_retention_secs: default_job_retention(),
            orphan_grace_secs: default_orphan_grace(),
            stall_timeout_secs: default_stall_timeout(),
            stall_check_interval_secs: default_stall_check_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: default_log_timestamps(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::InvalidFormat(e.to_string()).into())
    }

    /// Load configuration with file and environment precedence
    ///
    /// An explicit `path` must exist. Without one, the default path is used
    /// when present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Self::default_path();
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `EXPORTD_*` overrides from an iterator of variables
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("EXPORTD_") else {
                continue;
            };
            match name {
                "STORE_BACKEND" => self.store.backend = parse_backend(&value)?,
                "STORE_URI" => self.store.uri = value,
                "STORE_DATABASE" => self.store.database = value,
                "WORKERS" => self.workers.count = parse_number(&key, &value)?,
                "BATCH_SIZE" => self.pipeline.batch_size = parse_number(&key, &value)?,
                "CHECKPOINT_INTERVAL" => {
                    self.pipeline.checkpoint_interval = parse_number(&key, &value)?
                }
                "TEMP_DIR" => self.pipeline.temp_dir = PathBuf::from(value),
                "LOG_LEVEL" => self.logging.level = parse_log_level(&value)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".exportd")
            .join("config.toml")
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidFormat(e.to_string()).into())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            return Err(invalid("workers.count", self.workers.count));
        }
        if self.workers.control_capacity == 0 {
            return Err(invalid("workers.control_capacity", self.workers.control_capacity));
        }
        if self.pipeline.batch_size == 0 {
            return Err(invalid("pipeline.batch_size", self.pipeline.batch_size));
        }
        if self.pipeline.checkpoint_interval == 0 {
            return Err(invalid(
                "pipeline.checkpoint_interval",
                self.pipeline.checkpoint_interval,
            ));
        }
        if self.pipeline.progress_step == 0 || self.pipeline.progress_step > 100 {
            return Err(invalid("pipeline.progress_step", self.pipeline.progress_step));
        }
        if self.pipeline.control_check_interval == 0 {
            return Err(invalid(
                "pipeline.control_check_interval",
                self.pipeline.control_check_interval,
            ));
        }
        if self.state.retry_attempts == 0 {
            return Err(invalid("state.retry_attempts", self.state.retry_attempts));
        }
        if self.state.event_capacity == 0 {
            return Err(invalid("state.event_capacity", self.state.event_capacity));
        }
        if self.cache.lock_stripes == 0 {
            return Err(invalid("cache.lock_stripes", self.cache.lock_stripes));
        }
        if self.cache.small_result_bytes > self.cache.large_result_bytes {
            return Err(invalid(
                "cache.small_result_bytes",
                self.cache.small_result_bytes,
            ));
        }
        if self.store.backend == StoreBackend::Mongodb
            && !(self.store.uri.starts_with("mongodb://")
                || self.store.uri.starts_with("mongodb+srv://"))
        {
            return Err(invalid("store.uri", &self.store.uri));
        }
        Ok(())
    }

    /// Get connection timeout as Duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.store.timeout)
    }
}

impl CacheConfig {
    /// TTL tier for a completed result of the given size
    pub fn ttl_for(&self, size_bytes: u64) -> Duration {
        let secs = if size_bytes <= self.small_result_bytes {
            self.small_ttl_secs
        } else if size_bytes >= self.large_result_bytes {
            self.large_ttl_secs
        } else {
            self.medium_ttl_secs
        };
        Duration::from_secs(secs)
    }
}

impl LifecycleConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn artifact_retention(&self) -> Duration {
        Duration::from_secs(self.artifact_retention_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_interval_secs)
    }
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn invalid(field: &str, value: impl ToString) -> crate::error::ExportError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_backend(value: &str) -> Result<StoreBackend> {
    match value.trim().to_ascii_lowercase().as_str() {
        "memory" => Ok(StoreBackend::Memory),
        "mongodb" | "mongo" => Ok(StoreBackend::Mongodb),
        _ => Err(invalid("EXPORTD_STORE_BACKEND", value)),
    }
}

fn parse_log_level(value: &str) -> Result<LogLevel> {
    match value.trim().to_ascii_lowercase().as_str() {
        "error" => Ok(LogLevel::Error),
        "warn" => Ok(LogLevel::Warn),
        "info" => Ok(LogLevel::Info),
        "debug" => Ok(LogLevel::Debug),
        "trace" => Ok(LogLevel::Trace),
        _ => Err(invalid("EXPORTD_LOG_LEVEL", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.uri, "mongodb://localhost:27017");
        assert_eq!(config.store.backend, StoreBackend::Mongodb);
        assert_eq!(config.workers.count, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [workers]
            count = 8

            [pipeline]
            checkpoint_interval = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.workers.count, 8);
        assert_eq!(config.pipeline.checkpoint_interval, 50);
        assert_eq!(config.pipeline.batch_size, 500);
        assert_eq!(config.logging.level, LogLevel::Warn);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(Config::from_toml("[workers\ncount = 1").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(vec![
                ("EXPORTD_WORKERS".to_string(), "2".to_string()),
                ("EXPORTD_STORE_BACKEND".to_string(), "memory".to_string()),
                ("EXPORTD_LOG_LEVEL".to_string(), "debug".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ])
            .unwrap();
        assert_eq!(config.workers.count, 2);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.logging.level, LogLevel::Debug);

        let bad = config.apply_env(vec![("EXPORTD_WORKERS".to_string(), "many".to_string())]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.workers.count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ttl_tiers_grow_with_size() {
        let cache = CacheConfig::default();
        let small = cache.ttl_for(10);
        let medium = cache.ttl_for(10 * 1024 * 1024);
        let large = cache.ttl_for(500 * 1024 * 1024);
        assert!(small < medium);
        assert!(medium < large);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let back = Config::from_toml(&text).unwrap();
        assert_eq!(back.workers.count, config.workers.count);
        assert_eq!(back.pipeline.temp_dir, config.pipeline.temp_dir);
    }
}
