//! Runtime configuration.
//!
//! Every setting has a default and can be overridden through `CLONE_*`
//! environment variables. The configuration is split into the manager and
//! worker pool configurations when the runtime is assembled.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::events::DEFAULT_DEAD_LETTER_CAPACITY;
use crate::scheduler::{ManagerConfig, WorkerPoolConfig};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for a [`CloneRuntime`](crate::runtime::CloneRuntime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    // Shared backend
    /// Redis URL for the shared queue and store. `None` disables Redis.
    pub redis_url: Option<String>,
    /// Prefix for every Redis key and the store namespace.
    pub key_prefix: String,
    /// Directory of the file store used when Redis is unavailable.
    pub store_path: PathBuf,
    /// How long to wait for the Redis connection.
    pub connect_timeout: Duration,

    // Manager
    /// Interval between heartbeat passes.
    pub heartbeat_interval: Duration,
    /// Inactivity after which an active clone is stale.
    pub stale_threshold: Duration,
    /// Bound on the cleanup hook when terminating a stale clone.
    pub hook_timeout: Duration,

    // Worker pool
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,
    /// Timeout for graceful pool shutdown.
    pub shutdown_timeout: Duration,

    // Event bus
    /// Number of dead-letter events retained.
    pub dead_letter_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let manager = ManagerConfig::default();
        let pool = WorkerPoolConfig::default();
        Self {
            redis_url: None,
            key_prefix: "clone_forge".to_string(),
            store_path: PathBuf::from("./data"),
            connect_timeout: Duration::from_secs(3),

            heartbeat_interval: manager.heartbeat_interval,
            stale_threshold: manager.stale_threshold,
            hook_timeout: manager.hook_timeout,

            min_workers: pool.min_workers,
            max_workers: pool.max_workers,
            initial_workers: pool.initial_workers,
            poll_interval: pool.poll_interval,
            shutdown_timeout: pool.shutdown_timeout,

            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CLONE_REDIS_URL`: Redis URL (default: unset, Redis disabled)
    /// - `CLONE_KEY_PREFIX`: Key prefix (default: clone_forge)
    /// - `CLONE_STORE_PATH`: File store directory (default: ./data)
    /// - `CLONE_HEARTBEAT_INTERVAL_SECS`: Heartbeat interval (default: 5)
    /// - `CLONE_STALE_THRESHOLD_SECS`: Stale threshold (default: 300)
    /// - `CLONE_HOOK_TIMEOUT_SECS`: Stale cleanup timeout (default: 10)
    /// - `CLONE_MIN_WORKERS`: Minimum workers (default: 1)
    /// - `CLONE_MAX_WORKERS`: Maximum workers (default: 10)
    /// - `CLONE_INITIAL_WORKERS`: Initial workers (default: 2)
    /// - `CLONE_POLL_INTERVAL_MS`: Worker poll interval (default: 1000)
    /// - `CLONE_SHUTDOWN_TIMEOUT_SECS`: Pool shutdown timeout (default: 30)
    /// - `CLONE_DEAD_LETTER_CAPACITY`: Dead letters retained (default: 1000)
    /// - `CLONE_CONNECT_TIMEOUT_SECS`: Redis connect timeout (default: 3)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let secs = |key: &str| -> Result<Option<Duration>, ConfigError> {
            lookup(key)
                .map(|val| parse_env_value::<u64>(&val, key).map(Duration::from_secs))
                .transpose()
        };

        // Shared backend
        if let Some(val) = lookup("CLONE_REDIS_URL") {
            let val = val.trim();
            config.redis_url = (!val.is_empty()).then(|| val.to_string());
        }

        if let Some(val) = lookup("CLONE_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Some(val) = lookup("CLONE_STORE_PATH") {
            config.store_path = PathBuf::from(val);
        }

        if let Some(timeout) = secs("CLONE_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = timeout;
        }

        // Manager
        if let Some(interval) = secs("CLONE_HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = interval;
        }

        if let Some(threshold) = secs("CLONE_STALE_THRESHOLD_SECS")? {
            config.stale_threshold = threshold;
        }

        if let Some(timeout) = secs("CLONE_HOOK_TIMEOUT_SECS")? {
            config.hook_timeout = timeout;
        }

        // Worker pool
        if let Some(val) = lookup("CLONE_MIN_WORKERS") {
            config.min_workers = parse_env_value(&val, "CLONE_MIN_WORKERS")?;
        }

        if let Some(val) = lookup("CLONE_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "CLONE_MAX_WORKERS")?;
        }

        if let Some(val) = lookup("CLONE_INITIAL_WORKERS") {
            config.initial_workers = parse_env_value(&val, "CLONE_INITIAL_WORKERS")?;
        }

        if let Some(val) = lookup("CLONE_POLL_INTERVAL_MS") {
            let millis: u64 = parse_env_value(&val, "CLONE_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(millis);
        }

        if let Some(timeout) = secs("CLONE_SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = timeout;
        }

        // Event bus
        if let Some(val) = lookup("CLONE_DEAD_LETTER_CAPACITY") {
            config.dead_letter_capacity = parse_env_value(&val, "CLONE_DEAD_LETTER_CAPACITY")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("stale_threshold", self.stale_threshold),
            ("hook_timeout", self.hook_timeout),
            ("poll_interval", self.poll_interval),
            ("shutdown_timeout", self.shutdown_timeout),
            ("connect_timeout", self.connect_timeout),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::ValidationFailed(format!(
                "{} must be greater than 0",
                name
            )));
        }

        if self.min_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "min_workers must be greater than 0".to_string(),
            ));
        }

        if !(self.min_workers <= self.initial_workers && self.initial_workers <= self.max_workers) {
            return Err(ConfigError::ValidationFailed(format!(
                "workers must satisfy min <= initial <= max, got {} <= {} <= {}",
                self.min_workers, self.initial_workers, self.max_workers
            )));
        }

        if self.dead_letter_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "dead_letter_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Builder method to set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Builder method to set the file store directory.
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    /// Builder method to set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Builder method to set the stale threshold.
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Builder method to set the worker bounds and initial size.
    pub fn with_workers(mut self, min: usize, initial: usize, max: usize) -> Self {
        self.min_workers = min;
        self.initial_workers = initial;
        self.max_workers = max;
        self
    }

    /// Builder method to set the worker poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the pool shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Returns the manager part of the configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::default()
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_stale_threshold(self.stale_threshold)
            .with_hook_timeout(self.hook_timeout)
    }

    /// Returns the worker pool part of the configuration.
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.initial_workers)
            .with_bounds(self.min_workers, self.max_workers)
            .with_poll_interval(self.poll_interval)
            .with_shutdown_timeout(self.shutdown_timeout)
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.redis_url.is_none());
        assert_eq!(config.key_prefix, "clone_forge");
        assert_eq!(config.store_path, PathBuf::from("./data"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.stale_threshold, Duration::from_secs(300));
        assert_eq!(config.hook_timeout, Duration::from_secs(10));
        assert_eq!((config.min_workers, config.initial_workers, config.max_workers), (1, 2, 10));
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.dead_letter_capacity, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("CLONE_REDIS_URL", "redis://localhost:6379"),
            ("CLONE_KEY_PREFIX", "forge"),
            ("CLONE_HEARTBEAT_INTERVAL_SECS", "2"),
            ("CLONE_MAX_WORKERS", "6"),
            ("CLONE_INITIAL_WORKERS", " 3 "),
            ("CLONE_POLL_INTERVAL_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.key_prefix, "forge");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.initial_workers, 3);
        assert_eq!(config.max_workers, 6);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_from_lookup_blank_redis_url_disables_redis() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[("CLONE_REDIS_URL", "  ")])).unwrap();
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_from_lookup_invalid_value() {
        let err = RuntimeConfig::from_lookup(lookup_from(&[("CLONE_MIN_WORKERS", "many")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "CLONE_MIN_WORKERS"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_from_lookup_runs_validation() {
        let err = RuntimeConfig::from_lookup(lookup_from(&[("CLONE_STALE_THRESHOLD_SECS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("stale_threshold"));
    }

    #[test]
    fn test_validation_worker_bounds() {
        assert!(RuntimeConfig::default().with_workers(0, 1, 2).validate().is_err());
        assert!(RuntimeConfig::default().with_workers(2, 1, 4).validate().is_err());
        assert!(RuntimeConfig::default().with_workers(1, 5, 4).validate().is_err());
        assert!(RuntimeConfig::default().with_workers(2, 2, 2).validate().is_ok());
    }

    #[test]
    fn test_validation_dead_letter_capacity() {
        let config = RuntimeConfig {
            dead_letter_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_split_configs() {
        let config = RuntimeConfig::default()
            .with_heartbeat_interval(Duration::from_secs(1))
            .with_workers(2, 3, 5)
            .with_poll_interval(Duration::from_millis(10));

        let manager = config.manager_config();
        assert_eq!(manager.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(manager.stale_threshold, Duration::from_secs(300));

        let pool = config.pool_config();
        assert_eq!((pool.min_workers, pool.initial_workers, pool.max_workers), (2, 3, 5));
        assert_eq!(pool.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "CLONE_MAX_WORKERS".to_string(),
            message: "could not parse 'x'".to_string(),
        };
        assert!(err.to_string().contains("CLONE_MAX_WORKERS"));
    }
}
