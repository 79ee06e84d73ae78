//! Configuration management for the hookrelay broker.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookrelay_delivery::{
    client::ClientConfig, BackoffStrategy, DeliveryConfig, QueueOrdering, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CONFIG_FILE: &str = "hookrelay.toml";

/// Where delivery jobs, locks and the channel catalog are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// PostgreSQL, shared by every broker process.
    Postgres,
    /// Process-local maps. Nothing survives a restart.
    Memory,
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Broker configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`hookrelay.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Storage
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Storage backend.
    ///
    /// Environment variable: `STORAGE`
    #[serde(default = "default_storage", alias = "STORAGE")]
    pub storage: StorageBackend,

    // Dispatch
    /// Number of concurrent delivery workers.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[serde(default = "default_worker_count", alias = "WORKER_POOL_SIZE")]
    pub worker_pool_size: usize,
    /// Number of new jobs the queue admits before `submit` waits.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[serde(default = "default_queue_capacity", alias = "QUEUE_CAPACITY")]
    pub queue_capacity: usize,
    /// Hand out higher-priority messages first instead of arrival order.
    ///
    /// Environment variable: `PRIORITY_DISPATCH`
    #[serde(default, alias = "PRIORITY_DISPATCH")]
    pub priority_dispatch: bool,

    // Retry
    /// Attempts per job before it is dead-lettered.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "MAX_ATTEMPTS")]
    pub max_attempts: u32,
    /// Base delay between retries in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Growth of the delay between retries.
    ///
    /// Environment variable: `RETRY_STRATEGY`
    #[serde(default = "default_retry_strategy", alias = "RETRY_STRATEGY")]
    pub retry_strategy: BackoffStrategy,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default, alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,

    // Locks
    /// Lifetime of a job lock in seconds.
    ///
    /// Environment variable: `LOCK_TTL_SECONDS`
    #[serde(default = "default_lock_ttl", alias = "LOCK_TTL_SECONDS")]
    pub lock_ttl_seconds: u64,
    /// Seconds between sweeps of expired locks.
    ///
    /// Environment variable: `LOCK_SWEEP_INTERVAL_SECONDS`
    #[serde(default = "default_lock_sweep_interval", alias = "LOCK_SWEEP_INTERVAL_SECONDS")]
    pub lock_sweep_interval_seconds: u64,

    // Client
    /// HTTP timeout of one delivery attempt in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,

    // Lifecycle
    /// Seconds to wait for in-flight deliveries on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,
    /// Name of this broker process, used as the prefix of lock holders.
    ///
    /// Environment variable: `BROKER_NAME`
    #[serde(default = "default_broker_name", alias = "BROKER_NAME")]
    pub broker_name: String,
    /// Public base URL used to build message links in dead-letter listings.
    ///
    /// Environment variable: `MESSAGE_BASE_URL`
    #[serde(default = "default_message_base_url", alias = "MESSAGE_BASE_URL")]
    pub message_base_url: String,
    /// Jobs loaded per round trip when recovering on startup.
    ///
    /// Environment variable: `RECOVERY_BATCH_SIZE`
    #[serde(default = "default_recovery_batch_size", alias = "RECOVERY_BATCH_SIZE")]
    pub recovery_batch_size: usize,

    // Logging
    /// Log output format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[serde(default = "default_log_format", alias = "LOG_FORMAT")]
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::raw());

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        let lock_ttl = Duration::from_secs(self.lock_ttl_seconds);
        let queue_ordering =
            if self.priority_dispatch { QueueOrdering::Priority } else { QueueOrdering::Fifo };

        DeliveryConfig {
            worker_count: self.worker_pool_size,
            queue_capacity: self.queue_capacity,
            queue_ordering,
            client_config: self.to_client_config(),
            retry_policy: self.to_retry_policy(),
            lock_ttl,
            lock_sweep_interval: Duration::from_secs(self.lock_sweep_interval_seconds),
            lock_sweep_threshold: lock_ttl,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            recovery_batch_size: self.recovery_batch_size,
            message_base_url: self.message_base_url.clone(),
            instance_id: format!("{}-{}", self.broker_name, Uuid::new_v4().simple()),
        }
    }

    /// Convert to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: self.retry_strategy,
        }
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                // "postgresql://host@..." has no password, only the scheme colon
                if !self.database_url[colon_pos..].starts_with("://") {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.storage == StorageBackend::Postgres && self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("retry_base_delay_ms cannot exceed retry_max_delay_ms");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.lock_ttl_seconds <= self.delivery_timeout_seconds {
            anyhow::bail!("lock_ttl_seconds must exceed delivery_timeout_seconds");
        }

        if self.lock_sweep_interval_seconds == 0 {
            anyhow::bail!("lock_sweep_interval_seconds must be greater than 0");
        }

        if self.recovery_batch_size == 0 {
            anyhow::bail!("recovery_batch_size must be greater than 0");
        }

        if self.broker_name.trim().is_empty() {
            anyhow::bail!("broker_name must not be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            storage: default_storage(),
            worker_pool_size: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            priority_dispatch: false,
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_strategy: default_retry_strategy(),
            retry_jitter_factor: 0.0,
            lock_ttl_seconds: default_lock_ttl(),
            lock_sweep_interval_seconds: default_lock_sweep_interval(),
            delivery_timeout_seconds: default_delivery_timeout(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            broker_name: default_broker_name(),
            message_base_url: default_message_base_url(),
            recovery_batch_size: default_recovery_batch_size(),
            log_format: default_log_format(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/hookrelay".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_storage() -> StorageBackend {
    StorageBackend::Postgres
}

fn default_worker_count() -> usize {
    hookrelay_delivery::DEFAULT_WORKER_COUNT
}

fn default_queue_capacity() -> usize {
    hookrelay_delivery::DEFAULT_QUEUE_CAPACITY
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60000
}

fn default_retry_strategy() -> BackoffStrategy {
    BackoffStrategy::Linear
}

fn default_lock_ttl() -> u64 {
    60
}

fn default_lock_sweep_interval() -> u64 {
    30
}

fn default_delivery_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_broker_name() -> String {
    "hookrelay".to_string()
}

fn default_message_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_recovery_batch_size() -> usize {
    hookrelay_delivery::DEFAULT_RECOVERY_BATCH_SIZE
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}
