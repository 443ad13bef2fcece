//! Configuration management

use cabflow_common::env;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/cabflow";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 16;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default intake directory watched for new files.
pub const DEFAULT_DATA_INTAKE: &str = "./data/intake";

/// Default number of concurrent workers per stage.
pub const DEFAULT_STAGE_CONCURRENCY: usize = 2;

/// Default delay between empty queue polls, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default number of deliveries before a job is dead-lettered.
pub const DEFAULT_JOB_MAX_ATTEMPTS: i32 = 5;

/// Default time a claimed job stays invisible before it may be redelivered.
pub const DEFAULT_JOB_VISIBILITY_TIMEOUT_SECS: u64 = 15 * 60;

/// Default base backoff between failed deliveries, in seconds.
pub const DEFAULT_JOB_RETRY_BACKOFF_SECS: u64 = 30;

/// Default size of each chunk pushed through COPY.
pub const DEFAULT_COPY_CHUNK_BYTES: usize = 256 * 1024;

/// Default directory scan interval, in milliseconds.
pub const DEFAULT_TRIGGER_INTERVAL_MS: u64 = 2_000;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub queue: QueueConfig,
    pub trigger: TriggerConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Stage behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Workers per stage topic
    pub stage_concurrency: usize,
    /// Bytes buffered before each COPY send
    pub copy_chunk_bytes: usize,
}

/// Job queue behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    pub max_attempts: i32,
    pub visibility_timeout_secs: u64,
    pub retry_backoff_secs: u64,
}

/// Directory trigger behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub intake_dir: PathBuf,
    pub scan_interval_ms: u64,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Backoff before the next delivery, growing linearly with attempts.
    pub fn backoff_for(&self, attempts: i32) -> Duration {
        Duration::from_secs(self.retry_backoff_secs.saturating_mul(attempts.max(1) as u64))
    }
}

impl TriggerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

impl Config {
    /// Load configuration from environment (and `.env`) over defaults
    pub fn load() -> PipelineResult<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            database: DatabaseConfig {
                url: env::string_or("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env::parse_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
                min_connections: env::parse_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                )?,
                connect_timeout_secs: env::parse_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
            },
            pipeline: PipelineConfig {
                stage_concurrency: env::parse_or(
                    "CABFLOW_STAGE_CONCURRENCY",
                    DEFAULT_STAGE_CONCURRENCY,
                )?,
                copy_chunk_bytes: env::parse_or(
                    "CABFLOW_COPY_CHUNK_BYTES",
                    DEFAULT_COPY_CHUNK_BYTES,
                )?,
            },
            queue: QueueConfig {
                poll_interval_ms: env::parse_or(
                    "CABFLOW_POLL_INTERVAL_MS",
                    DEFAULT_POLL_INTERVAL_MS,
                )?,
                max_attempts: env::parse_or("CABFLOW_JOB_MAX_ATTEMPTS", DEFAULT_JOB_MAX_ATTEMPTS)?,
                visibility_timeout_secs: env::parse_or(
                    "CABFLOW_JOB_VISIBILITY_TIMEOUT_SECS",
                    DEFAULT_JOB_VISIBILITY_TIMEOUT_SECS,
                )?,
                retry_backoff_secs: env::parse_or(
                    "CABFLOW_JOB_RETRY_BACKOFF_SECS",
                    DEFAULT_JOB_RETRY_BACKOFF_SECS,
                )?,
            },
            trigger: TriggerConfig {
                intake_dir: PathBuf::from(env::string_or("DATA_INTAKE", DEFAULT_DATA_INTAKE)),
                scan_interval_ms: env::parse_or(
                    "CABFLOW_TRIGGER_INTERVAL_MS",
                    DEFAULT_TRIGGER_INTERVAL_MS,
                )?,
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> PipelineResult<()> {
        if self.database.url.is_empty() {
            return Err(PipelineError::Config("Database URL cannot be empty".into()));
        }

        if self.database.max_connections == 0 {
            return Err(PipelineError::Config(
                "Database max_connections must be greater than 0".into(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(PipelineError::Config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        if self.pipeline.stage_concurrency == 0 {
            return Err(PipelineError::Config(
                "Stage concurrency must be greater than 0".into(),
            ));
        }

        if self.pipeline.copy_chunk_bytes < 1024 {
            return Err(PipelineError::Config(
                "COPY chunk size must be at least 1024 bytes".into(),
            ));
        }

        if self.queue.max_attempts < 1 {
            return Err(PipelineError::Config("Job max_attempts must be at least 1".into()));
        }

        // Four topics each holding `stage_concurrency` connections while a
        // handler runs, plus one for enqueueing from the trigger.
        let needed = self.pipeline.stage_concurrency as u32 * 4 + 1;
        if self.database.max_connections < needed {
            tracing::warn!(
                max_connections = self.database.max_connections,
                needed,
                "Connection pool is smaller than the worker count; stages will queue on the pool"
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            pipeline: PipelineConfig {
                stage_concurrency: DEFAULT_STAGE_CONCURRENCY,
                copy_chunk_bytes: DEFAULT_COPY_CHUNK_BYTES,
            },
            queue: QueueConfig {
                poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
                max_attempts: DEFAULT_JOB_MAX_ATTEMPTS,
                visibility_timeout_secs: DEFAULT_JOB_VISIBILITY_TIMEOUT_SECS,
                retry_backoff_secs: DEFAULT_JOB_RETRY_BACKOFF_SECS,
            },
            trigger: TriggerConfig {
                intake_dir: PathBuf::from(DEFAULT_DATA_INTAKE),
                scan_interval_ms: DEFAULT_TRIGGER_INTERVAL_MS,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_min_connections_above_max_rejected() {
        let mut config = Config::default();
        config.database.min_connections = 20;
        config.database.max_connections = 4;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::default();
        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_load_reads_environment() {
        std::env::set_var("CABFLOW_STAGE_CONCURRENCY", "7");
        std::env::set_var("DATA_INTAKE", "/srv/intake");
        let loaded = Config::load();
        std::env::remove_var("CABFLOW_STAGE_CONCURRENCY");
        std::env::remove_var("DATA_INTAKE");

        let config = loaded.unwrap();
        assert_eq!(config.pipeline.stage_concurrency, 7);
        assert_eq!(config.trigger.intake_dir, PathBuf::from("/srv/intake"));
    }

    #[test]
    #[serial_test::serial]
    fn test_load_rejects_unparsable_values() {
        std::env::set_var("CABFLOW_JOB_MAX_ATTEMPTS", "many");
        let loaded = Config::load();
        std::env::remove_var("CABFLOW_JOB_MAX_ATTEMPTS");

        assert!(matches!(loaded, Err(PipelineError::Common(_))));
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        let queue = Config::default().queue;
        assert_eq!(queue.backoff_for(1), Duration::from_secs(30));
        assert_eq!(queue.backoff_for(3), Duration::from_secs(90));
        assert_eq!(queue.backoff_for(0), Duration::from_secs(30));
    }
}
