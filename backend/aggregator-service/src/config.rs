/// Configuration management for aggregator-service
///
/// Loads configuration from environment variables with sensible defaults.
/// Values that are present but malformed are rejected rather than replaced.
use anyhow::{bail, Context};
use dedup_store::StoreOptions;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::buffer::DEFAULT_CAPACITY;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding dedup keys, processed events and counters
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct QueueConfig {
    pub capacity: usize,
    /// How long shutdown waits for accepted events to be processed
    pub drain_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                path: PathBuf::from("aggregator.db"),
                max_connections: 5,
                busy_timeout_ms: 5000,
            },
            queue: QueueConfig {
                capacity: DEFAULT_CAPACITY,
                drain_timeout_secs: 10,
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let config = Config {
            app: AppConfig {
                host: lookup("AGGREGATOR_HOST").unwrap_or(defaults.app.host),
                port: parse_var(&lookup, "AGGREGATOR_PORT", defaults.app.port)?,
            },
            database: DatabaseConfig {
                path: lookup("DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.database.path),
                max_connections: parse_var(
                    &lookup,
                    "DB_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
                busy_timeout_ms: parse_var(
                    &lookup,
                    "DB_BUSY_TIMEOUT_MS",
                    defaults.database.busy_timeout_ms,
                )?,
            },
            queue: QueueConfig {
                capacity: parse_var(&lookup, "QUEUE_CAPACITY", defaults.queue.capacity)?,
                drain_timeout_secs: parse_var(
                    &lookup,
                    "SHUTDOWN_DRAIN_TIMEOUT_SECS",
                    defaults.queue.drain_timeout_secs,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.queue.capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than zero");
        }
        if self.database.max_connections == 0 {
            bail!("DB_MAX_CONNECTIONS must be greater than zero");
        }
        if self.database.path.as_os_str().is_empty() {
            bail!("DB_PATH cannot be empty");
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_connections: self.database.max_connections,
            busy_timeout: Duration::from_millis(self.database.busy_timeout_ms),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.drain_timeout_secs)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}
