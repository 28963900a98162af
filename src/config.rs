use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub idle_timeout_secs: u64,
    /// Deadline applied to every transaction and the store calls inside it
    pub operation_timeout_ms: u64,
    /// How long SQLite waits on a competing writer before reporting busy
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:data/forum.db".to_string(),
            max_connections: 25,
            idle_timeout_secs: 15 * 60,
            operation_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = DatabaseConfig::default();
        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.url),
                max_connections: env_parse("DB_MAX_CONNECTIONS", defaults.max_connections)?,
                idle_timeout_secs: env_parse("DB_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs)?,
                operation_timeout_ms: env_parse(
                    "DB_OPERATION_TIMEOUT_MS",
                    defaults.operation_timeout_ms,
                )?,
                busy_timeout_ms: env_parse("DB_BUSY_TIMEOUT_MS", defaults.busy_timeout_ms)?,
            },
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value {:?} for {}: {}", raw, key, e)),
        Err(_) => Ok(default),
    }
}
