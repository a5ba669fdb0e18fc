//! Environment-driven configuration, assembled once at startup and validated
//! before anything else touches the filesystem or database.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub environment: Environment,

    pub upload_dir: String,
    pub output_dir: String,
    pub max_upload_bytes: u64,

    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub reaper: ReaperConfig,
    pub log_level: String,
    pub allowed_origins: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
    pub migrate_on_start: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub default_concurrency: usize,
    pub max_concurrency: usize,
    pub gifsicle_path: String,
    /// Retention TTL for completed artifacts, in seconds. `None` means indefinite.
    pub retention_seconds: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaperConfig {
    pub interval_seconds: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = match env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
            .as_str()
        {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        };

        let config = Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            environment,
            upload_dir: env::var("UPLOAD_DIR").unwrap_or_else(|_| "./data/uploads".to_string()),
            output_dir: env::var("OUTPUT_DIR").unwrap_or_else(|_| "./data/outputs".to_string()),
            max_upload_bytes: env::var("MAX_UPLOAD_BYTES")
                .unwrap_or_else(|_| "104857600".to_string()) // 100 MiB
                .parse()
                .map_err(|_| ConfigError::InvalidFileSize)?,
            database: DatabaseConfig {
                path: env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/jobs.db".to_string()),
                max_connections: env::var("DB_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
                migrate_on_start: env::var("DB_MIGRATE_ON_START")
                    .unwrap_or_else(|_| "true".to_string())
                    .parse()
                    .unwrap_or(true),
            },
            worker: WorkerConfig {
                default_concurrency: env::var("DEFAULT_CONCURRENCY")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                max_concurrency: env::var("MAX_CONCURRENCY")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                gifsicle_path: env::var("GIFSICLE_PATH").unwrap_or_else(|_| "gifsicle".to_string()),
                retention_seconds: env::var("RETENTION_SECONDS")
                    .ok()
                    .filter(|s| !s.is_empty())
                    .and_then(|s| s.parse().ok()),
            },
            reaper: ReaperConfig {
                interval_seconds: env::var("REAPER_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
            },
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::InvalidFileSize);
        }
        if self.worker.default_concurrency == 0 || self.worker.default_concurrency > self.worker.max_concurrency {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.upload_dir.is_empty() || self.output_dir.is_empty() {
            return Err(ConfigError::InvalidDirectory);
        }
        Ok(())
    }

    pub fn retention(&self) -> Option<Duration> {
        self.worker.retention_seconds.map(|secs| Duration::from_secs(secs.max(0) as u64))
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid port")]
    InvalidPort,
    #[error("invalid max upload size")]
    InvalidFileSize,
    #[error("default concurrency must be within [1, max_concurrency]")]
    InvalidConcurrency,
    #[error("upload or output directory not set")]
    InvalidDirectory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_port() {
        let mut config = sample_config();
        config.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort)));
    }

    #[test]
    fn rejects_default_concurrency_above_max() {
        let mut config = sample_config();
        config.worker.default_concurrency = 20;
        config.worker.max_concurrency = 10;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConcurrency)));
    }

    #[test]
    fn retention_none_when_unset() {
        let mut config = sample_config();
        config.worker.retention_seconds = None;
        assert!(config.retention().is_none());
    }

    fn sample_config() -> Config {
        Config {
            port: 3000,
            environment: Environment::Development,
            upload_dir: "./uploads".to_string(),
            output_dir: "./outputs".to_string(),
            max_upload_bytes: 100,
            database: DatabaseConfig {
                path: ":memory:".to_string(),
                max_connections: 1,
                migrate_on_start: true,
            },
            worker: WorkerConfig {
                default_concurrency: 2,
                max_concurrency: 10,
                gifsicle_path: "gifsicle".to_string(),
                retention_seconds: None,
            },
            reaper: ReaperConfig { interval_seconds: 60 },
            log_level: "info".to_string(),
            allowed_origins: vec!["*".to_string()],
        }
    }
}
