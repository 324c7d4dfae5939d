//! Worker configuration from the environment

use anyhow::{Context, Result};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_METRICS_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_RETRY_DELAY_MULTIPLIER: f64 = 1.0;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Process-wide worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Connection string of the persistent store. Required.
    pub database_url: String,

    /// Sleep between empty claim polls.
    pub poll_interval: Duration,

    /// Cadence of the metrics snapshot log line.
    pub metrics_interval: Duration,

    /// Scales every retry backoff sleep; set below 1 in test harnesses.
    pub retry_delay_multiplier: f64,

    /// How long in-flight work may finish after a shutdown signal.
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    /// Read configuration from the environment. `DATABASE_URL` is
    /// mandatory; everything else falls back to defaults.
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set to run the worker")?;

        Ok(WorkerConfig {
            database_url,
            poll_interval: Duration::from_millis(env_u64(
                "POLL_INTERVAL",
                DEFAULT_POLL_INTERVAL_MS,
            )?),
            metrics_interval: Duration::from_millis(env_u64(
                "METRICS_INTERVAL",
                DEFAULT_METRICS_INTERVAL_MS,
            )?),
            retry_delay_multiplier: env_f64(
                "RETRY_DELAY_MULTIPLIER",
                DEFAULT_RETRY_DELAY_MULTIPLIER,
            )?,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        })
    }

    /// Defaults for a given store URL, used by CLI commands that execute
    /// without the worker environment.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        WorkerConfig {
            database_url: database_url.into(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            metrics_interval: Duration::from_millis(DEFAULT_METRICS_INTERVAL_MS),
            retry_delay_multiplier: DEFAULT_RETRY_DELAY_MULTIPLIER,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

/// The process-wide backoff scaling factor, for callers that execute runs
/// without a full worker configuration.
pub fn retry_delay_multiplier_from_env() -> Result<f64> {
    env_f64("RETRY_DELAY_MULTIPLIER", DEFAULT_RETRY_DELAY_MULTIPLIER)
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{name} must be an integer, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_f64(name: &str, default: f64) -> Result<f64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<f64>()
            .with_context(|| format!("{name} must be a number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation is process-global, so every case lives in one
    // test to avoid interference under the parallel runner.
    #[test]
    fn test_from_env() {
        let vars = [
            "DATABASE_URL",
            "POLL_INTERVAL",
            "METRICS_INTERVAL",
            "RETRY_DELAY_MULTIPLIER",
        ];
        for var in vars {
            std::env::remove_var(var);
        }

        assert!(WorkerConfig::from_env().is_err());

        std::env::set_var("DATABASE_URL", "sqlite::memory:");
        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(5_000));
        assert_eq!(config.metrics_interval, Duration::from_millis(60_000));
        assert_eq!(config.retry_delay_multiplier, 1.0);

        std::env::set_var("POLL_INTERVAL", "250");
        std::env::set_var("RETRY_DELAY_MULTIPLIER", "0.5");
        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry_delay_multiplier, 0.5);

        std::env::set_var("POLL_INTERVAL", "soon");
        assert!(WorkerConfig::from_env().is_err());

        for var in vars {
            std::env::remove_var(var);
        }
    }
}
