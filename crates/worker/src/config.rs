//! Worker configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use saga::config::parse;
use saga::{ConfigError, SagaConfig, StoreKind};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Worker configuration with sensible defaults.
///
/// Everything in [`SagaConfig`] plus:
/// - `DATABASE_URL`: required when `SAGA_STATE_STORE=postgres`
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
/// - `METRICS_ADDR`: Prometheus listener (default: `"0.0.0.0:9000"`)
/// - `SAGA_TRIGGER_CONCURRENCY`: sagas driven at once (default: `4`)
/// - `SAGA_TRIGGER_BUFFER`: queued triggers before senders wait (default: `1024`)
/// - `SAGA_RETRY_POLL_SECONDS`: how often due retries are looked up (default: `1`)
/// - `SAGA_CLEANUP_INTERVAL_SECONDS`: how often expired sagas are purged (default: `3600`)
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub saga: SagaConfig,
    pub database_url: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_addr: SocketAddr,
    pub trigger_concurrency: usize,
    pub trigger_buffer: usize,
    pub retry_poll_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            saga: SagaConfig::default(),
            database_url: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            trigger_concurrency: 4,
            trigger_buffer: 1024,
            retry_poll_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl WorkerConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let saga = SagaConfig::from_lookup(&lookup)?;

        let database_url = lookup("DATABASE_URL").filter(|url| !url.is_empty());
        if saga.store_kind == StoreKind::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL".to_string()));
        }

        let log_format = match lookup("LOG_FORMAT") {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "pretty" | "text" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "LOG_FORMAT".to_string(),
                        value,
                    });
                }
            },
            None => defaults.log_format,
        };

        let positive = |key: &str| -> Result<Option<usize>, ConfigError> {
            match parse::<usize, _>(&lookup, key)? {
                Some(0) => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: "0".to_string(),
                }),
                value => Ok(value),
            }
        };
        let secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(positive(key)?.map_or(default, |secs| Duration::from_secs(secs as u64)))
        };

        Ok(Self {
            saga,
            database_url,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format,
            metrics_addr: parse(&lookup, "METRICS_ADDR")?.unwrap_or(defaults.metrics_addr),
            trigger_concurrency: positive("SAGA_TRIGGER_CONCURRENCY")?
                .unwrap_or(defaults.trigger_concurrency),
            trigger_buffer: positive("SAGA_TRIGGER_BUFFER")?.unwrap_or(defaults.trigger_buffer),
            retry_poll_interval: secs("SAGA_RETRY_POLL_SECONDS", defaults.retry_poll_interval)?,
            cleanup_interval: secs("SAGA_CLEANUP_INTERVAL_SECONDS", defaults.cleanup_interval)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.metrics_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.trigger_concurrency, 4);
        assert_eq!(config.retry_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_overrides() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("SAGA_STATE_STORE", "postgres"),
            ("DATABASE_URL", "postgres://localhost/sagas"),
            ("RUST_LOG", "debug"),
            ("LOG_FORMAT", "JSON"),
            ("METRICS_ADDR", "127.0.0.1:9100"),
            ("SAGA_TRIGGER_CONCURRENCY", "16"),
            ("SAGA_TRIGGER_BUFFER", "64"),
            ("SAGA_RETRY_POLL_SECONDS", "5"),
            ("SAGA_CLEANUP_INTERVAL_SECONDS", "60"),
            ("SAGA_DEFAULT_RETRY_COUNT", "9"),
        ]))
        .unwrap();

        assert_eq!(config.saga.store_kind, StoreKind::Postgres);
        assert_eq!(config.saga.retry_policy.max_retry_count, 9);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/sagas")
        );
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.metrics_addr.to_string(), "127.0.0.1:9100");
        assert_eq!(config.trigger_concurrency, 16);
        assert_eq!(config.trigger_buffer, 64);
        assert_eq!(config.retry_poll_interval, Duration::from_secs(5));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_postgres_requires_database_url() {
        let err = WorkerConfig::from_lookup(lookup(&[("SAGA_STATE_STORE", "postgres")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing(key) if key == "DATABASE_URL"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(WorkerConfig::from_lookup(lookup(&[("LOG_FORMAT", "xml")])).is_err());
        assert!(WorkerConfig::from_lookup(lookup(&[("METRICS_ADDR", "nowhere")])).is_err());
        assert!(WorkerConfig::from_lookup(lookup(&[("SAGA_TRIGGER_CONCURRENCY", "0")])).is_err());
        assert!(WorkerConfig::from_lookup(lookup(&[("SAGA_RETRY_POLL_SECONDS", "0")])).is_err());
    }
}
