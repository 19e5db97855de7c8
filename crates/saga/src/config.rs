//! Orchestrator configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Missing required value for {0}")]
    Missing(String),
}

/// Which [`saga_store::SagaStateStore`] implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    Memory,
    Postgres,
}

impl FromStr for StoreKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(StoreKind::Memory),
            "postgres" | "postgresql" => Ok(StoreKind::Postgres),
            _ => Err(()),
        }
    }
}

/// Saga engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_STATE_STORE`: `memory` or `postgres` (default: `memory`)
/// - `SAGA_DEFAULT_TIMEOUT_SECONDS`: budget of one run before the saga is
///   suspended (default: `300`)
/// - `SAGA_STEP_TIMEOUT_SECONDS`: budget of one step call, and the lease a
///   worker holds on it (default: `30`)
/// - `SAGA_DEFAULT_RETRY_COUNT`: retries per step (default: `3`)
/// - `SAGA_INITIAL_RETRY_DELAY_SECONDS`: first backoff (default: `1`)
/// - `SAGA_RETRY_DELAY_MULTIPLIER`: backoff growth (default: `2.0`)
/// - `SAGA_MAX_RETRY_DELAY_SECONDS`: backoff cap (default: `60`)
/// - `SAGA_RETENTION_HOURS`: how long terminal sagas are kept (default: `168`)
#[derive(Debug, Clone, PartialEq)]
pub struct SagaConfig {
    pub store_kind: StoreKind,
    /// Time budget of a single `start` or `resume` call. The clock restarts
    /// on every invocation: backoff waits between retries do not count, so a
    /// saga that keeps retrying is never suspended by this budget.
    pub default_timeout: Duration,
    pub step_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub retention: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            store_kind: StoreKind::Memory,
            default_timeout: Duration::from_secs(300),
            step_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            retention: Duration::from_secs(168 * 3600),
        }
    }
}

impl SagaConfig {
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

        let store_kind = match lookup("SAGA_STATE_STORE") {
            Some(value) => value.parse().map_err(|()| ConfigError::InvalidValue {
                key: "SAGA_STATE_STORE".to_string(),
                value,
            })?,
            None => defaults.store_kind,
        };

        let secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse(&lookup, key)?.map_or(default, Duration::from_secs))
        };

        let multiplier: f64 =
            parse(&lookup, "SAGA_RETRY_DELAY_MULTIPLIER")?.unwrap_or(defaults.retry_policy.multiplier);
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "SAGA_RETRY_DELAY_MULTIPLIER".to_string(),
                value: multiplier.to_string(),
            });
        }

        Ok(Self {
            store_kind,
            default_timeout: secs("SAGA_DEFAULT_TIMEOUT_SECONDS", defaults.default_timeout)?,
            step_timeout: secs("SAGA_STEP_TIMEOUT_SECONDS", defaults.step_timeout)?,
            retry_policy: RetryPolicy {
                max_retry_count: parse(&lookup, "SAGA_DEFAULT_RETRY_COUNT")?
                    .unwrap_or(defaults.retry_policy.max_retry_count),
                initial_delay: secs(
                    "SAGA_INITIAL_RETRY_DELAY_SECONDS",
                    defaults.retry_policy.initial_delay,
                )?,
                multiplier,
                max_delay: secs(
                    "SAGA_MAX_RETRY_DELAY_SECONDS",
                    defaults.retry_policy.max_delay,
                )?,
            },
            retention: parse::<u64, _>(&lookup, "SAGA_RETENTION_HOURS")?
                .map_or(defaults.retention, |hours| {
                    Duration::from_secs(hours.saturating_mul(3600))
                }),
        })
    }

    /// Terminal sagas last updated before the returned instant may be deleted.
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Parses the value found under `key`, if any.
pub fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        None => Ok(None),
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
        let config = SagaConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SagaConfig::default());
        assert_eq!(config.store_kind, StoreKind::Memory);
        assert_eq!(config.default_timeout, Duration::from_secs(300));
        assert_eq!(config.retry_policy.max_retry_count, 3);
        assert_eq!(config.retention, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn test_overrides() {
        let config = SagaConfig::from_lookup(lookup(&[
            ("SAGA_STATE_STORE", "Postgres"),
            ("SAGA_DEFAULT_TIMEOUT_SECONDS", "120"),
            ("SAGA_STEP_TIMEOUT_SECONDS", "5"),
            ("SAGA_DEFAULT_RETRY_COUNT", "7"),
            ("SAGA_INITIAL_RETRY_DELAY_SECONDS", "2"),
            ("SAGA_RETRY_DELAY_MULTIPLIER", "1.5"),
            ("SAGA_MAX_RETRY_DELAY_SECONDS", "30"),
            ("SAGA_RETENTION_HOURS", "24"),
        ]))
        .unwrap();

        assert_eq!(config.store_kind, StoreKind::Postgres);
        assert_eq!(config.default_timeout, Duration::from_secs(120));
        assert_eq!(config.step_timeout, Duration::from_secs(5));
        assert_eq!(
            config.retry_policy,
            RetryPolicy {
                max_retry_count: 7,
                initial_delay: Duration::from_secs(2),
                multiplier: 1.5,
                max_delay: Duration::from_secs(30),
            }
        );
        assert_eq!(config.retention, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_invalid_values() {
        let err = SagaConfig::from_lookup(lookup(&[("SAGA_DEFAULT_RETRY_COUNT", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("SAGA_DEFAULT_RETRY_COUNT"));

        assert!(SagaConfig::from_lookup(lookup(&[("SAGA_STATE_STORE", "redis")])).is_err());
        assert!(
            SagaConfig::from_lookup(lookup(&[("SAGA_RETRY_DELAY_MULTIPLIER", "0.5")])).is_err()
        );
    }

    #[test]
    fn test_retention_cutoff() {
        let config = SagaConfig {
            retention: Duration::from_secs(3600),
            ..Default::default()
        };
        let now = Utc::now();
        assert_eq!(config.retention_cutoff(now), now - chrono::Duration::hours(1));
    }
}
