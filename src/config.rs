//! Configuration.
//!
//! [`EngineConfig`] tunes the reconciliation engine. [`ServerConfig`] is read
//! from the environment by the server binary; every variable has a default.

use std::env::VarError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Retry behaviour for serialization conflicts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after `attempt` (1-based) failed.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let nanos = self.initial_backoff.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max_backoff.as_nanos() as f64 {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos as u64)
    }
}

/// Engine settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    /// Conflict retry policy.
    pub retry: RetryPolicy,
}

/// Server settings, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Directory holding the contact database.
    pub data_dir: PathBuf,
    /// Worker threads executing identify requests.
    pub workers: usize,
    /// Requests allowed to wait for a worker.
    pub queue_capacity: usize,
    /// How long an HTTP request waits for its result.
    pub request_timeout: Duration,
    /// fsync the WAL on every commit.
    pub sync_on_write: bool,
    /// WAL size that triggers compaction at startup and shutdown.
    pub max_wal_bytes: u64,
    /// Conflict retry policy.
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            data_dir: PathBuf::from("./contacts.db"),
            workers: 4,
            queue_capacity: 1024,
            request_timeout: Duration::from_millis(5000),
            sync_on_write: true,
            max_wal_bytes: 64 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Returns `InvalidValue` when a variable is set but does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// This allows tests to supply variables without mutating process-global
    /// environment state.
    ///
    /// # Errors
    /// Returns `InvalidValue` when a variable is set but does not parse.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let defaults = Self::default();

        let retry = RetryPolicy {
            max_attempts: parse_or(&reader, "RECONCILE_MAX_ATTEMPTS", defaults.retry.max_attempts)?
                .max(1),
            initial_backoff: Duration::from_millis(parse_or(
                &reader,
                "RECONCILE_RETRY_BACKOFF_MS",
                2_u64,
            )?),
            ..defaults.retry
        };

        Ok(Self {
            listen_addr: parse_or(&reader, "RECONCILE_LISTEN_ADDR", defaults.listen_addr)?,
            data_dir: reader("RECONCILE_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            workers: parse_or(&reader, "RECONCILE_WORKERS", defaults.workers)?.max(1),
            queue_capacity: parse_or(&reader, "RECONCILE_QUEUE_CAPACITY", defaults.queue_capacity)?
                .max(1),
            request_timeout: Duration::from_millis(parse_or(
                &reader,
                "RECONCILE_REQUEST_TIMEOUT_MS",
                5000_u64,
            )?),
            sync_on_write: parse_or(&reader, "RECONCILE_SYNC_ON_WRITE", defaults.sync_on_write)?,
            max_wal_bytes: parse_or(&reader, "RECONCILE_MAX_WAL_BYTES", defaults.max_wal_bytes)?,
            retry,
        })
    }
}

fn parse_or<F, T>(reader: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match reader(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Create a reader closure from a HashMap (no global env mutation).
    fn make_reader(vars: HashMap<&str, &str>) -> impl Fn(&str) -> Result<String, VarError> {
        let owned: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| owned.get(key).cloned().ok_or(VarError::NotPresent)
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_reader(make_reader(HashMap::new())).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:3000");
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_custom_values() {
        let config = ServerConfig::from_reader(make_reader(HashMap::from([
            ("RECONCILE_LISTEN_ADDR", "0.0.0.0:8080"),
            ("RECONCILE_DATA_DIR", "/var/lib/contacts"),
            ("RECONCILE_WORKERS", "8"),
            ("RECONCILE_REQUEST_TIMEOUT_MS", "250"),
            ("RECONCILE_SYNC_ON_WRITE", "false"),
            ("RECONCILE_MAX_ATTEMPTS", "0"),
        ])))
        .unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/contacts"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert!(!config.sync_on_write);
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn test_invalid_value_names_the_variable() {
        let err = ServerConfig::from_reader(make_reader(HashMap::from([(
            "RECONCILE_WORKERS",
            "many",
        )])))
        .unwrap_err();
        assert!(err.to_string().contains("RECONCILE_WORKERS"));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_millis(50));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }
}
