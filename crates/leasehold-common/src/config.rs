// Leasehold configuration
// Layered settings for the lock manager, the in-memory store and logging

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable prefix, e.g. `LEASEHOLD__LOCK__REQUEST_TIMEOUT_MS=2000`
pub const ENV_PREFIX: &str = "LEASEHOLD";

/// Separator between nested keys in environment variables
pub const ENV_SEPARATOR: &str = "__";

/// Top-level settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub lock: LockConfig,
    pub store: MemoryStoreConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings from an optional file and the process environment.
    ///
    /// Later sources override earlier ones: defaults, then the file, then
    /// `LEASEHOLD__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Same as [`Settings::load`], reading environment variables from `env`
    /// instead of the process environment when given.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the lock manager cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lock.validate()?;
        self.store.validate()
    }
}

/// Configuration for the lease-guarded lock manager
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease TTL in seconds used by `acquire` when the caller passes none (default: 10)
    pub default_ttl_secs: i64,

    /// Renewal cadence in milliseconds (default: unset, meaning TTL / 2).
    /// A value of zero or one not strictly below the TTL falls back to TTL / 2.
    pub keepalive_interval_ms: Option<u64>,

    /// Deadline for every individual store call in milliseconds (default: 5000ms)
    pub request_timeout_ms: u64,

    /// Capacity of the renewal confirmation channel (default: 16)
    pub renewal_buffer: usize,

    /// Value written into lock records by `acquire`.
    /// Defaults to a random id generated once per manager.
    pub owner_id: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 10,
            keepalive_interval_ms: None,
            request_timeout_ms: 5000,
            renewal_buffer: 16,
            owner_id: None,
        }
    }
}

impl LockConfig {
    /// Get the request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Renewal cadence for a lease with the given TTL.
    ///
    /// Always strictly less than the TTL.
    pub fn keepalive_interval(&self, ttl_secs: i64) -> Duration {
        let ttl = Duration::from_secs(ttl_secs.max(1) as u64);
        match self.keepalive_interval_ms {
            Some(ms) if ms > 0 && Duration::from_millis(ms) < ttl => Duration::from_millis(ms),
            _ => ttl / 2,
        }
    }

    /// Owner id written by `acquire`, generated when not configured
    pub fn resolve_owner_id(&self) -> String {
        self.owner_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl_secs <= 0 {
            return Err(ConfigError::Invalid(format!(
                "lock.default_ttl_secs must be positive, got {}",
                self.default_ttl_secs
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "lock.request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.renewal_buffer == 0 {
            return Err(ConfigError::Invalid(
                "lock.renewal_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the in-process key-value store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// How often the background scanner expires leases (default: 100ms)
    pub expiry_scan_interval_ms: u64,

    /// Number of change events retained for watches with a start revision (default: 10000)
    pub history_limit: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            expiry_scan_interval_ms: 100,
            history_limit: 10_000,
        }
    }
}

impl MemoryStoreConfig {
    /// Get the expiry scan interval as Duration
    pub fn expiry_scan_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_scan_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.expiry_scan_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "store.expiry_scan_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset (default: "info")
    pub level: String,

    /// Output format (default: plain)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.lock.default_ttl_secs, 10);
        assert_eq!(settings.lock.request_timeout_ms, 5000);
        assert_eq!(settings.lock.renewal_buffer, 16);
        assert!(settings.lock.owner_id.is_none());
        assert_eq!(settings.store.expiry_scan_interval_ms, 100);
        assert_eq!(settings.store.history_limit, 10_000);
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.logging.format, LogFormat::Plain);
    }

    #[test]
    fn test_keepalive_interval_defaults_to_half_ttl() {
        let config = LockConfig::default();
        assert_eq!(config.keepalive_interval(2), Duration::from_secs(1));
        assert_eq!(config.keepalive_interval(1), Duration::from_millis(500));
    }

    #[test]
    fn test_keepalive_interval_must_be_below_ttl() {
        let mut config = LockConfig {
            keepalive_interval_ms: Some(300),
            ..Default::default()
        };
        assert_eq!(config.keepalive_interval(2), Duration::from_millis(300));

        // Equal to the TTL would let the lease lapse between renewals
        config.keepalive_interval_ms = Some(2000);
        assert_eq!(config.keepalive_interval(2), Duration::from_secs(1));

        config.keepalive_interval_ms = Some(0);
        assert_eq!(config.keepalive_interval(2), Duration::from_secs(1));
    }

    #[test]
    fn test_load_without_sources_uses_defaults() {
        let settings = Settings::load_with_env(None, Some(HashMap::new())).unwrap();
        assert_eq!(settings.lock.default_ttl_secs, 10);
        assert_eq!(settings.store.history_limit, 10_000);
    }

    #[test]
    fn test_load_from_file_and_env() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[lock]
default_ttl_secs = 2
owner_id = "worker-1"

[logging]
format = "json"
"#
        )
        .unwrap();

        let mut env = HashMap::new();
        env.insert(
            "LEASEHOLD__LOCK__REQUEST_TIMEOUT_MS".to_string(),
            "750".to_string(),
        );

        let settings = Settings::load_with_env(Some(file.path()), Some(env)).unwrap();
        assert_eq!(settings.lock.default_ttl_secs, 2);
        assert_eq!(settings.lock.owner_id.as_deref(), Some("worker-1"));
        assert_eq!(settings.lock.request_timeout(), Duration::from_millis(750));
        assert_eq!(settings.logging.format, LogFormat::Json);
        // Untouched sections keep their defaults
        assert_eq!(settings.store.expiry_scan_interval_ms, 100);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[store]
history_limit = 64
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.store.history_limit, 64);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = Settings::load(Some(Path::new("/nonexistent/leasehold.toml")));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_invalid_ttl_rejected() {
        let mut env = HashMap::new();
        env.insert(
            "LEASEHOLD__LOCK__DEFAULT_TTL_SECS".to_string(),
            "0".to_string(),
        );

        let result = Settings::load_with_env(None, Some(env));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_resolve_owner_id() {
        let config = LockConfig {
            owner_id: Some("svc-a".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolve_owner_id(), "svc-a");

        let generated = LockConfig::default().resolve_owner_id();
        assert_eq!(generated.len(), 36);
    }
}
