//! Error types for configuration and startup

/// Errors raised while loading settings or installing the tracing subscriber
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to install tracing subscriber: {0}")]
    Logging(String),
}
