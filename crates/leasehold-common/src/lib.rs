//! Leasehold Common - shared configuration and logging
//!
//! This crate provides:
//! - Layered settings (defaults, file, environment) for the lock manager and store
//! - Tracing subscriber installation
//! - Configuration error type

pub mod config;
pub mod error;
pub mod logging;

pub use config::{LockConfig, LogFormat, LoggingConfig, MemoryStoreConfig, Settings};
pub use error::ConfigError;
pub use logging::init_tracing;
