//! # swcache common
//!
//! Shared plumbing for the swcache crates.
//!
//! ## Features
//!
//! - A small error type for timeouts, configuration and I/O failures
//! - Logging configuration and setup
//! - Retry and timeout utilities used around network fetches

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Errors shared by every swcache crate.
#[derive(Error, Debug)]
pub enum CommonError {
    /// The operation did not finish in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration could not be loaded or is invalid.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Logging could not be installed.
    #[error("Logging error: {0}")]
    Logging(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommonError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_duration() {
        let err = CommonError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Operation timed out after 1.5s");
    }

    #[test]
    fn test_config_with_source_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = CommonError::config_with_source("reading swcache.json", io);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "Config error: reading swcache.json");
    }
}
