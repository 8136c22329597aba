//! Error types for the caching proxy.

use swcache_common::CommonError;
use swcache_net::NetError;
use swcache_store::{RequestIdentity, StoreError};
use thiserror::Error;

/// Errors raised inside the caching proxy.
///
/// None of these cross the fetch boundary: strategies turn them into
/// synthetic responses (see [`crate::synthetic`]).
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(#[from] NetError),

    #[error("No cached response for {0}")]
    CacheMiss(RequestIdentity),

    #[error("Cache write failed: {0}")]
    StoreWriteFailed(#[source] StoreError),

    #[error("Install of generation {generation} aborted at {url}: {reason}")]
    InstallAborted {
        generation: String,
        url: String,
        reason: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SwError {
    /// Short machine-readable name of the error.
    pub fn kind(&self) -> &'static str {
        match self {
            SwError::NetworkUnreachable(_) => "network-unreachable",
            SwError::CacheMiss(_) => "cache-miss",
            SwError::StoreWriteFailed(_) => "store-write-failed",
            SwError::InstallAborted { .. } => "install-aborted",
            SwError::Store(_) => "store",
            SwError::InvalidState(_) => "invalid-state",
            SwError::Config(_) => "config",
        }
    }
}

impl From<CommonError> for SwError {
    fn from(error: CommonError) -> Self {
        match error {
            CommonError::Timeout(after) => SwError::NetworkUnreachable(NetError::Timeout(after)),
            CommonError::Config {
                message,
                source: Some(source),
            } => SwError::Config(format!("{message}: {source}")),
            CommonError::Config { message, source: None } => SwError::Config(message),
            other => SwError::Config(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SwError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_becomes_unreachable() {
        let err: SwError = CommonError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(err, SwError::NetworkUnreachable(NetError::Timeout(_))));
        assert_eq!(err.kind(), "network-unreachable");
    }

    #[test]
    fn test_install_aborted_message_names_asset() {
        let err = SwError::InstallAborted {
            generation: "v17-installing".into(),
            url: "https://app.example.com/favicon.ico".into(),
            reason: "HTTP 404".into(),
        };
        assert!(err.to_string().contains("favicon.ico"));
        assert_eq!(err.kind(), "install-aborted");
    }
}
