//! Proxy configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use swcache_common::{CommonError, RetryConfig};
use swcache_net::{LoaderConfig, UrlPattern};
use tracing::debug;
use url::Url;

use crate::error::{Result, SwError};

/// Generation label used when the configuration does not name one.
pub const DEFAULT_VERSION: &str = "v1";

/// Caching proxy configuration, loaded from JSON.
///
/// Every field has a default, so an empty object is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Generation label of this build.
    pub version: String,

    /// Base URL of the application. Relative pre-cache entries resolve
    /// against it.
    pub scope: String,

    /// Hosts whose requests always go to the network.
    pub api_origins: Vec<String>,

    /// Assets expected to change often; served network-first.
    pub volatile_assets: Vec<UrlPattern>,

    /// Assets fetched and stored at install time.
    pub precache: Vec<String>,

    /// Promote a freshly installed generation without waiting.
    pub skip_waiting: bool,

    /// Per-fetch timeout in milliseconds.
    pub fetch_timeout_ms: u64,

    /// Attempts per pre-cache asset during install.
    pub install_attempts: u32,

    /// SQLite database path. Defaults to the platform cache directory.
    pub database: Option<PathBuf>,

    /// User agent sent on network fetches.
    pub user_agent: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            scope: "http://localhost/".to_string(),
            api_origins: Vec::new(),
            volatile_assets: Vec::new(),
            precache: Vec::new(),
            skip_waiting: true,
            fetch_timeout_ms: 30_000,
            install_attempts: 1,
            database: None,
            user_agent: format!("swcache/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CommonError::config_with_source(format!("cannot read {}", path.display()), e))?;
        let config = Self::from_json(&content)?;
        debug!(path = %path.display(), version = %config.version, "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CommonError::config_with_source("invalid configuration JSON", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(SwError::Config("version must not be empty".into()));
        }
        if self.version.ends_with(crate::generation::STAGING_SUFFIX) {
            return Err(SwError::Config(format!(
                "version {:?} must not end with {:?}",
                self.version,
                crate::generation::STAGING_SUFFIX
            )));
        }
        self.scope_url()?;
        Ok(())
    }

    /// The parsed scope URL.
    pub fn scope_url(&self) -> Result<Url> {
        Url::parse(&self.scope).map_err(|e| SwError::Config(format!("scope {:?}: {e}", self.scope)))
    }

    /// Pre-cache entries resolved to absolute URLs.
    pub fn precache_urls(&self) -> Result<Vec<Url>> {
        let scope = self.scope_url()?;
        self.precache
            .iter()
            .map(|entry| {
                scope
                    .join(entry)
                    .map_err(|e| SwError::Config(format!("precache entry {entry:?}: {e}")))
            })
            .collect()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Backoff used for each pre-cache asset.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::attempts(self.install_attempts)
    }

    /// Where the SQLite store lives.
    pub fn database_path(&self) -> PathBuf {
        match &self.database {
            Some(path) => path.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("swcache")
                .join("responses.db"),
        }
    }

    /// Transport settings for the HTTP fetcher.
    pub fn loader_config(&self) -> Result<LoaderConfig> {
        Ok(LoaderConfig {
            user_agent: self.user_agent.clone(),
            timeout: self.fetch_timeout(),
            origin: Some(self.scope_url()?),
            ..Default::default()
        })
    }
}
