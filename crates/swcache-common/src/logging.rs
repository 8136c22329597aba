//! Logging configuration and setup.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::CommonError;

/// Crates whose events are shown at the configured level by default.
const SWCACHE_TARGETS: &[&str] = &[
    "swcache_common",
    "swcache_net",
    "swcache_store",
    "swcache_sw",
    "swcache",
];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for swcache crates.
    pub level: Level,
    /// Level for everything else (reqwest, hyper, rusqlite...).
    pub dependency_level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include source file location.
    pub include_location: bool,
    /// Include span events (enter, exit).
    pub include_span_events: bool,
    /// Custom filter string (e.g., "swcache_sw=debug,reqwest=warn").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            dependency_level: Level::WARN,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Create a debug configuration.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            ..Default::default()
        }
    }

    /// Create a production configuration.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Map a `-v` count from the command line to a configuration.
    pub fn from_verbosity(verbosity: u8) -> Self {
        match verbosity {
            0 => Self::default(),
            1 => Self::debug(),
            _ => Self {
                level: Level::TRACE,
                dependency_level: Level::DEBUG,
                include_location: true,
                include_span_events: true,
                ..Default::default()
            },
        }
    }

    /// Set a custom filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// The filter directive used when neither a custom filter nor `RUST_LOG` is set.
    pub fn default_directive(&self) -> String {
        let mut directive = self.dependency_level.to_string().to_lowercase();
        for target in SWCACHE_TARGETS {
            directive.push_str(&format!(",{}={}", target, self.level.to_string().to_lowercase()));
        }
        directive
    }

    fn env_filter(&self) -> EnvFilter {
        if let Some(ref custom_filter) = self.filter {
            EnvFilter::try_new(custom_filter).unwrap_or_else(|_| EnvFilter::new(self.default_directive()))
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_directive()))
        }
    }
}

/// Initialize logging with the given configuration.
///
/// Fails instead of panicking when a global subscriber is already installed,
/// which happens when several proxies or tests share one process.
pub fn init_logging(config: LogConfig) -> Result<(), CommonError> {
    let filter = config.env_filter();

    let span_events = if config.include_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .with_target(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_target(true)
                .with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer().json().with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
    };

    result.map_err(|e| CommonError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(!config.include_location);
    }

    #[test]
    fn test_from_verbosity() {
        assert_eq!(LogConfig::from_verbosity(0).level, Level::INFO);
        assert_eq!(LogConfig::from_verbosity(1).level, Level::DEBUG);
        let trace = LogConfig::from_verbosity(3);
        assert_eq!(trace.level, Level::TRACE);
        assert_eq!(trace.dependency_level, Level::DEBUG);
    }

    #[test]
    fn test_default_directive_scopes_swcache_crates() {
        let directive = LogConfig::debug().default_directive();
        assert!(directive.starts_with("warn"));
        assert!(directive.contains("swcache_sw=debug"));
        assert!(directive.contains("swcache_store=debug"));
    }

    #[test]
    fn test_log_config_with_filter() {
        let config = LogConfig::production().with_filter("swcache_sw=trace");
        assert_eq!(config.filter, Some("swcache_sw=trace".to_string()));
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let _ = init_logging(LogConfig::default());
        assert!(init_logging(LogConfig::default()).is_err());
    }
}
