//! Logging Configuration
//!
//! Loaded from environment variables:
//!
//! - `RUST_LOG`: filter directives (default: `info`)
//! - `LOG_FORMAT`: `text` (default) or `json`
//! - `LOG_SERVICE`: service name attached to JSON lines (default: shard-sim)

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub filter: String,
    pub format: LogFormat,
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            format: LogFormat::Text,
            service_name: "shard-sim".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from `lookup` (normally the process environment)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = LoggingConfig::default();
        LoggingConfig {
            filter: lookup("RUST_LOG")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.filter),
            format: match lookup("LOG_FORMAT").as_deref().map(str::trim) {
                Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            service_name: lookup("LOG_SERVICE").unwrap_or(defaults.service_name),
        }
    }
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|e| {
        eprintln!("invalid log filter {:?}: {}, using info", config.filter, e);
        EnvFilter::new("info")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format {
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .try_init()
            .is_ok(),
        LogFormat::Text => builder.with_target(false).try_init().is_ok(),
    };
    if installed {
        tracing::debug!(service = %config.service_name, format = ?config.format, "tracing initialized");
    }
    installed
}
