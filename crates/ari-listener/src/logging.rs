//! Log output for processes embedding the listener
//!
//! Listener diagnostics go through `tracing` (see
//! [`TracingSink`](crate::diagnostics::TracingSink)). This module installs a
//! `tracing-subscriber` formatter for binaries that do not bring their own.
//! Unless `RUST_LOG` is set, only this crate's targets are enabled, at the
//! configured level.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{ListenerError, ListenerResult};

/// Logging section of [`ListenerConfig`](crate::ListenerConfig)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the crate's own targets (`trace` .. `error`)
    pub level: String,
    /// One JSON object per line instead of human-readable output
    pub json: bool,
    /// Log span open/close, e.g. the per-notification `app_start` span
    pub span_events: bool,
    /// Extra filter directives, e.g. `async_nats=warn`
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            span_events: false,
            directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Filter used when `RUST_LOG` is not set
    pub fn default_filter(&self) -> ListenerResult<String> {
        let level = parse_log_level(&self.level)?;
        let mut filter = format!("{}={}", env!("CARGO_CRATE_NAME"), level.to_string().to_ascii_lowercase());
        for directive in &self.directives {
            filter.push(',');
            filter.push_str(directive);
        }
        Ok(filter)
    }

    fn env_filter(&self) -> ListenerResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let directives = self.default_filter()?;
        EnvFilter::try_new(&directives)
            .map_err(|e| ListenerError::config(format!("invalid log filter {:?}: {}", directives, e)))
    }
}

/// Install the global tracing subscriber
///
/// Returns [`ListenerError::Logging`] when a subscriber is already installed,
/// leaving the existing one in place.
pub fn setup_logging(config: &LoggingConfig) -> ListenerResult<()> {
    let filter = config.env_filter()?;
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| ListenerError::Logging {
        message: e.to_string(),
    })?;

    tracing::debug!(level = %config.level, json = config.json, "logging ready");
    Ok(())
}

/// Parse a log level name, case-insensitively
pub fn parse_log_level(level: &str) -> ListenerResult<Level> {
    Level::from_str(level.trim()).map_err(|_| ListenerError::config(format!("invalid log level: {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_filter_targets_crate() {
        let config = LoggingConfig::default();
        assert_eq!(config.default_filter().unwrap(), "ari_listener=info");
    }

    #[test]
    fn test_default_filter_with_directives() {
        let config = LoggingConfig::default()
            .with_level("DEBUG")
            .with_directive("async_nats=warn");
        assert_eq!(
            config.default_filter().unwrap(),
            "ari_listener=debug,async_nats=warn"
        );
    }

    #[test]
    fn test_bad_level_is_configuration_error() {
        let config = LoggingConfig::default().with_level("loud");
        assert!(matches!(
            config.default_filter(),
            Err(ListenerError::Configuration { .. })
        ));
        assert!(parse_log_level(" warn ").is_ok());
    }

    #[test]
    fn test_second_setup_is_refused() {
        let config = LoggingConfig::default();
        // The first call may lose to another global subscriber; the second never wins.
        let _ = setup_logging(&config);
        assert!(matches!(
            setup_logging(&config),
            Err(ListenerError::Logging { .. })
        ));
    }
}
