use std::env;
use std::io;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

const DEFAULT_LEVEL: &str = "info";

/// Errors that can occur during logger setup
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("log tracer already initialized")]
    LogTracerAlreadyInitialized,
    #[error("global tracing subscriber already set")]
    SubscriberAlreadySet,
    #[error("invalid log level '{0}'")]
    InvalidLevel(String),
}

/// Builder for the agent's global tracing subscriber
pub struct LoggingBuilder {
    application: String,
    version: String,
    level: String,
    json_enabled: bool,
    stderr: bool,
}

impl LoggingBuilder {
    /// Create a new builder with required application name and version
    pub fn new(application: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            version: version.into(),
            level: DEFAULT_LEVEL.to_string(),
            json_enabled: false,
            stderr: true,
        }
    }

    /// Level directive used when `RUST_LOG` is unset
    pub fn level(mut self, level: impl Into<String>) -> Self {
        let level = level.into();
        if !level.is_empty() {
            self.level = level;
        }
        self
    }

    pub fn json_enabled(mut self, enabled: bool) -> Self {
        self.json_enabled = enabled;
        self
    }

    /// `log_format` from the config file: `json` or `standard`
    pub fn format(self, format: Option<&str>) -> Self {
        match format {
            Some(f) => {
                let json = f.eq_ignore_ascii_case("json");
                self.json_enabled(json)
            }
            None => self,
        }
    }

    /// Read JSON_LOG env var to determine if JSON should be enabled
    pub fn json_from_env(mut self) -> Self {
        if env::var("JSON_LOG").is_ok_and(|s| s.parse().unwrap_or_default()) {
            self.json_enabled = true;
        }
        self
    }

    pub fn stdout(mut self) -> Self {
        self.stderr = false;
        self
    }

    fn filter(&self) -> Result<EnvFilter, SetupError> {
        match env::var(EnvFilter::DEFAULT_ENV) {
            Ok(directives) if !directives.is_empty() => Ok(EnvFilter::new(directives)),
            _ => EnvFilter::try_new(&self.level)
                .map_err(|_| SetupError::InvalidLevel(self.level.clone())),
        }
    }

    /// Initialize the logger with the configured settings.
    ///
    /// The returned guard flushes the non-blocking writer on drop and must be
    /// held for the lifetime of the process.
    pub fn init(self) -> Result<WorkerGuard, SetupError> {
        let filter = self.filter()?;

        LogTracer::init().map_err(|_| SetupError::LogTracerAlreadyInitialized)?;

        let (non_blocking, guard) = if self.stderr {
            tracing_appender::non_blocking(io::stderr())
        } else {
            tracing_appender::non_blocking(io::stdout())
        };

        let layer = if self.json_enabled {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(non_blocking)
                .boxed()
        } else {
            fmt::layer().with_target(true).with_writer(non_blocking).boxed()
        };

        let subscriber = Registry::default().with(filter).with(layer);

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|_| SetupError::SubscriberAlreadySet)?;

        tracing::debug!(
            application = %self.application,
            version = %self.version,
            json = self.json_enabled,
            "logging initialized"
        );

        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_selects_json() {
        let builder = LoggingBuilder::new("vault-agent", "0.1.0").format(Some("JSON"));
        assert!(builder.json_enabled);

        let builder = builder.format(Some("standard"));
        assert!(!builder.json_enabled);

        let builder = builder.json_enabled(true).format(None);
        assert!(builder.json_enabled);
    }

    #[test]
    fn test_empty_level_keeps_default() {
        let builder = LoggingBuilder::new("vault-agent", "0.1.0").level("");
        assert_eq!(builder.level, DEFAULT_LEVEL);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let builder = LoggingBuilder::new("vault-agent", "0.1.0").level("vault_agent=bogus");
        if env::var(EnvFilter::DEFAULT_ENV).is_err() {
            assert!(matches!(builder.filter(), Err(SetupError::InvalidLevel(_))));
        }
    }
}
