//! Tracing initialisation
//!
//! The library itself only emits `tracing` events and spans: RPC calls are logged at
//! `debug`, backend errors at `warn` (with their numeric code and detail), process
//! lifecycle at `info`. Binaries call [`init`] or [`init_from_config`] once at startup
//! to install a `tracing-subscriber` pipeline.
//!
//! `RUST_LOG` takes precedence over the configured level when it is set.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::AutomationConfig;
use crate::error::{AutomationError, Result};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored (development)
    Pretty,
    /// Single line, no colors
    Compact,
    /// One JSON object per line
    Json,
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events
    pub with_span_events: bool,
    /// Include file and line numbers
    pub with_file_and_line: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
        }
    }
}

impl LogSettings {
    /// Settings with the given level and default format.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Build settings from the `[logging]` section.
    pub fn from_config(config: &AutomationConfig) -> Result<Self> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: config.logging.format,
            with_span_events: config.logging.span_events,
            with_file_and_line: false,
        })
    }
}

/// Initialize tracing from the loaded configuration
pub fn init_from_config(config: &AutomationConfig) -> Result<()> {
    init(LogSettings::from_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already set (tests, embedding applications)
/// this returns `Ok(())`.
pub fn init(settings: LogSettings) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str().to_lowercase()));

    let span_events = if settings.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(settings.with_file_and_line)
        .with_line_number(settings.with_file_and_line)
        .with_writer(std::io::stderr);

    let layer = match settings.format {
        OutputFormat::Pretty => base.pretty().with_filter(env_filter).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).with_filter(env_filter).boxed(),
        OutputFormat::Json => base.json().with_filter(env_filter).boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already") => Ok(()),
        Err(e) => Err(AutomationError::InvalidConfiguration(format!(
            "Failed to initialize tracing: {e}"
        ))),
    }
}

/// Parse a log level name (case insensitive)
pub fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(AutomationError::InvalidConfiguration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}
