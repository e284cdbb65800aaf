//! Configuration loading using Figment
//!
//! Configuration is layered from:
//! 1. A TOML file (default `config/logic2.toml`)
//! 2. Environment variables prefixed with `LOGIC2_`; nested keys are separated by a
//!    double underscore, e.g. `LOGIC2_CONNECTION__PORT=10431`
//!
//! Every section has defaults, so an empty or missing file yields a usable configuration
//! that connects to a Logic 2 instance on `127.0.0.1:10430`.
//!
//! # Example
//! ```no_run
//! use logic2_automation::config::AutomationConfig;
//!
//! let config = AutomationConfig::load()?;
//! config.validate()?;
//! println!("Logic 2 port: {}", config.connection.port);
//! # Ok::<(), logic2_automation::AutomationError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AutomationError, Result};
use crate::logging::OutputFormat;
use crate::manager::{endpoint_url, ConnectOptions, LaunchOptions, DEFAULT_PORT};

/// Default configuration file path, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/logic2.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LOGIC2_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Where to find (or put) the automation server
    pub connection: ConnectionConfig,
    /// Launch settings; used when `launch.enabled` is set
    pub launch: LaunchConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// Automation server address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Host of a running Logic 2 instance; must be a loopback address
    pub address: String,
    /// Automation port
    pub port: u16,
    /// Seconds to wait for the server to become reachable
    pub connect_timeout_secs: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: 20.0,
        }
    }
}

/// Application launch settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Launch a new Logic 2 process instead of connecting to a running one
    pub enabled: bool,
    /// Path to the Logic 2 executable; platform default when unset
    pub application_path: Option<PathBuf>,
    /// Additional command line arguments
    pub extra_args: Vec<String>,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
    /// Whether to log span open/close events
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Compact,
            span_events: false,
        }
    }
}

impl AutomationConfig {
    /// Load from `config/logic2.toml` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::figment(path.as_ref()).extract()?;
        Ok(config)
    }

    /// The layered provider used by [`AutomationConfig::load_from`].
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AutomationConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(AutomationError::InvalidConfiguration(format!(
                "Invalid logging level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.connection.port == 0 {
            return Err(AutomationError::InvalidConfiguration(
                "connection.port must be non-zero".to_string(),
            ));
        }

        let secs = self.connection.connect_timeout_secs;
        if !(secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok()) {
            return Err(AutomationError::InvalidConfiguration(format!(
                "connection.connect_timeout_secs must be a positive number of seconds, got {secs}"
            )));
        }

        endpoint_url(&self.connection.address, self.connection.port).map_err(|err| {
            AutomationError::InvalidConfiguration(format!("connection.address: {err}"))
        })?;

        Ok(())
    }

    /// Connect timeout as a [`Duration`].
    ///
    /// Values too large for a [`Duration`] saturate; [`AutomationConfig::validate`]
    /// rejects them.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.connection.connect_timeout_secs).unwrap_or(Duration::MAX)
    }

    /// Options for [`Manager::connect`](crate::Manager::connect).
    #[must_use]
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            address: self.connection.address.clone(),
            port: self.connection.port,
            connect_timeout: self.connect_timeout(),
        }
    }

    /// Options for [`Manager::launch`](crate::Manager::launch).
    #[must_use]
    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            application_path: self.launch.application_path.clone(),
            port: self.connection.port,
            connect_timeout: self.connect_timeout(),
            extra_args: self.launch.extra_args.clone(),
        }
    }
}
