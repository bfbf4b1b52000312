//! Runner configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. `daq_runner.toml` (or a file given on the command line)
//! 3. Environment variables prefixed with `DAQ_RUNNER_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DAQ_RUNNER_APPLICATION__LOG_LEVEL=debug
//! DAQ_RUNNER_ENGINE__NOTIFICATION_CAPACITY=256
//! DAQ_RUNNER_ENGINE__BLOCK_BACKING_PATH=/dev/shm/daq_runner.block
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "daq_runner.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or did not match the schema.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values were read but are not usable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Execution engine settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Instrument link settings
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    #[serde(default)]
    pub json_logs: bool,
}

/// Execution engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Undrained notifications the worker may queue before it stalls
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
    /// Size of the shared data block in bytes
    #[serde(default = "default_block_capacity")]
    pub block_capacity_bytes: usize,
    /// Back the data block with this file instead of anonymous memory
    #[serde(default)]
    pub block_backing_path: Option<PathBuf>,
    /// Log a warning when the worker has been stalled on the controller this
    /// long. Never aborts the stall.
    #[serde(default)]
    pub stall_warn_after_ms: Option<u64>,
    /// Idle tick used by hosts that drive `poll` from a timer
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Instrument link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Serial read deadline in milliseconds
    #[serde(default = "default_serial_timeout")]
    pub serial_timeout_ms: u64,

    /// Appended to every command sent over serial
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,

    /// Byte that ends a serial reply; must be ASCII
    #[serde(default = "default_response_delimiter")]
    pub response_delimiter: char,
}

fn default_name() -> String {
    "daq_runner".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_notification_capacity() -> usize {
    64
}

fn default_block_capacity() -> usize {
    64 * 1024
}

fn default_poll_interval() -> u64 {
    20
}

fn default_serial_timeout() -> u64 {
    1000
}

fn default_line_terminator() -> String {
    "\r\n".to_string()
}

fn default_response_delimiter() -> char {
    '\n'
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            notification_capacity: default_notification_capacity(),
            block_capacity_bytes: default_block_capacity(),
            block_backing_path: None,
            stall_warn_after_ms: None,
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl TransportConfig {
    /// The reply delimiter as a single byte.
    pub fn response_delimiter_byte(&self) -> Result<u8, ConfigError> {
        u8::try_from(self.response_delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "transport.response_delimiter {:?} is not an ASCII character",
                    self.response_delimiter
                ))
            })
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            serial_timeout_ms: default_serial_timeout(),
            line_terminator: default_line_terminator(),
            response_delimiter: default_response_delimiter(),
        }
    }
}

impl EngineConfig {
    /// Stall warning threshold, if configured.
    pub fn stall_warn_after(&self) -> Option<Duration> {
        self.stall_warn_after_ms.map(Duration::from_millis)
    }

    /// Idle tick for timer-driven hosts.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check engine settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.notification_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "engine.notification_capacity must be at least 1".to_string(),
            ));
        }
        if self.block_capacity_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "engine.block_capacity_bytes must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "engine.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl RunnerConfig {
    /// Load from `daq_runner.toml` in the working directory (if present) and
    /// the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file path. A missing file is not an error; the
    /// defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if a source is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path.as_ref())
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// The layered provider stack, exposed for callers that merge further
    /// sources (such as command-line overrides) on top.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DAQ_RUNNER_").split("__"))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Engine capacities and intervals are non-zero
    /// - The serial reply delimiter fits in one ASCII byte
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.engine.validate()?;

        if self.transport.serial_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "transport.serial_timeout_ms must be at least 1".to_string(),
            ));
        }
        self.transport.response_delimiter_byte()?;
        Ok(())
    }
}
