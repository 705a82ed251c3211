//! Driver configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via AQUADOPP_CONFIG or --config)
//! 3. Environment variables

use aquadopp_protocol::ParameterValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Driver configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port agent link configuration.
    pub link: LinkConfig,
    /// Command protocol configuration.
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.link.apply_env_overrides();
        self.protocol.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.validate()?;
        self.protocol.validate()
    }
}

/// Port agent link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Port agent address (`host:port`).
    pub port_agent: String,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port_agent: "127.0.0.1:4001".to_string(),
            connect_timeout_ms: 5000,
        }
    }
}

impl LinkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("AQUADOPP_PORT_AGENT") {
            if !addr.is_empty() {
                self.port_agent = addr;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port_agent.rsplit_once(':').is_none() {
            return Err(ConfigError::ValidationError(format!(
                "port_agent '{}' is not host:port",
                self.port_agent
            )));
        }
        Ok(())
    }

    /// Returns the connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Command protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Bounded wait for a command reply, in milliseconds.
    pub command_timeout_ms: u64,
    /// Autosample communication timeout in seconds.
    pub sample_timeout_secs: u64,
    /// Retries per command after the first attempt.
    pub command_retries: u32,
    /// Consecutive failed commands before the connection is declared lost.
    pub max_consecutive_failures: u32,
    /// Size of a single link read.
    pub read_buffer_size: usize,
    /// Quiet period that ends a direct access exchange, in milliseconds.
    pub direct_access_quiet_ms: u64,
    /// Apply the startup parameter set on the first connect.
    pub apply_startup_on_connect: bool,
    /// Overrides for startup parameter defaults.
    pub startup_values: BTreeMap<String, ParameterValue>,
    /// Capacity of the driver event channel.
    pub event_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 3000,
            sample_timeout_secs: 120,
            command_retries: 2,
            max_consecutive_failures: 3,
            read_buffer_size: 4096,
            direct_access_quiet_ms: 500,
            apply_startup_on_connect: true,
            startup_values: BTreeMap::new(),
            event_capacity: 1024,
        }
    }
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("AQUADOPP_COMMAND_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.command_timeout_ms = ms;
            }
        }

        if let Ok(timeout) = std::env::var("AQUADOPP_SAMPLE_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                self.sample_timeout_secs = secs;
            }
        }

        if let Ok(retries) = std::env::var("AQUADOPP_RETRIES") {
            if let Ok(n) = retries.parse() {
                self.command_retries = n;
            }
        }

        if let Ok(max) = std::env::var("AQUADOPP_MAX_FAILURES") {
            if let Ok(n) = max.parse() {
                self.max_consecutive_failures = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "command_timeout_ms must be positive".to_string(),
            ));
        }
        if self.sample_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sample_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::ValidationError(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if self.read_buffer_size == 0 || self.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "read_buffer_size and event_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the command timeout as Duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Returns the autosample timeout as Duration.
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_secs(self.sample_timeout_secs)
    }

    /// Returns the direct access quiet period as Duration.
    pub fn direct_access_quiet(&self) -> Duration {
        Duration::from_millis(self.direct_access_quiet_ms)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
