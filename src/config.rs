//! # Configuration Management
//!
//! Centralized configuration for the session engine.
//!
//! This module provides structured configuration for the client connection,
//! reconnect policy, transport limits, encryption and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides (`BROKERLINK_*`) via `from_env()`
//!
//! ## Reconnect Policy
//! The delay before reconnect attempt `n` is
//! `min(max_reconnect_delay, reconnect_delay * 2^n)`; with the defaults that
//! is 2s, 4s, 8s, 16s, then 30s from there on.

use crate::error::{ProtocolError, Result};
use crate::network::address::Address;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default broker port
pub const DEFAULT_PORT: u16 = 26423;

/// Max allowed frame size (e.g. 16 MB)
pub const MAX_PAYLOAD_SIZE: usize = crate::core::codec::MAX_FRAME_SIZE;

/// Whether to encrypt sessions of non-remote apps by default
pub const ENABLE_ENCRYPTION: bool = false;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Client connection and reconnect settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `BROKERLINK_*` overrides read through `lookup`.
    ///
    /// Malformed numeric values are reported rather than ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value.trim().parse::<T>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid value for {key}: '{value}'"))
            })
        }

        if let Some(addr) = lookup("BROKERLINK_ADDRESS") {
            self.client.address = addr;
        }

        if let Some(secure) = lookup("BROKERLINK_SECURE") {
            self.client.secure = parse("BROKERLINK_SECURE", &secure)?;
        }

        if let Some(timeout) = lookup("BROKERLINK_CONNECTION_TIMEOUT_MS") {
            self.client.connection_timeout =
                Duration::from_millis(parse("BROKERLINK_CONNECTION_TIMEOUT_MS", &timeout)?);
        }

        if let Some(reconnect) = lookup("BROKERLINK_AUTO_RECONNECT") {
            self.client.auto_reconnect = parse("BROKERLINK_AUTO_RECONNECT", &reconnect)?;
        }

        if let Some(delay) = lookup("BROKERLINK_RECONNECT_DELAY_MS") {
            self.client.reconnect_delay =
                Duration::from_millis(parse("BROKERLINK_RECONNECT_DELAY_MS", &delay)?);
        }

        if let Some(delay) = lookup("BROKERLINK_MAX_RECONNECT_DELAY_MS") {
            self.client.max_reconnect_delay =
                Duration::from_millis(parse("BROKERLINK_MAX_RECONNECT_DELAY_MS", &delay)?);
        }

        if let Some(attempts) = lookup("BROKERLINK_MAX_RECONNECT_ATTEMPTS") {
            self.client.max_reconnect_attempts =
                parse("BROKERLINK_MAX_RECONNECT_ATTEMPTS", &attempts)?;
        }

        if let Some(encryption) = lookup("BROKERLINK_ENCRYPTION") {
            self.transport.encryption_enabled = parse("BROKERLINK_ENCRYPTION", &encryption)?;
        }

        if let Some(level) = lookup("BROKERLINK_LOG_LEVEL") {
            self.logging.log_level = parse("BROKERLINK_LOG_LEVEL", &level)?;
        }

        Ok(())
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Broker address as `host:port`
    pub address: String,

    /// Whether the broker is reached over a secure channel
    #[serde(default)]
    pub secure: bool,

    /// Timeout for the transport connect and the server meta packet
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Whether to reconnect after retryable disconnects
    pub auto_reconnect: bool,

    /// Base reconnect delay
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,

    /// Upper bound for the reconnect delay
    #[serde(with = "duration_serde")]
    pub max_reconnect_delay: Duration,

    /// Consecutive failed attempts before giving up (0 = unlimited)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            secure: false,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 0,
        }
    }
}

impl ClientConfig {
    /// Broker address described by this configuration.
    pub fn to_address(&self) -> Result<Address> {
        let mut address = Address::parse(&self.address)?;
        address.secure = self.secure;
        Ok(address)
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if Address::parse(&self.address).is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'example.com:26423')",
                self.address
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.reconnect_delay.as_millis() < 10 {
            errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
        } else if self.reconnect_delay.as_secs() > 60 {
            errors.push("Reconnect delay too long (maximum: 60s)".to_string());
        }

        if self.max_reconnect_delay < self.reconnect_delay {
            errors.push("Max reconnect delay cannot be shorter than reconnect delay".to_string());
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Encrypt sessions when the broker offers it, even for non-remote apps
    pub encryption_enabled: bool,

    /// Maximum allowed frame size in bytes
    pub max_payload_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            encryption_enabled: ENABLE_ENCRYPTION,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("brokerlink"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
