//! Configuration management for the flow tunnel.
//!
//! This module provides functionality for loading, parsing, and managing
//! configuration settings. Configuration is read from a TOML file and can
//! be overridden with `FLOWTUNNEL_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::proto::framing::DEFAULT_MAX_FRAME_SIZE;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "FLOWTUNNEL_";

/// Smallest accepted frame limit. Leaves room for an `open` message with a
/// reasonably long host name.
pub const MIN_FRAME_SIZE: usize = 1024;

/// Type tag plus flow identifier in front of every `data` payload.
pub const DATA_MESSAGE_OVERHEAD: usize = 5;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Client connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Tunnel server address, `host:port`
    pub server_address: Option<String>,

    /// Time allowed for the transport to connect (default: 10000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Time allowed for the server's configuration response (default: 10000)
    #[serde(default = "default_configuration_timeout_ms")]
    pub configuration_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_configuration_timeout_ms() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_address: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            configuration_timeout_ms: default_configuration_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn configuration_timeout(&self) -> Duration {
        Duration::from_millis(self.configuration_timeout_ms)
    }
}

/// Wire protocol limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolConfig {
    /// Largest message carried by one frame (default: 131072)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Largest stream payload put in one `data` message (default: 16384)
    #[serde(default = "default_max_data_chunk")]
    pub max_data_chunk: usize,

    /// Outbound messages queued ahead of the transport writer (default: 256)
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_data_chunk() -> usize {
    16 * 1024
}

fn default_outbound_queue_depth() -> usize {
    256
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            max_frame_size: default_max_frame_size(),
            max_data_chunk: default_max_data_chunk(),
            outbound_queue_depth: default_outbound_queue_depth(),
        }
    }
}

/// How the server's configuration response is checked.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SettingsConfig {
    /// Fail the start when the response carries no DNS servers (default: false)
    #[serde(default)]
    pub require_dns: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub settings: SettingsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            client: ClientConfig::default(),
            protocol: ProtocolConfig::default(),
            settings: SettingsConfig::default(),
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment variables take precedence over the file
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.client.server_address {
            None => {
                return Err(ConfigError::MissingValue(
                    "client.server_address".to_string(),
                ))
            }
            Some(address) if address.trim().is_empty() => {
                return Err(invalid("client.server_address", "cannot be empty"));
            }
            Some(_) => {}
        }

        if self.client.connect_timeout_ms == 0 {
            return Err(invalid("client.connect_timeout_ms", "must be greater than 0"));
        }
        if self.client.configuration_timeout_ms == 0 {
            return Err(invalid(
                "client.configuration_timeout_ms",
                "must be greater than 0",
            ));
        }

        let protocol = &self.protocol;
        if protocol.max_frame_size < MIN_FRAME_SIZE || protocol.max_frame_size > u32::MAX as usize
        {
            return Err(invalid(
                "protocol.max_frame_size",
                format!("must be between {} and {}", MIN_FRAME_SIZE, u32::MAX),
            ));
        }
        let chunk_message = protocol.max_data_chunk.checked_add(DATA_MESSAGE_OVERHEAD);
        if protocol.max_data_chunk == 0
            || chunk_message.is_none_or(|len| len > protocol.max_frame_size)
        {
            return Err(invalid(
                "protocol.max_data_chunk",
                format!(
                    "must be between 1 and {}",
                    protocol.max_frame_size - DATA_MESSAGE_OVERHEAD
                ),
            ));
        }
        if protocol.outbound_queue_depth == 0 {
            return Err(invalid(
                "protocol.outbound_queue_depth",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Apply overrides looked up by variable name (prefix: FLOWTUNNEL_)
    ///
    /// Keys:
    /// - FLOWTUNNEL_LOG_LEVEL
    /// - FLOWTUNNEL_CLIENT_SERVER_ADDRESS, FLOWTUNNEL_CLIENT_CONNECT_TIMEOUT_MS,
    ///   FLOWTUNNEL_CLIENT_CONFIGURATION_TIMEOUT_MS
    /// - FLOWTUNNEL_PROTOCOL_MAX_FRAME_SIZE, FLOWTUNNEL_PROTOCOL_MAX_DATA_CHUNK,
    ///   FLOWTUNNEL_PROTOCOL_OUTBOUND_QUEUE_DEPTH
    /// - FLOWTUNNEL_SETTINGS_REQUIRE_DNS
    ///
    /// Values that do not parse are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }

        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let number = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = var("LOG_LEVEL") {
            if !v.is_empty() {
                self.log_level = v;
            }
        }

        // Client
        if let Some(v) = var("CLIENT_SERVER_ADDRESS") {
            if !v.is_empty() {
                self.client.server_address = Some(v);
            }
        }
        if let Some(n) = number("CLIENT_CONNECT_TIMEOUT_MS") {
            self.client.connect_timeout_ms = n;
        }
        if let Some(n) = number("CLIENT_CONFIGURATION_TIMEOUT_MS") {
            self.client.configuration_timeout_ms = n;
        }

        // Protocol
        if let Some(n) = number("PROTOCOL_MAX_FRAME_SIZE") {
            self.protocol.max_frame_size = n as usize;
        }
        if let Some(n) = number("PROTOCOL_MAX_DATA_CHUNK") {
            self.protocol.max_data_chunk = n as usize;
        }
        if let Some(n) = number("PROTOCOL_OUTBOUND_QUEUE_DEPTH") {
            self.protocol.outbound_queue_depth = n as usize;
        }

        // Settings
        if let Some(b) = var("SETTINGS_REQUIRE_DNS").and_then(|v| parse_bool(&v)) {
            self.settings.require_dns = b;
        }
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("flowtunnel").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}

/// Configuration manager for handling configuration loading and reloading.
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: Config,
    /// Path to the configuration file
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with the default configuration
    pub fn new() -> Self {
        ConfigManager {
            config: Config::default(),
            config_path: Config::default_path(),
        }
    }

    /// Load configuration from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(Config::default_path())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Reload configuration from the current path
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config.reload(&self.config_path)
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }

    /// Save the current configuration to a new path
    pub fn save_as<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        self.config.save(path)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
