//! Configuration management for the Tether client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tether/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::packet::MAX_PAYLOAD_SIZE_LIMIT;
use protocol::sync::SYNC_DATA_MAX;
use protocol::{HandshakeOptions, DEFAULT_DELAYED_ACK_BYTES, DEFAULT_FEATURES, DEFAULT_MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("address must be host:port, got {0}")]
    InvalidAddress(String),

    #[error("max_payload_size must be between 4096 and 16777216, got {0}")]
    InvalidMaxPayloadSize(u32),

    #[error("auth_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidAuthTimeout(u64),

    #[error("packet_size must be between 1 and 65536, got {0}")]
    InvalidPacketSize(usize),

    #[error("key_name must be non-empty and contain no whitespace, got {0:?}")]
    InvalidKeyName(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Smallest payload a daemon is guaranteed to accept.
const MIN_PAYLOAD_SIZE: u32 = 4096;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General client configuration.
    pub client: ClientConfig,

    /// Link and handshake settings.
    pub connection: ConnectionConfig,

    /// File sync settings.
    pub sync: SyncConfig,
}

/// General client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory holding RSA keys.
    pub key_dir: PathBuf,

    /// Name attached to public keys offered to the device.
    pub key_name: String,
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Daemon address as `host:port`.
    pub address: String,

    /// Largest payload proposed to the daemon.
    pub max_payload_size: u32,

    /// Per-socket receive window for delayed ack (0 = disabled).
    pub delayed_ack_bytes: u32,

    /// How long to wait for the device to accept a key.
    pub auth_timeout_secs: u64,

    /// Tear the link down when a socket leaves data unread this long (0 = never).
    pub read_time_limit_ms: u64,
}

/// File sync settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// DATA chunk size for pushes.
    pub packet_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            key_dir: default_key_dir(),
            key_name: default_key_name(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:5555".to_string(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            delayed_ack_bytes: DEFAULT_DELAYED_ACK_BYTES,
            auth_timeout_secs: 60,
            read_time_limit_ms: 0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            packet_size: SYNC_DATA_MAX,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("config.toml")
}

/// Returns the default key directory.
fn default_key_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("keys")
}

/// Returns `user@tether`.
fn default_key_name() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    format!("{user}@tether")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - TETHER_ADDRESS: Override daemon address
    /// - TETHER_LOG_LEVEL: Override log level
    /// - TETHER_KEY_DIR: Override key directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("TETHER_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding address from environment: {}", address);
                self.connection.address = address;
            }
        }

        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.client.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("TETHER_KEY_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding key_dir from environment: {}", dir);
                self.client.key_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let address = &self.connection.address;
        let valid_address = address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid_address {
            return Err(ConfigError::InvalidAddress(address.clone()));
        }

        let payload = self.connection.max_payload_size;
        if payload < MIN_PAYLOAD_SIZE || payload as usize > MAX_PAYLOAD_SIZE_LIMIT {
            return Err(ConfigError::InvalidMaxPayloadSize(payload));
        }

        let timeout = self.connection.auth_timeout_secs;
        if !(1..=3600).contains(&timeout) {
            return Err(ConfigError::InvalidAuthTimeout(timeout));
        }

        let packet_size = self.sync.packet_size;
        if packet_size == 0 || packet_size > SYNC_DATA_MAX {
            return Err(ConfigError::InvalidPacketSize(packet_size));
        }

        let name = &self.client.key_name;
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidKeyName(name.clone()));
        }

        let level = self.client.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.client.log_level.clone()));
        }

        Ok(())
    }

    /// Handshake options derived from the connection settings.
    pub fn handshake_options(&self) -> HandshakeOptions {
        HandshakeOptions {
            max_payload_size: self.connection.max_payload_size,
            features: DEFAULT_FEATURES.to_vec(),
            delayed_ack_bytes: self.connection.delayed_ack_bytes,
            key_name: self.client.key_name.clone(),
        }
    }

    /// Authentication timeout.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.auth_timeout_secs)
    }

    /// Stall limit for unread socket data, if enabled.
    pub fn read_time_limit(&self) -> Option<Duration> {
        match self.connection.read_time_limit_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
