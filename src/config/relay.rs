//! Relay configuration
//!
//! Loads listener and soul engine settings from relay.toml

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration file name
pub const CONFIG_FILE: &str = "relay.toml";

/// Default listener settings
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5001;

/// Default soul engine identity
pub const DEFAULT_ORGANIZATION: &str = "tommy1901";
pub const DEFAULT_BLUEPRINT: &str = "samantha-learns";
pub const DEFAULT_ENGINE_URL: &str = "ws://127.0.0.1:4000";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Soul engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SoulConfig {
    /// Organization owning the blueprint
    pub organization: String,
    /// Blueprint (soul) name
    pub blueprint: String,
    /// Base WebSocket URL of the engine
    pub engine_url: String,
    /// Seconds to wait for the upstream handshake
    pub connect_timeout_secs: u64,
}

impl Default for SoulConfig {
    fn default() -> Self {
        Self {
            organization: DEFAULT_ORGANIZATION.to_string(),
            blueprint: DEFAULT_BLUEPRINT.to_string(),
            engine_url: DEFAULT_ENGINE_URL.to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl SoulConfig {
    /// Upstream connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind: String,
    /// Port serving both WebSocket and the liveness route
    pub port: u16,
    /// Soul engine settings
    pub soul: SoulConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            soul: SoulConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a file
    ///
    /// An explicitly named file must exist. Without one, `relay.toml` in the
    /// working directory is used if present and defaults otherwise. Values
    /// are not validated here so that command line overrides apply first.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Check that required values are present
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.soul.organization.is_empty() {
            return Err(ConfigError::Invalid(
                "soul.organization cannot be empty".to_string(),
            ));
        }
        if self.soul.blueprint.is_empty() {
            return Err(ConfigError::Invalid(
                "soul.blueprint cannot be empty".to_string(),
            ));
        }
        // No TLS backend is compiled in, so wss:// would only fail at connect time
        if !self.soul.engine_url.starts_with("ws://") {
            return Err(ConfigError::Invalid(format!(
                "soul.engine_url must be a ws:// URL, got {}",
                self.soul.engine_url
            )));
        }
        Ok(())
    }
}
