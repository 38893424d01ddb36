//! Configuration for the relay.

use crate::access::Capability;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind to
    pub bind: String,

    /// Port to bind to (0 for random)
    pub port: u16,

    /// Maximum number of concurrent stream subscribers
    pub max_subscribers: usize,

    /// Per-subscriber change buffer; a subscriber lagging past this many
    /// undelivered updates is resynced with a full snapshot
    pub update_capacity: usize,

    /// Session lifetime in seconds (absent: sessions last until logout)
    pub session_ttl_secs: Option<u64>,

    /// Shared bearer token required on the ingest endpoint (absent: open)
    pub ingest_token: Option<String>,

    /// Users seeded at startup
    #[serde(default)]
    pub users: Vec<UserSeed>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 5000,
            max_subscribers: 256,
            update_capacity: 256,
            session_ttl_secs: None,
            ingest_token: None,
            users: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pulse-relay")
            .join("config.json")
    }
}

/// A user created at startup, with their initial grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeed {
    pub user_id: String,
    pub secret: String,

    /// Administrative users bypass per-sensor authorization.
    #[serde(default)]
    pub admin: bool,

    /// Sensor ids granted to this user.
    #[serde(default)]
    pub sensors: Vec<String>,

    /// Capability level of the seeded grants.
    #[serde(default = "default_capability")]
    pub capability: Capability,
}

fn default_capability() -> Capability {
    Capability::View
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
