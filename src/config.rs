//! Service configuration.
//!
//! A small TOML file under the platform config directory selects the
//! well-known bus name, the bus to attach to and the signal emission period.
//! The object path is not configurable: it is derived deterministically from
//! the service name by turning dot separators into path separators
//! (`com.example.Demo` -> `/com/example/Demo`).

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use zbus::Connection;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Which bus the service or client attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Per-login-session bus (the default; the system bus works the same,
    /// it is just less permissive).
    #[default]
    Session,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Well-known name to claim exclusively.
    pub service_name: String,

    /// Bus to attach to.
    pub bus: BusKind,

    /// Period between signal broadcasts, in seconds.
    pub emit_period_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_name: "com.example.Demo".to_string(),
            bus: BusKind::Session,
            emit_period_secs: 30,
        }
    }
}

impl BusConfig {
    /// Path of the config file.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let dirs = ProjectDirs::from("org", "buskit", "buskit").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load the config file, falling back to defaults when it is missing.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config file, creating parent directories as needed.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.validate()?;
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)?;
        info!("Saved config to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_well_known_name(&self.service_name) {
            return Err(ConfigError::ValidationError(format!(
                "'{}' is not a valid well-known bus name",
                self.service_name
            )));
        }
        if self.emit_period_secs == 0 {
            return Err(ConfigError::ValidationError(
                "emit_period_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Object path derived from the service name.
    pub fn object_path(&self) -> String {
        format!("/{}", self.service_name.replace('.', "/"))
    }

    pub fn emit_period(&self) -> Duration {
        Duration::from_secs(self.emit_period_secs)
    }

    /// Connect to the configured bus.
    pub async fn connect(&self) -> zbus::Result<Connection> {
        match self.bus {
            BusKind::Session => Connection::session().await,
            BusKind::System => Connection::system().await,
        }
    }
}

/// Well-known bus names: two or more dot-separated elements of
/// `[A-Za-z0-9_-]`, none starting with a digit, at most 255 bytes.
pub fn is_valid_well_known_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    let elements: Vec<&str> = name.split('.').collect();
    if elements.len() < 2 {
        return false;
    }
    elements.iter().all(|element| {
        let mut chars = element.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '-' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}
