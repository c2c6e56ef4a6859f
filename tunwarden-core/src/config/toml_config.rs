//! TOML configuration file I/O
//!
//! Handles loading and saving the daemon settings (`config.toml`) in the
//! user's configuration directory.

use crate::backend::EngineSettings;
use crate::error::{ConfigError, TunwardenError};
use crate::network::MonitorSettings;
use crate::reconnection::ReconnectionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Complete TOML configuration structure
///
/// Every section is optional in the file and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Reconnection behaviour after network changes
    #[serde(default)]
    pub reconnection: ReconnectionPolicy,

    /// Tunnel engine tools and paths
    #[serde(default)]
    pub engine: EngineSettings,

    /// Network monitor settings
    #[serde(default)]
    pub monitor: MonitorSettings,
}

impl TomlConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, TunwardenError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TunwardenError::Config(ConfigError::IoError {
                message: format!("Failed to read config file: {}", e),
            })
        })?;

        let config: TomlConfig = toml::from_str(&contents).map_err(|e| {
            TunwardenError::Config(ConfigError::ValidationError {
                message: format!("Failed to parse config file: {}", e),
            })
        })?;

        config.validate()?;

        info!(
            "Loaded configuration: grace_interval={}ms, poll_interval={}ms, awg_quick={}, userspace_engine={}",
            config.reconnection.grace_interval_ms,
            config.monitor.poll_interval_ms,
            config.engine.awg_quick,
            config.engine.userspace_engine
        );

        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, TunwardenError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            debug!("No configuration file at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), TunwardenError> {
        self.reconnection.validate().map_err(|e| {
            warn!("Reconnection policy validation failed: {}", e);
            TunwardenError::Config(ConfigError::ValidationError {
                message: format!("Invalid reconnection policy: {}", e),
            })
        })?;

        self.engine.validate().map_err(|message| {
            TunwardenError::Config(ConfigError::ValidationError { message })
        })?;

        self.monitor.validate().map_err(|message| {
            TunwardenError::Config(ConfigError::ValidationError { message })
        })?;

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), TunwardenError> {
        self.validate()?;

        let contents = toml::to_string_pretty(self)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TunwardenError::Config(ConfigError::IoError {
                    message: format!("Failed to create config directory: {}", e),
                })
            })?;
        }

        std::fs::write(path, contents).map_err(|_| {
            TunwardenError::Config(ConfigError::SaveFailed {
                path: path.to_string_lossy().to_string(),
            })
        })?;

        Ok(())
    }
}

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the default configuration directory
///
/// Returns ~/.config/tunwarden, or TUNWARDEN_CONFIG_DIR if set.
///
/// When started through sudo the invoking user's home is used so the daemon
/// and the CLI agree on one directory.
pub fn get_config_dir() -> Result<PathBuf, TunwardenError> {
    // Allow tests and packaging to override the directory
    if let Ok(config_dir) = std::env::var("TUNWARDEN_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        std::env::var("SUDO_HOME").unwrap_or_else(|_| format!("/home/{}", sudo_user))
    } else {
        std::env::var("HOME").map_err(|_| {
            TunwardenError::Config(ConfigError::IoError {
                message: "HOME environment variable not set".to_string(),
            })
        })?
    };

    Ok(PathBuf::from(home).join(".config").join("tunwarden"))
}

/// Path of `config.toml` inside a configuration directory
pub fn config_path_in(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE_NAME)
}

/// Ensure the configuration directory exists
pub fn ensure_config_dir(dir: &Path) -> Result<(), TunwardenError> {
    std::fs::create_dir_all(dir).map_err(|e| {
        TunwardenError::Config(ConfigError::IoError {
            message: format!("Failed to create config directory: {}", e),
        })
    })?;
    Ok(())
}
