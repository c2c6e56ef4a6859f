//! Per-tunnel configuration storage
//!
//! Each tunnel lives in `tunnels/<name>.toml` under the configuration
//! directory. Files contain private keys and are created owner-only.

use crate::config::TunnelConfig;
use crate::error::{TunnelError, TunwardenError};
use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const TUNNELS_DIR_NAME: &str = "tunnels";
const TUNNEL_FILE_EXTENSION: &str = "toml";

/// Persistent storage of tunnel configurations
pub trait ConfigStore: Send + Sync {
    /// Names of all stored tunnels
    fn enumerate(&self) -> Result<BTreeSet<String>, TunwardenError>;

    fn load(&self, name: &str) -> Result<TunnelConfig, TunwardenError>;

    /// Overwrite the configuration of an existing tunnel
    fn save(&self, name: &str, config: &TunnelConfig) -> Result<(), TunwardenError>;

    /// Store a new tunnel, failing if the name is taken
    fn create(&self, name: &str, config: &TunnelConfig) -> Result<(), TunwardenError>;

    fn rename(&self, name: &str, replacement: &str) -> Result<(), TunwardenError>;

    fn delete(&self, name: &str) -> Result<(), TunwardenError>;
}

/// File-backed [`ConfigStore`]
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    /// Store rooted at `<config_dir>/tunnels`
    pub fn new(config_dir: &Path) -> Self {
        Self {
            dir: config_dir.join(TUNNELS_DIR_NAME),
        }
    }

    fn file_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, TUNNEL_FILE_EXTENSION))
    }

    fn store_error(name: &str, message: impl Into<String>) -> TunwardenError {
        TunwardenError::Tunnel(TunnelError::Store {
            name: name.to_string(),
            message: message.into(),
        })
    }

    fn write(&self, name: &str, config: &TunnelConfig) -> Result<(), TunwardenError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Self::store_error(name, format!("Failed to create store: {}", e)))?;

        let path = self.file_for(name);
        let contents = toml::to_string_pretty(config)?;
        std::fs::write(&path, contents)
            .map_err(|e| Self::store_error(name, format!("Failed to write: {}", e)))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Self::store_error(name, format!("Failed to set permissions: {}", e)))?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn enumerate(&self) -> Result<BTreeSet<String>, TunwardenError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = BTreeSet::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TUNNEL_FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.insert(stem.to_string());
            }
        }
        debug!("Enumerated {} stored tunnel(s)", names.len());
        Ok(names)
    }

    fn load(&self, name: &str) -> Result<TunnelConfig, TunwardenError> {
        let path = self.file_for(name);
        let contents = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TunwardenError::Tunnel(TunnelError::NotFound {
                name: name.to_string(),
            }),
            _ => Self::store_error(name, format!("Failed to read: {}", e)),
        })?;

        let config: TunnelConfig = toml::from_str(&contents)?;
        config
            .validate()
            .map_err(|message| Self::store_error(name, message))?;
        Ok(config)
    }

    fn save(&self, name: &str, config: &TunnelConfig) -> Result<(), TunwardenError> {
        if !self.file_for(name).exists() {
            return Err(TunwardenError::Tunnel(TunnelError::NotFound {
                name: name.to_string(),
            }));
        }
        self.write(name, config)
    }

    fn create(&self, name: &str, config: &TunnelConfig) -> Result<(), TunwardenError> {
        if self.file_for(name).exists() {
            return Err(TunwardenError::Tunnel(TunnelError::AlreadyExists {
                name: name.to_string(),
            }));
        }
        self.write(name, config)?;
        info!("Stored new tunnel {}", name);
        Ok(())
    }

    fn rename(&self, name: &str, replacement: &str) -> Result<(), TunwardenError> {
        let from = self.file_for(name);
        let to = self.file_for(replacement);
        if to.exists() {
            return Err(TunwardenError::Tunnel(TunnelError::AlreadyExists {
                name: replacement.to_string(),
            }));
        }
        std::fs::rename(&from, &to).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TunwardenError::Tunnel(TunnelError::NotFound {
                name: name.to_string(),
            }),
            _ => Self::store_error(name, format!("Failed to rename: {}", e)),
        })
    }

    fn delete(&self, name: &str) -> Result<(), TunwardenError> {
        std::fs::remove_file(self.file_for(name)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TunwardenError::Tunnel(TunnelError::NotFound {
                name: name.to_string(),
            }),
            _ => Self::store_error(name, format!("Failed to delete: {}", e)),
        })
    }
}
