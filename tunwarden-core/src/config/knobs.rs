//! Persisted user knobs
//!
//! Small user preferences that survive restarts (`knobs.toml`). Every
//! change is written to disk and broadcast to subscribers so running
//! components can react without being rebuilt.

use crate::error::{ConfigError, TunwardenError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

const KNOBS_FILE_NAME: &str = "knobs.toml";

/// User preferences consumed by the supervisor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKnobs {
    /// Prefer the privileged kernel engine when the host supports it
    #[serde(default)]
    pub privileged_engine_enabled: bool,

    /// Allow more than one tunnel to be up at the same time
    #[serde(default)]
    pub multiple_tunnels: bool,

    /// Bring previously running tunnels back up on boot
    #[serde(default)]
    pub restore_on_boot: bool,

    /// Name of the last tunnel brought up
    #[serde(default)]
    pub last_used_tunnel: Option<String>,

    /// Tunnels that were up when state was last saved
    #[serde(default)]
    pub running_tunnels: BTreeSet<String>,
}

/// Knob storage with change notification
pub struct KnobStore {
    path: Option<PathBuf>,
    tx: watch::Sender<UserKnobs>,
    write_lock: Mutex<()>,
}

impl KnobStore {
    /// Open the knob file in `dir`, starting from defaults if it is missing
    pub fn open(dir: &Path) -> Result<Self, TunwardenError> {
        let path = dir.join(KNOBS_FILE_NAME);
        let knobs = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| {
                TunwardenError::Config(ConfigError::IoError {
                    message: format!("Failed to read knobs file: {}", e),
                })
            })?;
            toml::from_str(&contents)?
        } else {
            UserKnobs::default()
        };

        Ok(Self {
            path: Some(path),
            tx: watch::channel(knobs).0,
            write_lock: Mutex::new(()),
        })
    }

    /// Non-persistent store, used by one-shot commands and tests
    pub fn in_memory(knobs: UserKnobs) -> Self {
        Self {
            path: None,
            tx: watch::channel(knobs).0,
            write_lock: Mutex::new(()),
        }
    }

    /// Current knob values
    pub fn get(&self) -> UserKnobs {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every knob change
    pub fn subscribe(&self) -> watch::Receiver<UserKnobs> {
        self.tx.subscribe()
    }

    /// Apply `f`, persist and notify subscribers if anything changed
    pub fn update<F>(&self, f: F) -> Result<(), TunwardenError>
    where
        F: FnOnce(&mut UserKnobs),
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut next = self.get();
        f(&mut next);
        if next == *self.tx.borrow() {
            return Ok(());
        }

        if let Some(ref path) = self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, toml::to_string_pretty(&next)?).map_err(|_| {
                TunwardenError::Config(ConfigError::SaveFailed {
                    path: path.to_string_lossy().to_string(),
                })
            })?;
        }

        debug!("User knobs updated: {:?}", next);
        self.tx.send_replace(next);
        Ok(())
    }

    pub fn set_privileged_engine_enabled(&self, enabled: bool) -> Result<(), TunwardenError> {
        self.update(|k| k.privileged_engine_enabled = enabled)
    }

    pub fn set_multiple_tunnels(&self, allowed: bool) -> Result<(), TunwardenError> {
        self.update(|k| k.multiple_tunnels = allowed)
    }

    pub fn set_last_used_tunnel(&self, name: Option<String>) -> Result<(), TunwardenError> {
        self.update(|k| k.last_used_tunnel = name)
    }

    pub fn set_running_tunnels(&self, names: BTreeSet<String>) -> Result<(), TunwardenError> {
        self.update(|k| k.running_tunnels = names)
    }
}
