//! Kernel module engine
//!
//! Tunnels are brought up and down with `awg-quick` through the
//! [`RootShell`]. Unless multiple tunnels are allowed, bringing one tunnel
//! up first takes every other running tunnel down, and restores them if
//! anything along the way fails.

use super::root_shell::RootShell;
use super::{parse_interfaces, parse_show_dump, write_runtime_config, Backend, BackendKind, EngineSettings};
use crate::config::TunnelConfig;
use crate::error::BackendError;
use crate::types::{Statistics, TunnelState};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Whether the kernel module is loaded on this host
pub fn has_kernel_support(settings: &EngineSettings) -> bool {
    settings.kernel_module_path.is_dir()
}

pub struct KernelBackend {
    shell: Arc<RootShell>,
    settings: EngineSettings,
    /// Configurations of the tunnels this backend brought up
    running: Mutex<HashMap<String, TunnelConfig>>,
    multiple_tunnels: AtomicBool,
}

impl KernelBackend {
    /// The shell must already be started
    pub fn new(shell: Arc<RootShell>, settings: EngineSettings) -> Self {
        Self {
            shell,
            settings,
            running: Mutex::new(HashMap::new()),
            multiple_tunnels: AtomicBool::new(false),
        }
    }

    /// Takes effect on the next bring-up
    pub fn set_multiple_tunnels(&self, allowed: bool) {
        let previous = self.multiple_tunnels.swap(allowed, Ordering::SeqCst);
        if previous != allowed {
            info!("Multiple tunnels {}", if allowed { "allowed" } else { "disallowed" });
        }
    }

    pub fn multiple_tunnels(&self) -> bool {
        self.multiple_tunnels.load(Ordering::SeqCst)
    }

    /// Bring back tunnels that were taken down to make room
    async fn restore_displaced(
        &self,
        running: &mut HashMap<String, TunnelConfig>,
        displaced: &[(String, TunnelConfig)],
    ) {
        for (name, config) in displaced {
            if let Err(e) = self.apply(running, name, config, TunnelState::Up).await {
                warn!("Failed to restore displaced tunnel {}: {}", name, e);
            }
        }
    }

    /// Run `awg-quick up|down` for `name` and record the result
    async fn apply(
        &self,
        running: &mut HashMap<String, TunnelConfig>,
        name: &str,
        config: &TunnelConfig,
        state: TunnelState,
    ) -> Result<(), BackendError> {
        let path = write_runtime_config(&self.settings, name, &config.to_quick_string()).await?;
        let path_str = path.to_string_lossy().to_string();
        let action = match state {
            TunnelState::Up => "up",
            TunnelState::Down => "down",
        };

        let result = self
            .shell
            .run(&self.settings.awg_quick, &[action, path_str.as_str()])
            .await;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Failed to remove {}: {}", path_str, e);
        }

        result?.check(&format!("{} {} {}", self.settings.awg_quick, action, name))?;

        match state {
            TunnelState::Up => running.insert(name.to_string(), config.clone()),
            TunnelState::Down => running.remove(name),
        };
        debug!(tunnel = %name, state = %state, "awg-quick finished");
        Ok(())
    }
}

#[async_trait]
impl Backend for KernelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kernel
    }

    #[instrument(skip(self, config))]
    async fn bring_up(&self, name: &str, config: &TunnelConfig) -> Result<TunnelState, BackendError> {
        let mut running = self.running.lock().await;
        let original_state = self.current_state(name).await;
        let original_config = running.get(name).cloned();

        // Tunnels taken down to make room, restored on failure
        let mut displaced: Vec<(String, TunnelConfig)> = Vec::new();
        if !self.multiple_tunnels() && original_state == TunnelState::Down {
            let others: Vec<(String, TunnelConfig)> = running
                .iter()
                .filter(|(other, _)| other.as_str() != name)
                .map(|(other, cfg)| (other.clone(), cfg.clone()))
                .collect();

            for (other, cfg) in others {
                info!("Bringing {} down to make room for {}", other, name);
                if let Err(e) = self.apply(&mut running, &other, &cfg, TunnelState::Down).await {
                    self.restore_displaced(&mut running, &displaced).await;
                    return Err(e);
                }
                displaced.push((other, cfg));
            }
        }

        // Reconfiguring a running tunnel means a full down/up cycle
        if original_state == TunnelState::Up {
            let current = original_config.clone().unwrap_or_else(|| config.clone());
            self.apply(&mut running, name, &current, TunnelState::Down).await?;
        }

        if let Err(e) = self.apply(&mut running, name, config, TunnelState::Up).await {
            warn!("Failed to bring {} up: {}", name, e);
            if let (TunnelState::Up, Some(previous)) = (original_state, original_config.as_ref()) {
                if let Err(restore) = self.apply(&mut running, name, previous, TunnelState::Up).await {
                    warn!("Failed to restore previous configuration of {}: {}", name, restore);
                }
            }
            self.restore_displaced(&mut running, &displaced).await;
            return Err(e);
        }

        info!("Tunnel {} is up", name);
        Ok(TunnelState::Up)
    }

    #[instrument(skip(self))]
    async fn bring_down(&self, name: &str) -> Result<(), BackendError> {
        let mut running = self.running.lock().await;
        if let Some(config) = running.get(name).cloned() {
            self.apply(&mut running, name, &config, TunnelState::Down).await?;
        } else if self.current_state(name).await == TunnelState::Up {
            // Started outside this process; awg-quick resolves the name itself
            self.shell
                .run(&self.settings.awg_quick, &["down", name])
                .await?
                .check(&format!("{} down {}", self.settings.awg_quick, name))?;
        } else {
            debug!("Tunnel {} already down", name);
        }
        info!("Tunnel {} is down", name);
        Ok(())
    }

    async fn current_state(&self, name: &str) -> TunnelState {
        if self.running_tunnel_names().await.contains(name) {
            TunnelState::Up
        } else {
            TunnelState::Down
        }
    }

    async fn statistics(&self, name: &str) -> Statistics {
        match self.shell.run(&self.settings.awg, &["show", name, "dump"]).await {
            Ok(output) if output.success() => parse_show_dump(&output.stdout),
            Ok(output) => {
                debug!("awg show {} dump exited with {}", name, output.code);
                Statistics::new()
            }
            Err(e) => {
                debug!("Unable to query statistics of {}: {}", name, e);
                Statistics::new()
            }
        }
    }

    async fn running_tunnel_names(&self) -> BTreeSet<String> {
        match self.shell.run(&self.settings.awg, &["show", "interfaces"]).await {
            Ok(output) if output.success() => parse_interfaces(&output.stdout),
            Ok(output) => {
                warn!("awg show interfaces exited with {}", output.code);
                BTreeSet::new()
            }
            Err(e) => {
                warn!("Unable to enumerate running tunnels: {}", e);
                BTreeSet::new()
            }
        }
    }

    async fn version(&self) -> Result<String, BackendError> {
        read_module_version(&self.settings.kernel_module_path).await
    }
}

async fn read_module_version(module_path: &Path) -> Result<String, BackendError> {
    let version = tokio::fs::read_to_string(module_path.join("version"))
        .await
        .map_err(|_| BackendError::UnknownKernelModule)?;
    let version = version.trim();
    if version.is_empty() {
        return Err(BackendError::UnknownKernelModule);
    }
    Ok(version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_kernel_support_follows_module_directory() {
        let dir = tempdir().unwrap();
        let mut settings = EngineSettings::default();

        settings.kernel_module_path = dir.path().join("amneziawg");
        assert!(!has_kernel_support(&settings));

        std::fs::create_dir(&settings.kernel_module_path).unwrap();
        assert!(has_kernel_support(&settings));
    }

    #[tokio::test]
    async fn test_module_version() {
        let dir = tempdir().unwrap();
        assert_eq!(
            read_module_version(dir.path()).await,
            Err(BackendError::UnknownKernelModule)
        );

        std::fs::write(dir.path().join("version"), "1.0.20240213\n").unwrap();
        assert_eq!(read_module_version(dir.path()).await.unwrap(), "1.0.20240213");
    }

    #[test]
    fn test_multiple_tunnels_toggle() {
        let backend = KernelBackend::new(Arc::new(RootShell::new()), EngineSettings::default());
        assert!(!backend.multiple_tunnels());
        backend.set_multiple_tunnels(true);
        assert!(backend.multiple_tunnels());
    }

    #[tokio::test]
    async fn test_unstarted_shell_rejects_bring_up() {
        let dir = tempdir().unwrap();
        let settings = EngineSettings {
            runtime_dir: dir.path().to_path_buf(),
            ..EngineSettings::default()
        };
        let backend = KernelBackend::new(Arc::new(RootShell::new()), settings);
        let config: TunnelConfig = toml::from_str(
            "[interface]\nprivate_key = \"yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\"\n",
        )
        .unwrap();

        let result = backend.bring_up("wg0", &config).await;
        assert!(matches!(result, Err(BackendError::PermissionDenied { .. })));
        // The rendered file is cleaned up even when the command never ran
        assert!(!dir.path().join("wg0.conf").exists());
    }

    #[tokio::test]
    async fn test_failed_restore_of_displaced_tunnels_is_not_recorded() {
        let dir = tempdir().unwrap();
        let settings = EngineSettings {
            runtime_dir: dir.path().to_path_buf(),
            ..EngineSettings::default()
        };
        let backend = KernelBackend::new(Arc::new(RootShell::new()), settings);
        let config: TunnelConfig = toml::from_str(
            "[interface]\nprivate_key = \"yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\"\n",
        )
        .unwrap();
        let displaced = vec![("wg1".to_string(), config.clone()), ("wg2".to_string(), config)];
        let mut running = HashMap::new();

        // Every restore fails without a root shell; all of them are attempted
        backend.restore_displaced(&mut running, &displaced).await;

        assert!(running.is_empty());
        assert!(!dir.path().join("wg1.conf").exists());
        assert!(!dir.path().join("wg2.conf").exists());
    }
}
