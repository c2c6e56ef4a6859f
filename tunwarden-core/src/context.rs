//! Application context
//!
//! Owns one instance of every long-lived component and wires them together.
//! Built once by the daemon and handed to whoever needs the components.

use crate::backend::{BackendHandle, BackendSelector};
use crate::config::knobs::KnobStore;
use crate::config::store::{ConfigStore, FileConfigStore};
use crate::config::toml_config::{config_path_in, ensure_config_dir, TomlConfig};
use crate::error::TunwardenError;
use crate::network::networkmanager::NetworkManagerProvider;
use crate::network::{ConnectivityProvider, NetworkChange, NetworkMonitor};
use crate::reconnection::ReconnectionCoordinator;
use crate::tunnel::registry::TunnelRegistry;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct AppContext {
    config_dir: PathBuf,
    config: TomlConfig,
    knobs: Arc<KnobStore>,
    backend: Arc<BackendHandle>,
    registry: Arc<TunnelRegistry>,
    monitor: Arc<NetworkMonitor>,
    coordinator: Arc<ReconnectionCoordinator>,
    network_events: Mutex<Option<mpsc::UnboundedReceiver<NetworkChange>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppContext {
    /// Build the context from the files in `config_dir`
    pub fn open(config_dir: &Path) -> Result<Self, TunwardenError> {
        ensure_config_dir(config_dir)?;
        let config = TomlConfig::load_or_default(&config_path_in(config_dir))?;
        let knobs = Arc::new(KnobStore::open(config_dir)?);
        let store: Arc<dyn ConfigStore> = Arc::new(FileConfigStore::new(config_dir));
        let provider: Arc<dyn ConnectivityProvider> = Arc::new(NetworkManagerProvider::new(
            Duration::from_millis(config.monitor.poll_interval_ms),
        ));
        Ok(Self::with_components(config_dir, config, knobs, store, provider))
    }

    /// Build the context from explicit components
    pub fn with_components(
        config_dir: &Path,
        config: TomlConfig,
        knobs: Arc<KnobStore>,
        store: Arc<dyn ConfigStore>,
        provider: Arc<dyn ConnectivityProvider>,
    ) -> Self {
        let backend = Arc::new(BackendHandle::new());
        let registry = Arc::new(TunnelRegistry::new(store, Arc::clone(&knobs), Arc::clone(&backend)));
        let (monitor, network_events) = NetworkMonitor::new(provider);
        let coordinator = Arc::new(ReconnectionCoordinator::new(
            Arc::clone(&registry),
            config.reconnection.clone(),
        ));

        Self {
            config_dir: config_dir.to_path_buf(),
            config,
            knobs,
            backend,
            registry,
            monitor: Arc::new(monitor),
            coordinator,
            network_events: Mutex::new(Some(network_events)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start background work without waiting for any of it
    ///
    /// Backend selection, registry loading, boot restore and monitor binding
    /// run in that order on one task; the reconnection loop and the status
    /// poller run on their own.
    pub fn start(&self) {
        let mut tasks = self.lock_tasks();
        if !tasks.is_empty() {
            warn!("Application context already started");
            return;
        }

        let selector = BackendSelector::new(Arc::clone(&self.knobs), self.config.engine.clone());
        let backend = Arc::clone(&self.backend);
        let registry = Arc::clone(&self.registry);
        let monitor = Arc::clone(&self.monitor);
        tasks.push(tokio::spawn(async move {
            let selected = selector.select_into(&backend).await;
            info!("Tunnel backend: {}", selected.kind());

            if let Err(e) = registry.load().await {
                error!("Failed to load tunnels: {}", e);
            }
            if let Err(e) = registry.restore_state(false).await {
                warn!("Failed to restore tunnels: {}", e);
            }
            monitor.bind().await;
        }));

        let events = self
            .network_events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(events) = events {
            tasks.push(tokio::spawn(Arc::clone(&self.coordinator).run(events)));
        }

        let registry = Arc::clone(&self.registry);
        let backend = Arc::clone(&self.backend);
        let interval = Duration::from_millis(self.config.monitor.status_interval_ms);
        tasks.push(tokio::spawn(async move {
            backend.wait().await;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.refresh_statistics().await;
            }
        }));
    }

    /// Stop monitoring, persist running tunnels and cancel background tasks
    ///
    /// A reconnection pass in flight is allowed to finish first, so no tunnel
    /// is left down halfway through its cycle. Tunnels are left as they are.
    pub async fn shutdown(&self) {
        self.monitor.unbind().await;
        self.coordinator.stop().await;
        if let Err(e) = self.registry.save_state() {
            warn!("Failed to save running tunnels: {}", e);
        }
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        info!("Application context stopped");
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config(&self) -> &TomlConfig {
        &self.config
    }

    pub fn knobs(&self) -> &Arc<KnobStore> {
        &self.knobs
    }

    pub fn backend(&self) -> &Arc<BackendHandle> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn coordinator(&self) -> &Arc<ReconnectionCoordinator> {
        &self.coordinator
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }
}
