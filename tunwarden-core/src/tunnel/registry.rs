//! Tunnel registry
//!
//! Owns every [`Tunnel`] and is the only place that calls the backend. Each
//! mutation holds the tunnel's operation lock for its whole duration, so two
//! requests for the same tunnel never interleave.

use super::{is_valid_name, Tunnel};
use crate::backend::{Backend, BackendHandle};
use crate::config::knobs::KnobStore;
use crate::config::store::ConfigStore;
use crate::config::TunnelConfig;
use crate::error::{ConfigError, TunnelError, TunwardenError};
use crate::types::{ConnectionStatus, StateRequest, Statistics, TunnelState};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, instrument, warn};

/// A handshake older than this no longer counts as connected
pub const HANDSHAKE_WINDOW: Duration = Duration::from_secs(180);

pub struct TunnelRegistry {
    store: Arc<dyn ConfigStore>,
    knobs: Arc<KnobStore>,
    backend: Arc<BackendHandle>,
    tunnels: RwLock<BTreeMap<String, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new(store: Arc<dyn ConfigStore>, knobs: Arc<KnobStore>, backend: Arc<BackendHandle>) -> Self {
        Self {
            store,
            knobs,
            backend,
            tunnels: RwLock::new(BTreeMap::new()),
        }
    }

    /// Populate the registry from the config store
    ///
    /// Waits for the backend so tunnels already running are marked up.
    pub async fn load(&self) -> Result<usize, TunwardenError> {
        let names = self.store.enumerate()?;
        let backend = self.backend.wait().await;
        let running = backend.running_tunnel_names().await;

        let mut tunnels = self.write_tunnels();
        for name in names {
            let state = if running.contains(&name) {
                TunnelState::Up
            } else {
                TunnelState::Down
            };
            tunnels
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Tunnel::new(name, None, state)));
        }
        info!("Loaded {} tunnel(s), {} running", tunnels.len(), running.len());
        Ok(tunnels.len())
    }

    /// All tunnels ordered by name
    pub fn list_tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.read_tunnels().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.read_tunnels().get(name).cloned()
    }

    /// Like [`TunnelRegistry::get`] but failing with `NotFound`
    pub fn require(&self, name: &str) -> Result<Arc<Tunnel>, TunwardenError> {
        self.get(name).ok_or_else(|| {
            TunwardenError::Tunnel(TunnelError::NotFound {
                name: name.to_string(),
            })
        })
    }

    pub fn last_used_tunnel(&self) -> Option<Arc<Tunnel>> {
        self.knobs
            .get()
            .last_used_tunnel
            .and_then(|name| self.get(&name))
    }

    /// Request a state change
    ///
    /// Toggle resolves against the current state. A request for the current
    /// state succeeds without touching the backend. A backend rejection
    /// leaves the tunnel unchanged and is reported as
    /// [`TunnelError::StateChangeRejected`].
    #[instrument(skip(self, tunnel), fields(tunnel = %tunnel.name()))]
    pub async fn set_tunnel_state(
        &self,
        tunnel: &Arc<Tunnel>,
        request: StateRequest,
    ) -> Result<TunnelState, TunwardenError> {
        let _op = tunnel.op_lock.lock().await;
        let name = self.ensure_registered(tunnel)?;

        let current = tunnel.state();
        let target = request.resolve(current);
        if target == current {
            debug!("Tunnel already {}", current);
            return Ok(current);
        }

        let backend = self.backend.wait().await;
        let result = match target {
            TunnelState::Up => {
                let config = self.config_for(tunnel)?;
                backend.bring_up(&name, &config).await
            }
            TunnelState::Down => backend.bring_down(&name).await.map(|_| TunnelState::Down),
        };

        let state = match result {
            Ok(state) => state,
            Err(source) => {
                warn!("Backend rejected {} for {}: {}", target, name, source);
                return Err(TunwardenError::Tunnel(TunnelError::StateChangeRejected {
                    name,
                    source,
                }));
            }
        };

        tunnel.on_state_changed(state);
        info!("Tunnel {} is now {}", name, state);

        if state == TunnelState::Up {
            if let Err(e) = self.knobs.set_last_used_tunnel(Some(name.clone())) {
                warn!("Failed to record last used tunnel: {}", e);
            }
            // The backend may have taken other tunnels down to make room
            self.sync_with_backend(backend.as_ref(), Some(&name)).await;
        }

        if let Err(e) = self.save_state() {
            warn!("Failed to save running tunnels: {}", e);
        }
        Ok(state)
    }

    /// Fresh configuration from the store, also refreshing the cache
    pub fn get_config(&self, tunnel: &Tunnel) -> Result<TunnelConfig, TunwardenError> {
        let config = self.store.load(&tunnel.name())?;
        tunnel.on_config_changed(Some(config.clone()));
        Ok(config)
    }

    /// Replace the configuration, re-applying it if the tunnel is up
    #[instrument(skip(self, tunnel, config), fields(tunnel = %tunnel.name()))]
    pub async fn set_config(&self, tunnel: &Arc<Tunnel>, config: TunnelConfig) -> Result<(), TunwardenError> {
        config.validate().map_err(|message| ConfigError::ValidationError { message })?;

        let _op = tunnel.op_lock.lock().await;
        let name = self.ensure_registered(tunnel)?;

        if tunnel.state() == TunnelState::Up {
            let backend = self.backend.wait().await;
            let state = backend
                .bring_up(&name, &config)
                .await
                .map_err(|source| TunnelError::StateChangeRejected {
                    name: name.clone(),
                    source,
                })?;
            tunnel.on_state_changed(state);
        }

        self.store.save(&name, &config)?;
        tunnel.on_config_changed(Some(config));
        info!("Updated configuration of {}", name);
        Ok(())
    }

    /// Add a new tunnel in the DOWN state
    pub fn create(&self, name: &str, config: TunnelConfig) -> Result<Arc<Tunnel>, TunwardenError> {
        if !is_valid_name(name) {
            return Err(TunnelError::InvalidName {
                name: name.to_string(),
            }
            .into());
        }
        if self.get(name).is_some() {
            return Err(TunnelError::AlreadyExists {
                name: name.to_string(),
            }
            .into());
        }
        config.validate().map_err(|message| ConfigError::ValidationError { message })?;

        self.store.create(name, &config)?;
        let tunnel = Arc::new(Tunnel::new(name.to_string(), Some(config), TunnelState::Down));

        let mut tunnels = self.write_tunnels();
        tunnels.insert(name.to_string(), Arc::clone(&tunnel));
        info!("Created tunnel {}", name);
        Ok(tunnel)
    }

    /// Rename a tunnel, cycling it if it is up
    #[instrument(skip(self, tunnel), fields(tunnel = %tunnel.name()))]
    pub async fn rename(&self, tunnel: &Arc<Tunnel>, new_name: &str) -> Result<String, TunwardenError> {
        if !is_valid_name(new_name) {
            return Err(TunnelError::InvalidName {
                name: new_name.to_string(),
            }
            .into());
        }

        let _op = tunnel.op_lock.lock().await;
        let old_name = self.ensure_registered(tunnel)?;
        if old_name == new_name {
            return Ok(old_name);
        }
        if self.get(new_name).is_some() {
            return Err(TunnelError::AlreadyExists {
                name: new_name.to_string(),
            }
            .into());
        }

        let was_up = tunnel.state() == TunnelState::Up;
        let backend = self.backend.wait().await;
        if was_up {
            backend
                .bring_down(&old_name)
                .await
                .map_err(|source| TunnelError::StateChangeRejected {
                    name: old_name.clone(),
                    source,
                })?;
            tunnel.on_state_changed(TunnelState::Down);
        }

        if let Err(e) = self.store.rename(&old_name, new_name) {
            if was_up {
                self.bring_back_up(backend.as_ref(), tunnel, &old_name).await;
            }
            return Err(e);
        }

        {
            let mut tunnels = self.write_tunnels();
            if let Some(entry) = tunnels.remove(&old_name) {
                tunnels.insert(new_name.to_string(), entry);
            }
        }
        tunnel.on_name_changed(new_name.to_string());

        if self.knobs.get().last_used_tunnel.as_deref() == Some(old_name.as_str()) {
            if let Err(e) = self.knobs.set_last_used_tunnel(Some(new_name.to_string())) {
                warn!("Failed to record last used tunnel: {}", e);
            }
        }

        if was_up {
            self.bring_back_up(backend.as_ref(), tunnel, new_name).await;
        }
        if let Err(e) = self.save_state() {
            warn!("Failed to save running tunnels: {}", e);
        }

        info!("Renamed tunnel {} to {}", old_name, new_name);
        Ok(new_name.to_string())
    }

    /// Remove a tunnel, taking it down first
    #[instrument(skip(self, tunnel), fields(tunnel = %tunnel.name()))]
    pub async fn delete(&self, tunnel: &Arc<Tunnel>) -> Result<(), TunwardenError> {
        let _op = tunnel.op_lock.lock().await;
        let name = self.ensure_registered(tunnel)?;

        if tunnel.state() == TunnelState::Up {
            let backend = self.backend.wait().await;
            backend
                .bring_down(&name)
                .await
                .map_err(|source| TunnelError::StateChangeRejected {
                    name: name.clone(),
                    source,
                })?;
            tunnel.on_state_changed(TunnelState::Down);
        }

        self.store.delete(&name)?;
        self.write_tunnels().remove(&name);

        if self.knobs.get().last_used_tunnel.as_deref() == Some(name.as_str()) {
            if let Err(e) = self.knobs.set_last_used_tunnel(None) {
                warn!("Failed to clear last used tunnel: {}", e);
            }
        }
        if let Err(e) = self.save_state() {
            warn!("Failed to save running tunnels: {}", e);
        }

        info!("Deleted tunnel {}", name);
        Ok(())
    }

    /// Fetch statistics and derive the connection status from handshakes
    ///
    /// A tunnel that is up counts as connected when any peer completed a
    /// handshake within [`HANDSHAKE_WINDOW`]. Holds the operation lock so a
    /// concurrent state change cannot land between the check and the publish.
    pub async fn get_statistics(&self, tunnel: &Arc<Tunnel>) -> Result<Statistics, TunwardenError> {
        let _op = tunnel.op_lock.lock().await;
        let backend = self.backend.wait().await;
        let statistics = backend.statistics(&tunnel.name()).await;

        if tunnel.state() == TunnelState::Up {
            tunnel.on_statistics_changed(Some(statistics.clone()));
            let status = if statistics.has_recent_handshake(SystemTime::now(), HANDSHAKE_WINDOW) {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Connecting
            };
            tunnel.on_connection_status_changed(status);
        }
        Ok(statistics)
    }

    /// Refresh statistics of every running tunnel
    pub async fn refresh_statistics(&self) {
        for tunnel in self.list_tunnels() {
            if tunnel.state() != TunnelState::Up {
                continue;
            }
            if let Err(e) = self.get_statistics(&tunnel).await {
                debug!("Statistics refresh failed for {}: {}", tunnel.name(), e);
            }
        }
    }

    /// Take every tunnel down, returning the failures
    pub async fn set_all_down(&self) -> Vec<(String, TunwardenError)> {
        let mut failures = Vec::new();
        for tunnel in self.list_tunnels() {
            if let Err(e) = self.set_tunnel_state(&tunnel, StateRequest::Down).await {
                warn!("Failed to bring {} down: {}", tunnel.name(), e);
                failures.push((tunnel.name(), e));
            }
        }
        failures
    }

    /// Persist the set of running tunnels
    pub fn save_state(&self) -> Result<(), TunwardenError> {
        let running: BTreeSet<String> = self
            .list_tunnels()
            .into_iter()
            .filter(|t| t.state() == TunnelState::Up)
            .map(|t| t.name())
            .collect();
        self.knobs.set_running_tunnels(running)
    }

    /// Bring up the tunnels that were running when state was last saved
    ///
    /// Does nothing unless `force` is set or the restore-on-boot knob is on.
    /// Returns how many tunnels were brought up.
    pub async fn restore_state(&self, force: bool) -> Result<usize, TunwardenError> {
        let knobs = self.knobs.get();
        if !force && !knobs.restore_on_boot {
            debug!("Restore on boot disabled");
            return Ok(0);
        }

        let mut restored = 0;
        for name in knobs.running_tunnels {
            let Some(tunnel) = self.get(&name) else {
                warn!("Cannot restore unknown tunnel {}", name);
                continue;
            };
            match self.set_tunnel_state(&tunnel, StateRequest::Up).await {
                Ok(_) => restored += 1,
                Err(e) => warn!("Failed to restore {}: {}", name, e),
            }
        }
        info!("Restored {} tunnel(s)", restored);
        Ok(restored)
    }

    /// Bring `tunnel` up as `name` after a rename, logging failures
    async fn bring_back_up(&self, backend: &dyn Backend, tunnel: &Tunnel, name: &str) {
        match self.config_for(tunnel) {
            Ok(config) => match backend.bring_up(name, &config).await {
                Ok(state) => {
                    tunnel.on_state_changed(state);
                }
                Err(e) => warn!("Failed to bring {} back up: {}", name, e),
            },
            Err(e) => warn!("Failed to load configuration of {}: {}", name, e),
        }
    }

    /// Mark tunnels down that the backend no longer runs
    ///
    /// Tunnels with an operation in flight are skipped; that operation
    /// publishes its own result.
    async fn sync_with_backend(&self, backend: &dyn Backend, except: Option<&str>) {
        let running = backend.running_tunnel_names().await;
        for tunnel in self.list_tunnels() {
            let name = tunnel.name();
            if Some(name.as_str()) == except || tunnel.state() != TunnelState::Up || running.contains(&name) {
                continue;
            }
            if let Ok(_op) = tunnel.op_lock.try_lock() {
                debug!("Tunnel {} was stopped by the backend", name);
                tunnel.on_state_changed(TunnelState::Down);
            }
        }
    }

    /// Current name of `tunnel`, failing with `NotFound` once it was deleted
    ///
    /// Must be called with the tunnel's operation lock held.
    fn ensure_registered(&self, tunnel: &Arc<Tunnel>) -> Result<String, TunwardenError> {
        let name = tunnel.name();
        match self.get(&name) {
            Some(registered) if Arc::ptr_eq(&registered, tunnel) => Ok(name),
            _ => {
                debug!("Tunnel {} is no longer registered", name);
                Err(TunnelError::NotFound { name }.into())
            }
        }
    }

    fn config_for(&self, tunnel: &Tunnel) -> Result<TunnelConfig, TunwardenError> {
        match tunnel.cached_config() {
            Some(config) => Ok(config),
            None => self.get_config(tunnel),
        }
    }

    fn read_tunnels(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Tunnel>>> {
        self.tunnels.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_tunnels(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<Tunnel>>> {
        self.tunnels.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
