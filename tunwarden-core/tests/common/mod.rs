//! Shared fakes for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tunwarden_core::backend::{Backend, BackendHandle, BackendKind};
use tunwarden_core::config::knobs::{KnobStore, UserKnobs};
use tunwarden_core::config::store::ConfigStore;
use tunwarden_core::config::{InterfaceConfig, Obfuscation, PeerConfig, TunnelConfig};
use tunwarden_core::error::{BackendError, MonitorError, TunnelError, TunwardenError};
use tunwarden_core::network::{ConnectivityCallback, ConnectivityProvider, NetworkRequest};
use tunwarden_core::tunnel::registry::TunnelRegistry;
use tunwarden_core::types::{KeyMaterial, Statistics, TunnelState};

pub const PRIVATE_KEY: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
pub const PEER_KEY: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";

pub fn sample_config() -> TunnelConfig {
    TunnelConfig {
        interface: InterfaceConfig {
            private_key: KeyMaterial::new(PRIVATE_KEY.to_string()),
            addresses: vec!["10.8.0.2/32".to_string()],
            dns: vec!["1.1.1.1".to_string()],
            listen_port: None,
            mtu: Some(1280),
            obfuscation: Obfuscation {
                jc: Some(4),
                jmin: Some(40),
                jmax: Some(70),
                ..Obfuscation::default()
            },
        },
        peers: vec![PeerConfig {
            public_key: PEER_KEY.to_string(),
            preshared_key: None,
            endpoint: Some("vpn.example.com:51820".to_string()),
            allowed_ips: vec!["0.0.0.0/0".to_string()],
            persistent_keepalive: Some(25),
        }],
    }
}

/// Operation recorded by [`MockBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Up(String),
    Down(String),
}

/// Backend that only records calls
pub struct MockBackend {
    kind: BackendKind,
    /// Bringing a tunnel up stops every other one
    single_tunnel: bool,
    running: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<(Call, Instant)>>,
    failing_up: Mutex<BTreeSet<String>>,
    failing_down: Mutex<BTreeSet<String>>,
    statistics: Mutex<HashMap<String, Statistics>>,
    statistics_gate: Mutex<Option<Arc<Notify>>>,
    statistics_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_kind(BackendKind::Kernel, false)
    }

    pub fn single_tunnel() -> Self {
        Self::with_kind(BackendKind::Userspace, true)
    }

    fn with_kind(kind: BackendKind, single_tunnel: bool) -> Self {
        Self {
            kind,
            single_tunnel,
            running: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
            failing_up: Mutex::new(BTreeSet::new()),
            failing_down: Mutex::new(BTreeSet::new()),
            statistics: Mutex::new(HashMap::new()),
            statistics_gate: Mutex::new(None),
            statistics_calls: AtomicUsize::new(0),
        }
    }

    /// Pretend `name` was already running before the registry loaded
    pub fn preload_running(&self, name: &str) {
        self.running.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_up(&self, name: &str) {
        self.failing_up.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_down(&self, name: &str) {
        self.failing_down.lock().unwrap().insert(name.to_string());
    }

    pub fn set_statistics(&self, name: &str, statistics: Statistics) {
        self.statistics
            .lock()
            .unwrap()
            .insert(name.to_string(), statistics);
    }

    /// Make statistics queries wait until the returned gate is notified
    pub fn hold_statistics(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.statistics_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn statistics_calls(&self) -> usize {
        self.statistics_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Call, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, name: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| match c {
                Call::Up(n) | Call::Down(n) => n == name,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((call, Instant::now()));
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn bring_up(&self, name: &str, _config: &TunnelConfig) -> Result<TunnelState, BackendError> {
        self.record(Call::Up(name.to_string()));
        if self.failing_up.lock().unwrap().contains(name) {
            return Err(BackendError::CommandFailed {
                command: format!("awg-quick up {}", name),
                code: 1,
            });
        }
        let mut running = self.running.lock().unwrap();
        if self.single_tunnel {
            running.clear();
        }
        running.insert(name.to_string());
        Ok(TunnelState::Up)
    }

    async fn bring_down(&self, name: &str) -> Result<(), BackendError> {
        self.record(Call::Down(name.to_string()));
        if self.failing_down.lock().unwrap().contains(name) {
            return Err(BackendError::PermissionDenied {
                reason: "root shell lost".to_string(),
            });
        }
        self.running.lock().unwrap().remove(name);
        Ok(())
    }

    async fn current_state(&self, name: &str) -> TunnelState {
        if self.running.lock().unwrap().contains(name) {
            TunnelState::Up
        } else {
            TunnelState::Down
        }
    }

    async fn statistics(&self, name: &str) -> Statistics {
        self.statistics_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.statistics_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.statistics
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    async fn running_tunnel_names(&self) -> BTreeSet<String> {
        self.running.lock().unwrap().clone()
    }

    async fn version(&self) -> Result<String, BackendError> {
        Ok("mock-1.0".to_string())
    }
}

/// In-memory [`ConfigStore`]
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: Mutex<BTreeMap<String, TunnelConfig>>,
}

impl MemoryConfigStore {
    pub fn with_tunnels(names: &[&str]) -> Self {
        let store = Self::default();
        for name in names {
            store
                .configs
                .lock()
                .unwrap()
                .insert(name.to_string(), sample_config());
        }
        store
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.configs.lock().unwrap().keys().cloned().collect()
    }
}

fn not_found(name: &str) -> TunwardenError {
    TunwardenError::Tunnel(TunnelError::NotFound {
        name: name.to_string(),
    })
}

impl ConfigStore for MemoryConfigStore {
    fn enumerate(&self) -> Result<BTreeSet<String>, TunwardenError> {
        Ok(self.names())
    }

    fn load(&self, name: &str) -> Result<TunnelConfig, TunwardenError> {
        self.configs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    fn save(&self, name: &str, config: &TunnelConfig) -> Result<(), TunwardenError> {
        let mut configs = self.configs.lock().unwrap();
        match configs.get_mut(name) {
            Some(slot) => {
                *slot = config.clone();
                Ok(())
            }
            None => Err(not_found(name)),
        }
    }

    fn create(&self, name: &str, config: &TunnelConfig) -> Result<(), TunwardenError> {
        let mut configs = self.configs.lock().unwrap();
        if configs.contains_key(name) {
            return Err(TunwardenError::Tunnel(TunnelError::AlreadyExists {
                name: name.to_string(),
            }));
        }
        configs.insert(name.to_string(), config.clone());
        Ok(())
    }

    fn rename(&self, name: &str, replacement: &str) -> Result<(), TunwardenError> {
        let mut configs = self.configs.lock().unwrap();
        let config = configs.remove(name).ok_or_else(|| not_found(name))?;
        configs.insert(replacement.to_string(), config);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), TunwardenError> {
        self.configs
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }
}

/// Connectivity provider driven by the test
pub struct MockProvider {
    permission: bool,
    fail_register: bool,
    sink: Mutex<Option<mpsc::UnboundedSender<ConnectivityCallback>>>,
    pub registrations: AtomicUsize,
    pub unregistrations: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            permission: true,
            fail_register: false,
            sink: Mutex::new(None),
            registrations: AtomicUsize::new(0),
            unregistrations: AtomicUsize::new(0),
        }
    }

    pub fn without_permission() -> Self {
        Self {
            permission: false,
            ..Self::new()
        }
    }

    pub fn failing_registration() -> Self {
        Self {
            fail_register: true,
            ..Self::new()
        }
    }

    /// Deliver a callback; false when nothing is registered
    pub fn emit(&self, callback: ConnectivityCallback) -> bool {
        match self.sink.lock().unwrap().as_ref() {
            Some(sink) => sink.send(callback).is_ok(),
            None => false,
        }
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn unregistrations(&self) -> usize {
        self.unregistrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProvider for MockProvider {
    fn has_network_state_permission(&self) -> bool {
        self.permission
    }

    async fn register(
        &self,
        _request: NetworkRequest,
        sink: mpsc::UnboundedSender<ConnectivityCallback>,
    ) -> Result<(), MonitorError> {
        if self.fail_register {
            return Err(MonitorError::RegistrationFailed("refused".to_string()));
        }
        self.registrations.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn unregister(&self) -> Result<(), MonitorError> {
        self.unregistrations.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = None;
        Ok(())
    }
}

/// Registry over `store` and an already resolved `backend`
pub struct Fixture {
    pub registry: Arc<TunnelRegistry>,
    pub backend: Arc<MockBackend>,
    pub knobs: Arc<KnobStore>,
    pub store: Arc<MemoryConfigStore>,
}

pub async fn fixture(tunnels: &[&str], backend: MockBackend) -> Fixture {
    fixture_with_knobs(tunnels, backend, UserKnobs::default()).await
}

pub async fn fixture_with_knobs(tunnels: &[&str], backend: MockBackend, knobs: UserKnobs) -> Fixture {
    let backend = Arc::new(backend);
    let handle = Arc::new(BackendHandle::new());
    handle.resolve(backend.clone());

    let store = Arc::new(MemoryConfigStore::with_tunnels(tunnels));
    let knobs = Arc::new(KnobStore::in_memory(knobs));
    let registry = Arc::new(TunnelRegistry::new(store.clone(), knobs.clone(), handle));
    registry.load().await.unwrap();

    Fixture {
        registry,
        backend,
        knobs,
        store,
    }
}
