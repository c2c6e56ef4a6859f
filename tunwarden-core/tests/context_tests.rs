//! End-to-end tests over the application context

mod common;

use common::{Call, MemoryConfigStore, MockBackend, MockProvider};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tunwarden_core::config::knobs::{KnobStore, UserKnobs};
use tunwarden_core::config::toml_config::TomlConfig;
use tunwarden_core::context::AppContext;
use tunwarden_core::network::{ConnectivityCallback, NetworkCapabilities};
use tunwarden_core::types::{NetworkHandle, StateRequest, TransportType, TunnelState};

async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn fast_config() -> TomlConfig {
    let mut config = TomlConfig::default();
    config.reconnection.grace_interval_ms = 10;
    config
}

#[tokio::test]
async fn test_network_change_reconnects_running_tunnel() {
    // Given: A started context with one running and one stopped tunnel
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new());
    backend.preload_running("office");
    let provider = Arc::new(MockProvider::new());
    let ctx = AppContext::with_components(
        dir.path(),
        fast_config(),
        Arc::new(KnobStore::in_memory(UserKnobs::default())),
        Arc::new(MemoryConfigStore::with_tunnels(&["home", "office"])),
        provider.clone(),
    );
    ctx.backend().resolve(backend.clone());
    ctx.start();
    eventually(|| ctx.monitor().is_bound()).await;
    assert_eq!(ctx.registry().require("office").unwrap().state(), TunnelState::Up);

    // When: WiFi is the baseline and then the device moves to validated cellular
    let wlan = NetworkHandle::new("wlan");
    let lte = NetworkHandle::new("lte");
    provider.emit(ConnectivityCallback::CapabilitiesChanged(
        wlan,
        NetworkCapabilities::new(vec![TransportType::Wifi], true, true),
    ));
    provider.emit(ConnectivityCallback::CapabilitiesChanged(
        lte,
        NetworkCapabilities::new(vec![TransportType::Cellular], true, true),
    ));

    // Then: Only the running tunnel is cycled
    eventually(|| backend.calls().len() >= 2).await;
    assert_eq!(
        backend.calls(),
        vec![Call::Down("office".to_string()), Call::Up("office".to_string())]
    );
    assert!(backend.calls_for("home").is_empty());

    ctx.shutdown().await;
    assert!(!ctx.monitor().is_bound());
    assert_eq!(provider.unregistrations(), 1);
}

#[tokio::test]
async fn test_start_restores_tunnels_when_enabled() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new());
    let knobs = Arc::new(KnobStore::in_memory(UserKnobs {
        restore_on_boot: true,
        running_tunnels: ["home".to_string()].into_iter().collect(),
        ..UserKnobs::default()
    }));
    let ctx = AppContext::with_components(
        dir.path(),
        fast_config(),
        knobs,
        Arc::new(MemoryConfigStore::with_tunnels(&["home", "office"])),
        Arc::new(MockProvider::new()),
    );
    ctx.backend().resolve(backend.clone());

    ctx.start();
    eventually(|| ctx.monitor().is_bound()).await;

    assert_eq!(backend.calls(), vec![Call::Up("home".to_string())]);
    assert_eq!(ctx.registry().require("home").unwrap().state(), TunnelState::Up);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_persists_running_tunnels() {
    let dir = tempdir().unwrap();
    let knobs = Arc::new(KnobStore::open(dir.path()).unwrap());
    let ctx = AppContext::with_components(
        dir.path(),
        fast_config(),
        knobs,
        Arc::new(MemoryConfigStore::with_tunnels(&["home"])),
        Arc::new(MockProvider::new()),
    );
    ctx.backend().resolve(Arc::new(MockBackend::new()));
    ctx.start();
    eventually(|| ctx.monitor().is_bound()).await;

    let home = ctx.registry().require("home").unwrap();
    ctx.registry()
        .set_tunnel_state(&home, StateRequest::Up)
        .await
        .unwrap();
    ctx.shutdown().await;

    // The knob file on disk remembers the running tunnel
    let reopened = KnobStore::open(dir.path()).unwrap();
    assert!(reopened.get().running_tunnels.contains("home"));
    assert_eq!(reopened.get().last_used_tunnel.as_deref(), Some("home"));
}

#[tokio::test]
async fn test_shutdown_mid_grace_brings_tunnel_back_up() {
    // Given: A reconnection pass that took the running tunnel down and is
    // waiting out a long grace interval
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new());
    backend.preload_running("office");
    let provider = Arc::new(MockProvider::new());
    let knobs = Arc::new(KnobStore::in_memory(UserKnobs::default()));
    let mut config = TomlConfig::default();
    config.reconnection.grace_interval_ms = 300;
    let ctx = AppContext::with_components(
        dir.path(),
        config,
        knobs.clone(),
        Arc::new(MemoryConfigStore::with_tunnels(&["office"])),
        provider.clone(),
    );
    ctx.backend().resolve(backend.clone());
    ctx.start();
    eventually(|| ctx.monitor().is_bound()).await;

    provider.emit(ConnectivityCallback::CapabilitiesChanged(
        NetworkHandle::new("wlan"),
        NetworkCapabilities::new(vec![TransportType::Wifi], true, true),
    ));
    provider.emit(ConnectivityCallback::CapabilitiesChanged(
        NetworkHandle::new("lte"),
        NetworkCapabilities::new(vec![TransportType::Cellular], true, true),
    ));
    eventually(|| !backend.calls().is_empty()).await;
    assert_eq!(backend.calls(), vec![Call::Down("office".to_string())]);

    // When: The context shuts down during the grace interval
    ctx.shutdown().await;

    // Then: The pass completed and the tunnel is remembered as running
    assert_eq!(
        backend.calls(),
        vec![Call::Down("office".to_string()), Call::Up("office".to_string())]
    );
    assert_eq!(ctx.registry().require("office").unwrap().state(), TunnelState::Up);
    assert!(knobs.get().running_tunnels.contains("office"));
}
