//! Tests for cycling running tunnels after network changes

mod common;

use common::{fixture, Call, MockBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tunwarden_core::network::NetworkChange;
use tunwarden_core::reconnection::{ReconnectionCoordinator, ReconnectionPolicy, ReconnectionReport};
use tunwarden_core::types::{StateRequest, TransportType, TunnelState};

fn to(new: TransportType) -> NetworkChange {
    NetworkChange {
        old: TransportType::Wifi,
        new,
    }
}

#[tokio::test(start_paused = true)]
async fn test_only_running_tunnels_are_cycled() {
    // Given: Tunnel A is up and tunnel B is down
    let f = fixture(&["a", "b"], MockBackend::new()).await;
    let a = f.registry.require("a").unwrap();
    f.registry.set_tunnel_state(&a, StateRequest::Up).await.unwrap();
    f.backend.clear_calls();
    let coordinator = ReconnectionCoordinator::new(f.registry.clone(), ReconnectionPolicy::default());

    // When: The network changes to cellular
    let report = coordinator
        .handle_network_change(to(TransportType::Cellular))
        .await
        .unwrap();

    // Then: Exactly one DOWN -> UP cycle on A and nothing on B
    assert_eq!(
        f.backend.calls(),
        vec![Call::Down("a".to_string()), Call::Up("a".to_string())]
    );
    assert!(f.backend.calls_for("b").is_empty());
    assert_eq!(report.reconnected, vec!["a".to_string()]);
    assert!(report.failed.is_empty());
    assert_eq!(a.state(), TunnelState::Up);
}

#[tokio::test(start_paused = true)]
async fn test_no_network_means_no_operation() {
    let f = fixture(&["a", "b"], MockBackend::new()).await;
    for tunnel in f.registry.list_tunnels() {
        f.registry.set_tunnel_state(&tunnel, StateRequest::Up).await.unwrap();
    }
    f.backend.clear_calls();
    let coordinator = ReconnectionCoordinator::new(f.registry.clone(), ReconnectionPolicy::default());

    let report = coordinator.handle_network_change(to(TransportType::None)).await;

    assert!(report.is_none());
    assert!(f.backend.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_grace_interval_between_down_and_up() {
    let f = fixture(&["a"], MockBackend::new()).await;
    let a = f.registry.require("a").unwrap();
    f.registry.set_tunnel_state(&a, StateRequest::Up).await.unwrap();
    f.backend.clear_calls();
    let coordinator = ReconnectionCoordinator::new(f.registry.clone(), ReconnectionPolicy::default());

    coordinator.handle_network_change(to(TransportType::Wifi)).await;

    let calls = f.backend.timed_calls();
    assert_eq!(calls.len(), 2);
    let waited = calls[1].1 - calls[0].1;
    assert!(
        waited >= Duration::from_millis(500),
        "expected at least the grace interval, waited {:?}",
        waited
    );
}

#[tokio::test(start_paused = true)]
async fn test_one_failure_does_not_stop_the_others() {
    // Given: Three running tunnels, the middle one cannot come back up
    let backend = MockBackend::new();
    let f = fixture(&["a", "b", "c"], backend).await;
    for tunnel in f.registry.list_tunnels() {
        f.registry.set_tunnel_state(&tunnel, StateRequest::Up).await.unwrap();
    }
    f.backend.fail_up("b");
    f.backend.clear_calls();
    let coordinator = ReconnectionCoordinator::new(f.registry.clone(), ReconnectionPolicy::default());

    // When: The network changes
    let report = coordinator.reconnect_active_tunnels().await;

    // Then: a and c were reconnected, b is reported and left down
    assert_eq!(report.reconnected, vec!["a".to_string(), "c".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "b");
    assert_eq!(f.registry.require("b").unwrap().state(), TunnelState::Down);
    assert_eq!(f.registry.require("c").unwrap().state(), TunnelState::Up);
}

#[tokio::test(start_paused = true)]
async fn test_nothing_running_is_an_empty_pass() {
    let f = fixture(&["a"], MockBackend::new()).await;
    let coordinator = ReconnectionCoordinator::new(f.registry.clone(), ReconnectionPolicy::default());

    let report = coordinator
        .handle_network_change(to(TransportType::Cellular))
        .await
        .unwrap();

    assert!(report.is_empty());
    assert!(f.backend.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_policy_skips_reconnection() {
    let f = fixture(&["a"], MockBackend::new()).await;
    let a = f.registry.require("a").unwrap();
    f.registry.set_tunnel_state(&a, StateRequest::Up).await.unwrap();
    f.backend.clear_calls();
    let policy = ReconnectionPolicy {
        enabled: false,
        ..ReconnectionPolicy::default()
    };
    let coordinator = ReconnectionCoordinator::new(f.registry.clone(), policy);

    assert!(coordinator
        .handle_network_change(to(TransportType::Cellular))
        .await
        .is_none());
    assert!(f.backend.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_coalesces_queued_changes() {
    // Given: A running tunnel and three changes queued before the loop starts
    let f = fixture(&["a"], MockBackend::new()).await;
    let a = f.registry.require("a").unwrap();
    f.registry.set_tunnel_state(&a, StateRequest::Up).await.unwrap();
    f.backend.clear_calls();

    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(to(TransportType::None)).unwrap();
    tx.send(to(TransportType::Cellular)).unwrap();
    tx.send(to(TransportType::Wifi)).unwrap();
    drop(tx);

    // When: The loop drains the channel
    let coordinator = Arc::new(ReconnectionCoordinator::new(
        f.registry.clone(),
        ReconnectionPolicy::default(),
    ));
    coordinator.run(rx).await;

    // Then: A single pass ran for the latest change
    assert_eq!(
        f.backend.calls(),
        vec![Call::Down("a".to_string()), Call::Up("a".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_passes_do_not_overlap() {
    let f = fixture(&["a"], MockBackend::new()).await;
    let a = f.registry.require("a").unwrap();
    f.registry.set_tunnel_state(&a, StateRequest::Up).await.unwrap();
    f.backend.clear_calls();
    let coordinator = Arc::new(ReconnectionCoordinator::new(
        f.registry.clone(),
        ReconnectionPolicy::default(),
    ));

    let first = {
        let c = coordinator.clone();
        tokio::spawn(async move { c.handle_network_change(to(TransportType::Cellular)).await })
    };
    let second = {
        let c = coordinator.clone();
        tokio::spawn(async move { c.handle_network_change(to(TransportType::Cellular)).await })
    };
    first.await.unwrap();
    second.await.unwrap();

    // Each pass completes its cycle before the next one starts
    assert_eq!(
        f.backend.calls(),
        vec![
            Call::Down("a".to_string()),
            Call::Up("a".to_string()),
            Call::Down("a".to_string()),
            Call::Up("a".to_string()),
        ]
    );
    assert_eq!(a.state(), TunnelState::Up);
}

#[tokio::test(start_paused = true)]
async fn test_tunnel_deleted_during_grace_is_not_restarted() {
    // Given: A pass that has taken tunnel A down and is waiting out the grace interval
    let f = fixture(&["a"], MockBackend::new()).await;
    let a = f.registry.require("a").unwrap();
    f.registry.set_tunnel_state(&a, StateRequest::Up).await.unwrap();
    f.backend.clear_calls();
    let coordinator = Arc::new(ReconnectionCoordinator::new(
        f.registry.clone(),
        ReconnectionPolicy::default(),
    ));
    let pass = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.reconnect_active_tunnels().await }
    });
    while f.backend.calls().is_empty() {
        tokio::task::yield_now().await;
    }

    // When: The tunnel is deleted before the pass brings it back
    f.registry.delete(&a).await.unwrap();
    let report = pass.await.unwrap();

    // Then: The engine is not started again and the pass reports the failure
    assert_eq!(f.backend.calls(), vec![Call::Down("a".to_string())]);
    assert!(report.reconnected.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "a");
    assert!(f.registry.get("a").is_none());
    assert!(!f.knobs.get().running_tunnels.contains("a"));
}

#[tokio::test(start_paused = true)]
async fn test_stopped_coordinator_skips_passes() {
    let f = fixture(&["a"], MockBackend::new()).await;
    let a = f.registry.require("a").unwrap();
    f.registry.set_tunnel_state(&a, StateRequest::Up).await.unwrap();
    f.backend.clear_calls();
    let coordinator = ReconnectionCoordinator::new(f.registry.clone(), ReconnectionPolicy::default());

    coordinator.stop().await;
    let report = coordinator
        .handle_network_change(to(TransportType::Cellular))
        .await
        .unwrap();

    assert!(coordinator.is_stopped());
    assert_eq!(report, ReconnectionReport::default());
    assert!(f.backend.calls().is_empty());
    assert_eq!(a.state(), TunnelState::Up);
}
