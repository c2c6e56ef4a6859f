//! Tunnel reconnection after network changes
//!
//! When the network monitor reports a change onto a usable network, every
//! tunnel that is up gets cycled down and back up so it re-establishes on
//! the new network. Tunnels that are down are never touched.

use crate::network::NetworkChange;
use crate::tunnel::registry::TunnelRegistry;
use crate::tunnel::Tunnel;
use crate::types::{StateRequest, TransportType, TunnelState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Configuration for reconnection behavior (`[reconnection]`)
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReconnectionPolicy {
    /// Reconnect tunnels when the network changes
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Pause between bringing a tunnel down and up again, in milliseconds
    #[serde(default = "default_grace_interval")]
    pub grace_interval_ms: u64,
}

fn default_enabled() -> bool {
    true
}
fn default_grace_interval() -> u64 {
    500
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            grace_interval_ms: default_grace_interval(),
        }
    }
}

impl ReconnectionPolicy {
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.grace_interval_ms < 1 || self.grace_interval_ms > 30_000 {
            return Err(PolicyValidationError::InvalidGraceInterval(self.grace_interval_ms));
        }
        Ok(())
    }

    pub fn grace_interval(&self) -> Duration {
        Duration::from_millis(self.grace_interval_ms)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyValidationError {
    #[error("grace_interval_ms must be between 1 and 30000, got: {0}")]
    InvalidGraceInterval(u64),
}

/// Outcome of one reconnection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectionReport {
    pub reconnected: Vec<String>,
    /// Tunnel name and the reason its cycle failed
    pub failed: Vec<(String, String)>,
}

impl ReconnectionReport {
    pub fn is_empty(&self) -> bool {
        self.reconnected.is_empty() && self.failed.is_empty()
    }
}

/// Cycles running tunnels when the network changes
pub struct ReconnectionCoordinator {
    registry: Arc<TunnelRegistry>,
    policy: ReconnectionPolicy,
    /// Held for the duration of a pass
    pass_lock: Mutex<()>,
    stopped: AtomicBool,
}

impl ReconnectionCoordinator {
    pub fn new(registry: Arc<TunnelRegistry>, policy: ReconnectionPolicy) -> Self {
        Self {
            registry,
            policy,
            pass_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Refuse further passes and wait for the one in flight to finish
    ///
    /// A pass that already took tunnels down always brings them back up.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _pass = self.pass_lock.lock().await;
        debug!("Reconnection stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// React to a single network change
    ///
    /// Returns `None` when the change does not call for a pass: no usable
    /// network yet, or reconnection disabled.
    #[tracing::instrument(skip(self), fields(old = %change.old, new = %change.new))]
    pub async fn handle_network_change(&self, change: NetworkChange) -> Option<ReconnectionReport> {
        if change.new == TransportType::None {
            debug!("No network to reconnect onto, waiting for the next change");
            return None;
        }
        if !self.policy.enabled {
            debug!("Reconnection disabled");
            return None;
        }
        Some(self.reconnect_active_tunnels().await)
    }

    /// Cycle every tunnel that is up, one after another
    ///
    /// A failing tunnel is logged and recorded; the rest are still processed.
    pub async fn reconnect_active_tunnels(&self) -> ReconnectionReport {
        let _pass = self.pass_lock.lock().await;
        let mut report = ReconnectionReport::default();
        if self.is_stopped() {
            debug!("Reconnection stopped, skipping pass");
            return report;
        }

        let active: Vec<Arc<Tunnel>> = self
            .registry
            .list_tunnels()
            .into_iter()
            .filter(|t| t.state() == TunnelState::Up)
            .collect();
        if active.is_empty() {
            debug!("No running tunnels to reconnect");
            return report;
        }

        info!("Reconnecting {} tunnel(s) after network change", active.len());
        for tunnel in active {
            let name = tunnel.name();
            match self.cycle(&tunnel).await {
                Ok(()) => {
                    info!("Reconnected {}", name);
                    report.reconnected.push(name);
                }
                Err(e) => {
                    warn!("Failed to reconnect {}: {}", name, e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report
    }

    async fn cycle(&self, tunnel: &Arc<Tunnel>) -> crate::error::Result<()> {
        self.registry.set_tunnel_state(tunnel, StateRequest::Down).await?;
        tokio::time::sleep(self.policy.grace_interval()).await;
        self.registry.set_tunnel_state(tunnel, StateRequest::Up).await?;
        Ok(())
    }

    /// Consume network changes until the channel closes
    ///
    /// Changes that queued up while a pass was running are coalesced and
    /// only the latest one is acted on.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<NetworkChange>) {
        while let Some(mut change) = events.recv().await {
            if self.is_stopped() {
                break;
            }
            while let Ok(next) = events.try_recv() {
                debug!("Coalescing network change {} -> {}", change.old, change.new);
                change = next;
            }
            if let Some(report) = self.handle_network_change(change).await {
                if !report.failed.is_empty() {
                    warn!(
                        "Reconnection pass finished with {} failure(s)",
                        report.failed.len()
                    );
                }
            }
        }
        debug!("Reconnection loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectionPolicy::default();
        assert!(policy.enabled);
        assert_eq!(policy.grace_interval(), Duration::from_millis(500));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_policy_bounds() {
        let policy = ReconnectionPolicy {
            grace_interval_ms: 0,
            ..ReconnectionPolicy::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyValidationError::InvalidGraceInterval(0))
        );

        let policy = ReconnectionPolicy {
            grace_interval_ms: 60_000,
            ..ReconnectionPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: ReconnectionPolicy = toml::from_str("grace_interval_ms = 250").unwrap();
        assert_eq!(policy.grace_interval_ms, 250);
        assert!(policy.enabled);
    }
}
