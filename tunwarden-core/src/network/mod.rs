//! Network monitoring
//!
//! A [`ConnectivityProvider`] reports raw connectivity callbacks for
//! networks that satisfy a [`NetworkRequest`]. The [`monitor::NetworkMonitor`]
//! debounces them into [`NetworkChange`] events.

use crate::error::MonitorError;
use crate::types::{NetworkHandle, TransportType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod monitor;
pub mod networkmanager;

pub use monitor::{NetworkMonitor, NetworkTracker};

/// Capabilities reported for a network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkCapabilities {
    pub transports: Vec<TransportType>,
    /// The network claims internet access
    pub internet: bool,
    /// Internet access has been verified
    pub validated: bool,
}

impl NetworkCapabilities {
    pub fn new(transports: Vec<TransportType>, internet: bool, validated: bool) -> Self {
        Self {
            transports,
            internet,
            validated,
        }
    }

    pub fn has_transport(&self, transport: TransportType) -> bool {
        self.transports.contains(&transport)
    }
}

/// Filter describing which networks the monitor wants to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub require_internet: bool,
    /// Any of these transports qualifies
    pub transports: Vec<TransportType>,
}

impl NetworkRequest {
    /// Internet capable networks over WiFi or cellular
    pub fn internet_over_wifi_or_cellular() -> Self {
        Self {
            require_internet: true,
            transports: vec![TransportType::Wifi, TransportType::Cellular],
        }
    }

    pub fn matches(&self, caps: &NetworkCapabilities) -> bool {
        (!self.require_internet || caps.internet)
            && self.transports.iter().any(|t| caps.has_transport(*t))
    }
}

/// Raw callback from a connectivity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityCallback {
    Available(NetworkHandle),
    CapabilitiesChanged(NetworkHandle, NetworkCapabilities),
    Lost(NetworkHandle),
}

/// Platform connectivity subsystem
///
/// Callbacks for one registration are delivered in order on `sink`.
#[async_trait]
pub trait ConnectivityProvider: Send + Sync {
    /// Whether this process may observe network state
    fn has_network_state_permission(&self) -> bool;

    async fn register(
        &self,
        request: NetworkRequest,
        sink: mpsc::UnboundedSender<ConnectivityCallback>,
    ) -> Result<(), MonitorError>;

    async fn unregister(&self) -> Result<(), MonitorError>;
}

/// Debounced network change, `old` and `new` are the transports before and after
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkChange {
    pub old: TransportType,
    pub new: TransportType,
}

/// `[monitor]` section of config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// How often NetworkManager is polled for the primary connection
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How often tunnel statistics are refreshed
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_status_interval() -> u64 {
    5000
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            status_interval_ms: default_status_interval(),
        }
    }
}

impl MonitorSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(100..=60_000).contains(&self.poll_interval_ms) {
            return Err(format!(
                "monitor.poll_interval_ms must be between 100 and 60000, got: {}",
                self.poll_interval_ms
            ));
        }
        if !(500..=300_000).contains(&self.status_interval_ms) {
            return Err(format!(
                "monitor.status_interval_ms must be between 500 and 300000, got: {}",
                self.status_interval_ms
            ));
        }
        Ok(())
    }
}
