//! Type definitions shared across the supervisor
//!
//! Tunnel state and connection status, network observations, traffic
//! statistics and secret key material wrappers.

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Stored state of a tunnel
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Tunnel is not running
    #[default]
    Down,
    /// Tunnel is running in the backend
    Up,
}

impl TunnelState {
    /// The opposite state
    pub fn toggled(self) -> Self {
        match self {
            TunnelState::Down => TunnelState::Up,
            TunnelState::Up => TunnelState::Down,
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Down => write!(f, "down"),
            TunnelState::Up => write!(f, "up"),
        }
    }
}

/// Requested state change
///
/// `Toggle` is resolved against the current state at request time and is
/// never stored on a tunnel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateRequest {
    Down,
    Up,
    Toggle,
}

impl StateRequest {
    /// Resolve this request to a concrete target given the current state
    pub fn resolve(self, current: TunnelState) -> TunnelState {
        match self {
            StateRequest::Down => TunnelState::Down,
            StateRequest::Up => TunnelState::Up,
            StateRequest::Toggle => current.toggled(),
        }
    }
}

impl From<TunnelState> for StateRequest {
    fn from(state: TunnelState) -> Self {
        match state {
            TunnelState::Down => StateRequest::Down,
            TunnelState::Up => StateRequest::Up,
        }
    }
}

/// Operational connection status derived from the tunnel state
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    /// Tunnel is up but no handshake has been confirmed yet
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}

/// Transport carrying the active network
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    None,
    Wifi,
    Cellular,
    Other,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::None => write!(f, "none"),
            TransportType::Wifi => write!(f, "wifi"),
            TransportType::Cellular => write!(f, "cellular"),
            TransportType::Other => write!(f, "other"),
        }
    }
}

/// Opaque identity of a network as reported by the connectivity provider
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkHandle(String);

impl NetworkHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NetworkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of what the network monitor currently tracks
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkObservation {
    pub transport: TransportType,
    pub validated: bool,
    pub network: Option<NetworkHandle>,
}

impl NetworkObservation {
    /// True when the tracked network is validated and has a transport
    pub fn is_connected(&self) -> bool {
        self.validated && self.transport != TransportType::None
    }
}

/// Traffic counters for a single peer
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Milliseconds since the UNIX epoch, 0 when no handshake happened
    pub latest_handshake_epoch_millis: u64,
}

/// Traffic statistics of a tunnel, keyed by peer public key
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    peers: BTreeMap<String, PeerStats>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, public_key: impl Into<String>, stats: PeerStats) {
        self.peers.insert(public_key.into(), stats);
    }

    pub fn peer(&self, public_key: &str) -> Option<&PeerStats> {
        self.peers.get(public_key)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&str, &PeerStats)> {
        self.peers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn total_rx(&self) -> u64 {
        self.peers.values().map(|p| p.rx_bytes).sum()
    }

    pub fn total_tx(&self) -> u64 {
        self.peers.values().map(|p| p.tx_bytes).sum()
    }

    /// Most recent handshake across all peers
    pub fn latest_handshake(&self) -> Option<SystemTime> {
        self.peers
            .values()
            .map(|p| p.latest_handshake_epoch_millis)
            .filter(|ms| *ms > 0)
            .max()
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms))
    }

    /// Whether any peer completed a handshake within `window` before `now`
    pub fn has_recent_handshake(&self, now: SystemTime, window: Duration) -> bool {
        match self.latest_handshake() {
            Some(at) => match now.duration_since(at) {
                Ok(age) => age <= window,
                // Handshake timestamp in the future: clock skew, treat as fresh
                Err(_) => true,
            },
            None => false,
        }
    }
}

/// Wrapper for private and preshared keys in tunnel configurations
///
/// Keeps key material out of logs and debug output.
#[derive(Clone, Debug)]
pub struct KeyMaterial(Secret<String>);

impl KeyMaterial {
    pub fn new(key: String) -> Self {
        Self(Secret::new(key))
    }

    /// Expose the key (use with caution!)
    ///
    /// Only called when rendering a configuration for the engine.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Base64 encoded 32-byte key
    pub fn is_well_formed(&self) -> bool {
        let key = self.expose();
        key.len() == 44
            && key.ends_with('=')
            && key[..43]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
    }
}

impl From<String> for KeyMaterial {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl Serialize for KeyMaterial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for KeyMaterial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(KeyMaterial::new)
    }
}
