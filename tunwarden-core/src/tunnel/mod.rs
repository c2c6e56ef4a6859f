//! Tunnel model and state machine
//!
//! A [`Tunnel`] holds the observable state of one configured tunnel. Every
//! field is published through a `watch` channel so any number of observers
//! can follow state, connection status, statistics and name changes.
//! Mutations go through the [`registry::TunnelRegistry`], which owns the
//! backend and serializes changes per tunnel.

use crate::config::TunnelConfig;
use crate::types::{ConnectionStatus, Statistics, TunnelState};
use regex::Regex;
use tokio::sync::{watch, Mutex};
use tracing::debug;

pub mod registry;

lazy_static::lazy_static! {
    /// Interface names are limited to 15 characters by the kernel
    static ref NAME_PATTERN: Regex = Regex::new(r"^[a-zA-Z0-9_=+.-]{1,15}$")
        .expect("Failed to compile tunnel name pattern");
}

/// Whether `name` can be used as a tunnel (and interface) name
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// Observable state of a configured tunnel
#[derive(Debug)]
pub struct Tunnel {
    name: watch::Sender<String>,
    state: watch::Sender<TunnelState>,
    connection_status: watch::Sender<ConnectionStatus>,
    statistics: watch::Sender<Option<Statistics>>,
    config: watch::Sender<Option<TunnelConfig>>,

    /// Held for the whole duration of a state, name or config change
    pub(crate) op_lock: Mutex<()>,
}

impl Tunnel {
    pub(crate) fn new(name: String, config: Option<TunnelConfig>, state: TunnelState) -> Self {
        let tunnel = Self {
            name: watch::channel(name).0,
            state: watch::channel(TunnelState::Down).0,
            connection_status: watch::channel(ConnectionStatus::Disconnected).0,
            statistics: watch::channel(None).0,
            config: watch::channel(config).0,
            op_lock: Mutex::new(()),
        };
        tunnel.on_state_changed(state);
        tunnel
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.connection_status.borrow()
    }

    /// Last fetched statistics, `None` while down or before the first fetch
    pub fn statistics(&self) -> Option<Statistics> {
        self.statistics.borrow().clone()
    }

    /// Cached configuration, possibly stale
    pub fn cached_config(&self) -> Option<TunnelConfig> {
        self.config.borrow().clone()
    }

    pub fn subscribe_name(&self) -> watch::Receiver<String> {
        self.name.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub fn subscribe_connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection_status.subscribe()
    }

    pub fn subscribe_statistics(&self) -> watch::Receiver<Option<Statistics>> {
        self.statistics.subscribe()
    }

    /// Apply a state reported by the backend
    ///
    /// Leaving UP drops statistics and forces `Disconnected`. Entering UP
    /// moves a disconnected tunnel to `Connecting`; a tunnel already
    /// `Connecting` or `Connected` keeps its status.
    pub(crate) fn on_state_changed(&self, state: TunnelState) -> TunnelState {
        if state != TunnelState::Up {
            self.on_statistics_changed(None);
            self.publish_status(ConnectionStatus::Disconnected);
        } else if self.connection_status() == ConnectionStatus::Disconnected {
            self.publish_status(ConnectionStatus::Connecting);
        }
        self.state.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
        state
    }

    /// Accept connection status feedback, e.g. a confirmed handshake
    ///
    /// `Connected` is ignored while the tunnel is down.
    pub fn on_connection_status_changed(&self, status: ConnectionStatus) -> ConnectionStatus {
        if status == ConnectionStatus::Connected && self.state() != TunnelState::Up {
            debug!(
                tunnel = %self.name(),
                "Ignoring connected status for a tunnel that is down"
            );
            return self.connection_status();
        }
        self.publish_status(status);
        status
    }

    pub(crate) fn on_statistics_changed(&self, statistics: Option<Statistics>) {
        self.statistics.send_replace(statistics);
    }

    pub(crate) fn on_config_changed(&self, config: Option<TunnelConfig>) {
        self.config.send_replace(config);
    }

    pub(crate) fn on_name_changed(&self, name: String) {
        self.name.send_replace(name);
    }

    fn publish_status(&self, status: ConnectionStatus) {
        let changed = self.connection_status.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(tunnel = %self.name(), status = %status, "Connection status changed");
        }
    }
}
