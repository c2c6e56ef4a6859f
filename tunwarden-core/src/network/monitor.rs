//! Debounced network change detection
//!
//! Connectivity providers report every capability update, most of which
//! are noise on an unchanged network. [`NetworkTracker`] reduces that stream
//! to the transitions that matter; [`NetworkMonitor`] owns the provider
//! registration and delivers the resulting [`NetworkChange`] events in
//! order from a single task.

use super::{ConnectivityCallback, ConnectivityProvider, NetworkCapabilities, NetworkChange, NetworkRequest};
use crate::types::{NetworkHandle, NetworkObservation, TransportType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Debouncing state machine over connectivity callbacks
#[derive(Debug, Default)]
pub struct NetworkTracker {
    network: Option<NetworkHandle>,
    transport: TransportType,
    validated: bool,
    /// Set once the first network since the last reset was adopted
    baselined: bool,
}

impl NetworkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wifi wins over cellular, anything else is `Other`
    pub fn classify(caps: &NetworkCapabilities) -> TransportType {
        if caps.has_transport(TransportType::Wifi) {
            TransportType::Wifi
        } else if caps.has_transport(TransportType::Cellular) {
            TransportType::Cellular
        } else {
            TransportType::Other
        }
    }

    pub fn on_capabilities_changed(
        &mut self,
        network: &NetworkHandle,
        caps: &NetworkCapabilities,
    ) -> Option<NetworkChange> {
        let transport = Self::classify(caps);

        if !self.baselined {
            self.network = Some(network.clone());
            self.transport = transport;
            self.validated = caps.validated;
            self.baselined = true;
            debug!(%network, %transport, validated = caps.validated, "Initial network");
            return None;
        }

        if self.network.as_ref() != Some(network) || self.transport != transport {
            let old = self.transport;
            self.network = Some(network.clone());
            self.transport = transport;
            self.validated = false;
            debug!("Network changed: {} -> {}", old, transport);

            if caps.validated {
                self.validated = true;
                return Some(NetworkChange { old, new: transport });
            }
            return None;
        }

        if !self.validated && caps.validated {
            self.validated = true;
            debug!("Network validated: {}", transport);
            return Some(NetworkChange {
                old: self.transport,
                new: transport,
            });
        }

        None
    }

    pub fn on_lost(&mut self, network: &NetworkHandle) -> Option<NetworkChange> {
        if self.network.as_ref() != Some(network) {
            debug!(%network, "Ignoring loss of untracked network");
            return None;
        }
        let old = self.transport;
        self.network = None;
        self.transport = TransportType::None;
        self.validated = false;
        debug!("Network lost: {} -> none", old);
        Some(NetworkChange {
            old,
            new: TransportType::None,
        })
    }

    /// Forget everything, including the baseline
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn observation(&self) -> NetworkObservation {
        NetworkObservation {
            transport: self.transport,
            validated: self.validated,
            network: self.network.clone(),
        }
    }

    /// Feed one provider callback
    pub fn apply(&mut self, callback: &ConnectivityCallback) -> Option<NetworkChange> {
        match callback {
            ConnectivityCallback::Available(network) => {
                debug!(%network, "Network available");
                None
            }
            ConnectivityCallback::CapabilitiesChanged(network, caps) => {
                debug!(
                    %network,
                    transport = %Self::classify(caps),
                    validated = caps.validated,
                    "Capabilities changed"
                );
                self.on_capabilities_changed(network, caps)
            }
            ConnectivityCallback::Lost(network) => self.on_lost(network),
        }
    }
}

/// Watches connectivity and emits debounced [`NetworkChange`] events
pub struct NetworkMonitor {
    provider: Arc<dyn ConnectivityProvider>,
    tracker: Arc<Mutex<NetworkTracker>>,
    events: mpsc::UnboundedSender<NetworkChange>,
    bound: AtomicBool,
    delivery: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    /// Create an unbound monitor and the receiving end of its event channel
    pub fn new(provider: Arc<dyn ConnectivityProvider>) -> (Self, mpsc::UnboundedReceiver<NetworkChange>) {
        let (events, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            provider,
            tracker: Arc::new(Mutex::new(NetworkTracker::new())),
            events,
            bound: AtomicBool::new(false),
            delivery: tokio::sync::Mutex::new(None),
        };
        (monitor, rx)
    }

    /// Register with the provider and start delivering events
    ///
    /// Missing permission or a failed registration is logged and leaves the
    /// monitor unbound. Binding twice is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn bind(&self) {
        let mut delivery = self.delivery.lock().await;
        if delivery.is_some() {
            debug!("Network listener already bound");
            return;
        }

        if !self.provider.has_network_state_permission() {
            error!("Permission to observe network state not granted, cannot bind network listener");
            return;
        }

        let (sink, mut callbacks) = mpsc::unbounded_channel();
        if let Err(e) = self
            .provider
            .register(NetworkRequest::internet_over_wifi_or_cellular(), sink)
            .await
        {
            error!("Failed to bind network listener: {}", e);
            return;
        }

        let tracker = Arc::clone(&self.tracker);
        let events = self.events.clone();
        *delivery = Some(tokio::spawn(async move {
            while let Some(callback) = callbacks.recv().await {
                let change = lock_tracker(&tracker).apply(&callback);
                if let Some(change) = change {
                    info!(old = %change.old, new = %change.new, "Network changed");
                    if events.send(change).is_err() {
                        debug!("No receiver for network changes");
                    }
                }
            }
        }));
        self.bound.store(true, Ordering::SeqCst);
        info!("Network listener bound");
    }

    /// Deregister and reset the observation; a no-op when not bound
    #[tracing::instrument(skip(self))]
    pub async fn unbind(&self) {
        let mut delivery = self.delivery.lock().await;
        let Some(task) = delivery.take() else {
            debug!("Network listener not bound, nothing to unbind");
            return;
        };

        if let Err(e) = self.provider.unregister().await {
            warn!("Failed to unregister network listener: {}", e);
        }
        task.abort();
        self.bound.store(false, Ordering::SeqCst);
        lock_tracker(&self.tracker).reset();
        debug!("Network listener unbound");
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    /// Validated network with a known transport
    pub fn is_connected(&self) -> bool {
        self.observation().is_connected()
    }

    pub fn observation(&self) -> NetworkObservation {
        lock_tracker(&self.tracker).observation()
    }

    pub fn current_transport(&self) -> TransportType {
        self.observation().transport
    }
}

fn lock_tracker(tracker: &Mutex<NetworkTracker>) -> std::sync::MutexGuard<'_, NetworkTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
