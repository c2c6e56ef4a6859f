//! NetworkManager connectivity provider
//!
//! Polls NetworkManager over the system D-Bus for the primary connection
//! and translates what it sees into [`ConnectivityCallback`]s, the way a
//! platform network callback would report them.

use super::{ConnectivityCallback, ConnectivityProvider, NetworkCapabilities, NetworkRequest};
use crate::error::MonitorError;
use crate::types::{NetworkHandle, TransportType};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

const NM_SERVICE: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";
const NM_INTERFACE: &str = "org.freedesktop.NetworkManager";
const NM_ACTIVE_INTERFACE: &str = "org.freedesktop.NetworkManager.Connection.Active";
const SYSTEM_BUS_SOCKET: &str = "/run/dbus/system_bus_socket";

/// NM_CONNECTIVITY_FULL
const CONNECTIVITY_FULL: u32 = 4;

/// Map an NM active connection type to a transport
pub fn transport_for_connection_type(connection_type: &str) -> TransportType {
    match connection_type {
        "802-11-wireless" | "wifi" => TransportType::Wifi,
        "gsm" | "cdma" => TransportType::Cellular,
        _ => TransportType::Other,
    }
}

pub struct NetworkManagerProvider {
    poll_interval: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkManagerProvider {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            poller: Mutex::new(None),
        }
    }

    fn replace_poller(&self, task: Option<JoinHandle<()>>) {
        let mut poller = self.poller.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = std::mem::replace(&mut *poller, task) {
            previous.abort();
        }
    }
}

#[async_trait]
impl ConnectivityProvider for NetworkManagerProvider {
    fn has_network_state_permission(&self) -> bool {
        std::env::var_os("DBUS_SYSTEM_BUS_ADDRESS").is_some() || Path::new(SYSTEM_BUS_SOCKET).exists()
    }

    #[tracing::instrument(skip(self, sink))]
    async fn register(
        &self,
        request: NetworkRequest,
        sink: mpsc::UnboundedSender<ConnectivityCallback>,
    ) -> Result<(), MonitorError> {
        let connection = Connection::system().await?;

        // Verify NetworkManager is available by checking if the service exists
        let proxy = zbus::fdo::DBusProxy::new(&connection).await?;
        let bus_name = zbus::names::BusName::try_from(NM_SERVICE)
            .map_err(|e| MonitorError::QueryFailed(e.to_string()))?;
        let name_has_owner = proxy
            .name_has_owner(bus_name)
            .await
            .map_err(|e| MonitorError::QueryFailed(e.to_string()))?;
        if !name_has_owner {
            return Err(MonitorError::NetworkManagerUnavailable);
        }

        let interval = self.poll_interval;
        self.replace_poller(Some(tokio::spawn(poll_primary_connection(
            connection, request, sink, interval,
        ))));
        info!("Watching NetworkManager every {:?}", interval);
        Ok(())
    }

    async fn unregister(&self) -> Result<(), MonitorError> {
        self.replace_poller(None);
        Ok(())
    }
}

impl Drop for NetworkManagerProvider {
    fn drop(&mut self) {
        self.replace_poller(None);
    }
}

async fn poll_primary_connection(
    connection: Connection,
    request: NetworkRequest,
    sink: mpsc::UnboundedSender<ConnectivityCallback>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut tracked: Option<(NetworkHandle, NetworkCapabilities)> = None;

    loop {
        ticker.tick().await;
        if sink.is_closed() {
            break;
        }

        let primary = match query_primary(&connection).await {
            Ok(primary) => primary.filter(|(_, caps)| request.matches(caps)),
            Err(e) => {
                debug!("NetworkManager query failed: {}", e);
                continue;
            }
        };

        let callbacks = diff(&tracked, &primary);
        tracked = primary;
        for callback in callbacks {
            if sink.send(callback).is_err() {
                return;
            }
        }
    }
}

/// Callbacks that move the tracked network from `before` to `after`
///
/// A new network is announced before the old one is reported lost.
fn diff(
    before: &Option<(NetworkHandle, NetworkCapabilities)>,
    after: &Option<(NetworkHandle, NetworkCapabilities)>,
) -> Vec<ConnectivityCallback> {
    let mut callbacks = Vec::new();
    match (before, after) {
        (None, None) => {}
        (Some((old, _)), None) => callbacks.push(ConnectivityCallback::Lost(old.clone())),
        (None, Some((new, caps))) => {
            callbacks.push(ConnectivityCallback::Available(new.clone()));
            callbacks.push(ConnectivityCallback::CapabilitiesChanged(new.clone(), caps.clone()));
        }
        (Some((old, old_caps)), Some((new, caps))) => {
            if old != new {
                callbacks.push(ConnectivityCallback::Available(new.clone()));
                callbacks.push(ConnectivityCallback::CapabilitiesChanged(new.clone(), caps.clone()));
                callbacks.push(ConnectivityCallback::Lost(old.clone()));
            } else if old_caps != caps {
                callbacks.push(ConnectivityCallback::CapabilitiesChanged(new.clone(), caps.clone()));
            }
        }
    }
    callbacks
}

async fn query_primary(
    connection: &Connection,
) -> Result<Option<(NetworkHandle, NetworkCapabilities)>, MonitorError> {
    let nm = zbus::Proxy::new(connection, NM_SERVICE, NM_PATH, NM_INTERFACE).await?;

    let primary: OwnedObjectPath = nm
        .get_property("PrimaryConnection")
        .await
        .map_err(|e| MonitorError::QueryFailed(e.to_string()))?;
    if primary.as_str() == "/" {
        return Ok(None);
    }

    let connectivity: u32 = nm
        .get_property("Connectivity")
        .await
        .map_err(|e| MonitorError::QueryFailed(e.to_string()))?;

    let active = zbus::Proxy::new(connection, NM_SERVICE, primary.as_str(), NM_ACTIVE_INTERFACE).await?;
    let connection_type: String = active
        .get_property("Type")
        .await
        .map_err(|e| MonitorError::QueryFailed(e.to_string()))?;

    let transport = transport_for_connection_type(&connection_type);
    let caps = NetworkCapabilities::new(
        vec![transport],
        true,
        connectivity == CONNECTIVITY_FULL,
    );
    Ok(Some((NetworkHandle::new(primary.as_str()), caps)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(id: &str, validated: bool) -> Option<(NetworkHandle, NetworkCapabilities)> {
        Some((
            NetworkHandle::new(id),
            NetworkCapabilities::new(vec![TransportType::Wifi], true, validated),
        ))
    }

    #[test]
    fn test_connection_type_mapping() {
        assert_eq!(transport_for_connection_type("802-11-wireless"), TransportType::Wifi);
        assert_eq!(transport_for_connection_type("gsm"), TransportType::Cellular);
        assert_eq!(transport_for_connection_type("802-3-ethernet"), TransportType::Other);
    }

    #[test]
    fn test_diff_unchanged_is_silent() {
        assert!(diff(&network("a", true), &network("a", true)).is_empty());
        assert!(diff(&None, &None).is_empty());
    }

    #[test]
    fn test_diff_validation_change() {
        let callbacks = diff(&network("a", false), &network("a", true));
        assert_eq!(callbacks.len(), 1);
        assert!(matches!(
            &callbacks[0],
            ConnectivityCallback::CapabilitiesChanged(_, caps) if caps.validated
        ));
    }

    #[test]
    fn test_diff_switch_announces_new_before_losing_old() {
        let callbacks = diff(&network("a", true), &network("b", true));
        assert_eq!(
            callbacks.first(),
            Some(&ConnectivityCallback::Available(NetworkHandle::new("b")))
        );
        assert_eq!(
            callbacks.last(),
            Some(&ConnectivityCallback::Lost(NetworkHandle::new("a")))
        );
    }

    #[test]
    fn test_diff_loss() {
        assert_eq!(
            diff(&network("a", true), &None),
            vec![ConnectivityCallback::Lost(NetworkHandle::new("a"))]
        );
    }
}
