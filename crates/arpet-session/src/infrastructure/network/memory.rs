//! In-process transport: several devices sharing one simulated link.
//!
//! A [`MemoryNetwork`] is the "air" between devices.  Each call to
//! [`MemoryNetwork::endpoint`] creates a [`MemoryTransport`] for one device.
//! Hosts listen, guests discover and connect, and frames are delivered
//! straight onto the receiving device's event sink.
//!
//! The network is used by the integration tests and by anyone embedding the
//! session without radio hardware.  It follows the same event contract as
//! the socket transport, including the loss events peers see when a device
//! disconnects.
//!
//! # Locking
//!
//! All endpoint state sits behind one `std::sync::Mutex`.  Events are
//! collected while the lock is held and sent after it is released, so no
//! lock is ever held across an `.await`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use arpet_core::{ConnectionEventType, ConnectionMode, Device, DeviceId, PetConnectionEvent};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::application::transport::{ConnectionError, EventSink, Transport, TransportEvent};

/// Events waiting to be delivered once the network lock is released.
type Outbox = Vec<(EventSink, TransportEvent)>;

#[derive(Debug)]
struct Endpoint {
    device: Device,
    sink: Option<EventSink>,
    listening: bool,
    deny_visibility: bool,
    peers: BTreeSet<DeviceId>,
    mode: ConnectionMode,
}

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: HashMap<DeviceId, Endpoint>,
}

impl NetworkState {
    fn endpoint(&self, id: DeviceId) -> Option<&Endpoint> {
        self.endpoints.get(&id)
    }

    fn endpoint_mut(&mut self, id: DeviceId) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(&id)
    }

    /// Queues an event for `target` if it has a sink.
    fn notify(&self, outbox: &mut Outbox, target: DeviceId, event: TransportEvent) {
        if let Some(sink) = self.endpoint(target).and_then(|e| e.sink.clone()) {
            outbox.push((sink, event));
        }
    }
}

/// A simulated link shared by every endpoint created from it.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device to the network and returns its transport.
    pub fn endpoint(&self, name: &str) -> MemoryTransport {
        let device = Device::new(DeviceId::random(), name, format!("mem://{name}"));
        self.lock().endpoints.insert(
            device.id,
            Endpoint {
                device: device.clone(),
                sink: None,
                listening: false,
                deny_visibility: false,
                peers: BTreeSet::new(),
                mode: ConnectionMode::None,
            },
        );
        debug!("memory endpoint {device} added");
        MemoryTransport {
            network: self.clone(),
            device,
        }
    }

    /// Devices currently accepting guests.
    pub fn listening_devices(&self) -> Vec<Device> {
        let state = self.lock();
        let mut hosts: Vec<Device> = state
            .endpoints
            .values()
            .filter(|e| e.listening)
            .map(|e| e.device.clone())
            .collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn deliver(outbox: Outbox) {
    for (sink, event) in outbox {
        if sink.send(event).await.is_err() {
            debug!("memory endpoint sink closed; event dropped");
        }
    }
}

/// One device's view of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    device: Device,
}

impl MemoryTransport {
    /// Makes the next `start_listening` report `HostVisibilityDenied`
    /// instead of becoming visible, as if the user refused the prompt.
    pub fn deny_visibility(&self, deny: bool) {
        if let Some(endpoint) = self.network.lock().endpoint_mut(self.device.id) {
            endpoint.deny_visibility = deny;
        }
    }

    /// Whether this device is currently accepting guests.
    pub fn is_listening(&self) -> bool {
        self.network
            .lock()
            .endpoint(self.device.id)
            .map(|e| e.listening)
            .unwrap_or(false)
    }

    fn event(event_type: ConnectionEventType, device: Option<&Device>) -> TransportEvent {
        TransportEvent::Connection(match device {
            Some(device) => PetConnectionEvent::with_device(event_type, device.clone()),
            None => PetConnectionEvent::new(event_type),
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn local_device(&self) -> Device {
        self.device.clone()
    }

    async fn discover_hosts(&self) -> Result<Vec<Device>, ConnectionError> {
        let hosts: Vec<Device> = self
            .network
            .listening_devices()
            .into_iter()
            .filter(|d| d.id != self.device.id)
            .collect();
        if hosts.is_empty() {
            return Err(ConnectionError::NoDevicesFound);
        }
        debug!("{} found {} host(s)", self.device.name, hosts.len());
        Ok(hosts)
    }

    async fn connect_to_devices(
        &self,
        devices: Vec<Device>,
        sink: EventSink,
    ) -> Result<(), ConnectionError> {
        if devices.is_empty() {
            return Err(ConnectionError::NoDevicesFound);
        }

        let mut outbox = Outbox::new();
        {
            let mut state = self.network.lock();
            let me = self.device.id;
            if let Some(endpoint) = state.endpoint_mut(me) {
                endpoint.sink = Some(sink.clone());
                endpoint.mode = ConnectionMode::Client;
            }

            let mut first_host = None;
            for device in &devices {
                let accepting = state
                    .endpoint(device.id)
                    .map(|e| e.listening)
                    .unwrap_or(false);
                if !accepting || device.id == me {
                    debug!("{} is not accepting guests", device.name);
                    continue;
                }
                if let Some(host) = state.endpoint_mut(device.id) {
                    host.peers.insert(me);
                }
                if let Some(endpoint) = state.endpoint_mut(me) {
                    endpoint.peers.insert(device.id);
                }
                state.notify(
                    &mut outbox,
                    device.id,
                    Self::event(ConnectionEventType::GuestConnectionEstablished, Some(&self.device)),
                );
                first_host.get_or_insert_with(|| device.clone());
            }

            let event = match &first_host {
                Some(host) => {
                    info!("{} connected to {}", self.device.name, host.name);
                    Self::event(ConnectionEventType::ConnectionEstablished, Some(host))
                }
                None => {
                    if let Some(endpoint) = state.endpoint_mut(me) {
                        endpoint.mode = ConnectionMode::None;
                    }
                    Self::event(ConnectionEventType::NoConnectionFound, None)
                }
            };
            outbox.push((sink, event));
        }
        deliver(outbox).await;
        Ok(())
    }

    async fn start_listening(&self, sink: EventSink) -> Result<(), ConnectionError> {
        let event = {
            let mut state = self.network.lock();
            let endpoint = state
                .endpoint_mut(self.device.id)
                .ok_or_else(|| ConnectionError::LinkUnavailable("endpoint removed".into()))?;
            endpoint.sink = Some(sink.clone());
            if endpoint.deny_visibility {
                Self::event(ConnectionEventType::HostVisibilityDenied, None)
            } else {
                endpoint.listening = true;
                endpoint.mode = ConnectionMode::Server;
                info!("{} is visible to guests", self.device.name);
                Self::event(ConnectionEventType::OnListeningToGuests, None)
            }
        };
        deliver(vec![(sink, event)]).await;
        Ok(())
    }

    async fn stop_listening(&self) -> Result<(), ConnectionError> {
        if let Some(endpoint) = self.network.lock().endpoint_mut(self.device.id) {
            if endpoint.listening {
                debug!("{} stopped listening", self.device.name);
            }
            endpoint.listening = false;
        }
        Ok(())
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<Vec<DeviceId>, ConnectionError> {
        let mut outbox = Outbox::new();
        let peers: Vec<DeviceId> = {
            let state = self.network.lock();
            let peers: Vec<DeviceId> = state
                .endpoint(self.device.id)
                .map(|e| e.peers.iter().copied().collect())
                .unwrap_or_default();
            for peer in &peers {
                state.notify(
                    &mut outbox,
                    *peer,
                    TransportEvent::Received {
                        from: self.device.id,
                        bytes: bytes.clone(),
                    },
                );
            }
            peers
        };
        deliver(outbox).await;
        Ok(peers)
    }

    async fn send_to(&self, device: DeviceId, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        let mut outbox = Outbox::new();
        {
            let state = self.network.lock();
            let connected = state
                .endpoint(self.device.id)
                .map(|e| e.peers.contains(&device))
                .unwrap_or(false);
            if !connected {
                return Err(ConnectionError::UnknownDevice(device));
            }
            state.notify(
                &mut outbox,
                device,
                TransportEvent::Received {
                    from: self.device.id,
                    bytes,
                },
            );
        }
        deliver(outbox).await;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut outbox = Outbox::new();
        {
            let mut state = self.network.lock();
            let me = self.device.id;
            let peers = match state.endpoint_mut(me) {
                Some(endpoint) => {
                    endpoint.listening = false;
                    endpoint.mode = ConnectionMode::None;
                    endpoint.sink = None;
                    std::mem::take(&mut endpoint.peers)
                }
                None => return,
            };

            for peer in peers {
                let remaining = match state.endpoint_mut(peer) {
                    Some(endpoint) => {
                        endpoint.peers.remove(&me);
                        if endpoint.peers.is_empty() && !endpoint.listening {
                            endpoint.mode = ConnectionMode::None;
                        }
                        endpoint.peers.len()
                    }
                    None => continue,
                };
                let kind = if remaining == 0 {
                    ConnectionEventType::AllConnectionsLost
                } else {
                    ConnectionEventType::OneConnectionLost
                };
                state.notify(&mut outbox, peer, Self::event(kind, Some(&self.device)));
            }
        }
        if !outbox.is_empty() {
            info!("{} disconnected from {} peer(s)", self.device.name, outbox.len());
        }
        deliver(outbox).await;
    }

    fn total_connected(&self) -> usize {
        self.network
            .lock()
            .endpoint(self.device.id)
            .map(|e| e.peers.len())
            .unwrap_or(0)
    }

    fn connected_devices(&self) -> Vec<DeviceId> {
        self.network
            .lock()
            .endpoint(self.device.id)
            .map(|e| e.peers.iter().copied().collect())
            .unwrap_or_default()
    }

    fn mode(&self) -> ConnectionMode {
        self.network
            .lock()
            .endpoint(self.device.id)
            .map(|e| e.mode)
            .unwrap_or_default()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn connection(event: TransportEvent) -> ConnectionEventType {
        match event {
            TransportEvent::Connection(e) => e.event_type,
            other => panic!("expected a connection event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_host_reports_listening_and_guest_joins() {
        // Arrange
        let network = MemoryNetwork::new();
        let host = network.endpoint("host");
        let guest = network.endpoint("guest");
        let (host_tx, mut host_rx) = mpsc::channel(8);
        let (guest_tx, mut guest_rx) = mpsc::channel(8);

        // Act
        host.start_listening(host_tx).await.unwrap();
        let hosts = guest.discover_hosts().await.unwrap();
        guest.connect_to_devices(hosts, guest_tx).await.unwrap();

        // Assert
        assert_eq!(
            connection(host_rx.recv().await.unwrap()),
            ConnectionEventType::OnListeningToGuests
        );
        assert_eq!(
            connection(host_rx.recv().await.unwrap()),
            ConnectionEventType::GuestConnectionEstablished
        );
        assert_eq!(
            connection(guest_rx.recv().await.unwrap()),
            ConnectionEventType::ConnectionEstablished
        );
        assert_eq!(host.mode(), ConnectionMode::Server);
        assert_eq!(guest.mode(), ConnectionMode::Client);
        assert_eq!(host.total_connected(), 1);
    }

    #[tokio::test]
    async fn test_connect_with_no_devices_fails() {
        let network = MemoryNetwork::new();
        let guest = network.endpoint("guest");
        let (tx, _rx) = mpsc::channel(8);

        let result = guest.connect_to_devices(vec![], tx).await;

        assert_eq!(result, Err(ConnectionError::NoDevicesFound));
    }

    #[tokio::test]
    async fn test_discover_without_hosts_fails() {
        let network = MemoryNetwork::new();
        let guest = network.endpoint("guest");

        assert_eq!(
            guest.discover_hosts().await,
            Err(ConnectionError::NoDevicesFound)
        );
    }

    #[tokio::test]
    async fn test_send_to_unknown_device_is_rejected() {
        let network = MemoryNetwork::new();
        let host = network.endpoint("host");
        let stranger = DeviceId::random();

        let result = host.send_to(stranger, vec![1, 2, 3]).await;

        assert_eq!(result, Err(ConnectionError::UnknownDevice(stranger)));
    }

    #[tokio::test]
    async fn test_denied_visibility_is_reported_as_event() {
        // Arrange
        let network = MemoryNetwork::new();
        let host = network.endpoint("host");
        host.deny_visibility(true);
        let (tx, mut rx) = mpsc::channel(8);

        // Act
        host.start_listening(tx).await.unwrap();

        // Assert
        assert_eq!(
            connection(rx.recv().await.unwrap()),
            ConnectionEventType::HostVisibilityDenied
        );
        assert!(!host.is_listening());
    }

    #[tokio::test]
    async fn test_stop_listening_is_idempotent() {
        let network = MemoryNetwork::new();
        let host = network.endpoint("host");
        let (tx, _rx) = mpsc::channel(8);
        host.start_listening(tx).await.unwrap();

        host.stop_listening().await.unwrap();
        host.stop_listening().await.unwrap();

        assert!(!host.is_listening());
        assert!(network.listening_devices().is_empty());
    }
}
