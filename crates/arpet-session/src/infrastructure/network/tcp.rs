//! TCP socket transport.
//!
//! The host binds a TCP listener on the control port and a UDP discovery
//! responder on the discovery port.  Guests find hosts with a UDP probe
//! (see [`super::discovery`]) and open one TCP connection per host.
//!
//! # Framing
//!
//! TCP is a byte stream, so frames are delimited using the protocol header:
//! the reader first reads the 24-byte header, validates it, then reads
//! exactly `payload_length` more bytes.  A header that fails validation means
//! the stream is out of sync and the connection is dropped.
//!
//! # Handshake
//!
//! The first frame in each direction is a `Hello` carrying the sender's
//! device id and name.  The guest speaks first; the host answers.  Only after
//! both `Hello`s are exchanged is the peer registered and announced to the
//! session.
//!
//! # Tasks
//!
//! - One accept task while the host is listening.
//! - One reader task per connected peer, forwarding frames to the sink.
//! - Writers are shared behind an async mutex so replies and broadcasts
//!   never interleave inside a frame.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arpet_core::protocol::codec::{decode_header, encode_message_now};
use arpet_core::protocol::messages::HEADER_SIZE;
use arpet_core::protocol::SequenceCounter;
use arpet_core::{
    decode_message, ConnectionEventType, ConnectionMode, Device, DeviceId, PetConnectionEvent,
    PetMessage, ProtocolError,
};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::discovery::{probe_hosts, start_discovery_responder, Announcement, DiscoveryResponder};
use crate::application::transport::{ConnectionError, EventSink, Transport, TransportEvent};

/// Default TCP port hosts accept guests on.
pub const DEFAULT_CONTROL_PORT: u16 = 24900;
/// Default UDP port for host discovery.
pub const DEFAULT_DISCOVERY_PORT: u16 = 24902;
/// Default time a guest waits for discovery answers.
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`TcpTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct TcpTransportConfig {
    /// Name announced to peers.
    pub device_name: String,
    /// Address the listener and discovery responder bind to.
    pub bind_address: IpAddr,
    /// TCP port for the control connection; `0` picks a free port.
    pub control_port: u16,
    pub discovery_port: u16,
    /// Where guests send their discovery probe.
    pub broadcast_address: IpAddr,
    pub discovery_window: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            device_name: "arpet".to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: DEFAULT_CONTROL_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_window: DEFAULT_DISCOVERY_WINDOW,
        }
    }
}

/// Failure on a single connection.
#[derive(Debug, Error)]
enum LinkError {
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("peer did not start with Hello")]
    NoHello,
    #[error("peer closed the connection during the handshake")]
    Closed,
    #[error("handshake timed out")]
    Timeout,
}

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

struct Peer {
    device: Device,
    writer: SharedWriter,
    reader: JoinHandle<()>,
}

struct Listening {
    addr: SocketAddr,
    accept: JoinHandle<()>,
    responder: Option<DiscoveryResponder>,
}

struct Shared {
    me: Device,
    peers: Mutex<HashMap<DeviceId, Peer>>,
    mode: Mutex<ConnectionMode>,
    listening: Mutex<Option<Listening>>,
    sequence: SequenceCounter,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Transport over TCP with UDP broadcast discovery.
pub struct TcpTransport {
    config: TcpTransportConfig,
    shared: Arc<Shared>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        let me = Device::new(
            DeviceId::random(),
            config.device_name.clone(),
            SocketAddr::new(config.bind_address, config.control_port).to_string(),
        );
        Self {
            config,
            shared: Arc::new(Shared {
                me,
                peers: Mutex::new(HashMap::new()),
                mode: Mutex::new(ConnectionMode::None),
                listening: Mutex::new(None),
                sequence: SequenceCounter::new(),
            }),
        }
    }

    /// Address of the control listener while the host is inviting.
    pub fn listening_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.listening).as_ref().map(|l| l.addr)
    }

    async fn connect_one(&self, device: &Device, sink: &EventSink) -> Result<Device, LinkError> {
        let addr: SocketAddr = device.address.parse().map_err(|_| {
            LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bad address {}", device.address),
            ))
        })?;
        let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| LinkError::Timeout)??;
        let (mut reader, mut writer) = stream.into_split();

        let shared = &self.shared;
        timeout(HANDSHAKE_TIMEOUT, async {
            send_hello(&mut writer, shared).await?;
            read_hello(&mut reader, addr).await
        })
        .await
        .map_err(|_| LinkError::Timeout)?
        .map(|host| {
            register_peer(shared, host.clone(), reader, writer, sink.clone());
            host
        })
    }
}

impl Shared {
    fn set_mode(&self, mode: ConnectionMode) {
        *lock(&self.mode) = mode;
    }

    fn is_listening(&self) -> bool {
        lock(&self.listening).is_some()
    }

    /// Removes a peer whose connection ended and reports the loss.
    async fn peer_lost(&self, id: DeviceId, sink: &EventSink) {
        let (device, remaining) = {
            let mut peers = lock(&self.peers);
            match peers.remove(&id) {
                Some(peer) => (peer.device, peers.len()),
                // Removed by a voluntary disconnect; nothing to report.
                None => return,
            }
        };
        if remaining == 0 && !self.is_listening() {
            self.set_mode(ConnectionMode::None);
        }

        let kind = if remaining == 0 {
            ConnectionEventType::AllConnectionsLost
        } else {
            ConnectionEventType::OneConnectionLost
        };
        info!("lost connection to {device} ({remaining} remaining)");
        let event = TransportEvent::Connection(PetConnectionEvent::with_device(kind, device));
        let _ = sink.send(event).await;
    }
}

async fn send_hello<W: AsyncWrite + Unpin>(writer: &mut W, shared: &Shared) -> Result<(), LinkError> {
    let hello = PetMessage::Hello {
        device_id: shared.me.id,
        name: shared.me.name.clone(),
    };
    let bytes = encode_message_now(&hello, shared.sequence.next())?;
    writer.write_all(&bytes).await?;
    Ok(())
}

async fn read_hello<R: AsyncRead + Unpin>(reader: &mut R, addr: SocketAddr) -> Result<Device, LinkError> {
    let frame = read_frame(reader).await?.ok_or(LinkError::Closed)?;
    match decode_message(&frame)?.0.message {
        PetMessage::Hello { device_id, name } => Ok(Device::new(device_id, name, addr.to_string())),
        _ => Err(LinkError::NoHello),
    }
}

/// Reads one complete frame.  Returns `None` on a clean end of stream.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, LinkError> {
    let mut frame = vec![0u8; HEADER_SIZE];
    match reader.read_exact(&mut frame).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = decode_header(&frame)?;
    frame.resize(HEADER_SIZE + header.payload_length as usize, 0);
    reader.read_exact(&mut frame[HEADER_SIZE..]).await?;
    Ok(Some(frame))
}

/// Stores the peer and starts its reader task.
fn register_peer(
    shared: &Arc<Shared>,
    device: Device,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    sink: EventSink,
) {
    let mut peers = lock(&shared.peers);
    let task = tokio::spawn(read_loop(Arc::clone(shared), device.id, reader, sink));
    if let Some(stale) = peers.insert(
        device.id,
        Peer {
            device,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            reader: task,
        },
    ) {
        warn!("replacing existing connection to {}", stale.device);
        stale.reader.abort();
    }
}

/// Forwards frames from one peer until the connection ends.
async fn read_loop(shared: Arc<Shared>, from: DeviceId, mut reader: OwnedReadHalf, sink: EventSink) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(bytes)) => {
                if sink.send(TransportEvent::Received { from, bytes }).await.is_err() {
                    debug!("event sink closed; stopping reader for {from}");
                    break;
                }
            }
            Ok(None) => {
                debug!("{from} closed the connection");
                break;
            }
            Err(e) => {
                warn!("dropping connection to {from}: {e}");
                break;
            }
        }
    }
    shared.peer_lost(from, &sink).await;
}

/// Accepts guests until the listener task is aborted.
async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, sink: EventSink) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        debug!("incoming connection from {addr}");

        let shared = Arc::clone(&shared);
        let sink = sink.clone();
        tokio::spawn(async move {
            let (mut reader, mut writer) = stream.into_split();
            // A guest that says hello after listening stopped gets no answer,
            // so its own handshake fails instead of completing.
            let handshake = timeout(HANDSHAKE_TIMEOUT, async {
                let guest = read_hello(&mut reader, addr).await?;
                if !shared.is_listening() {
                    return Ok(Err(guest));
                }
                send_hello(&mut writer, &shared).await?;
                Ok::<_, LinkError>(Ok(guest))
            })
            .await
            .unwrap_or(Err(LinkError::Timeout));

            match handshake {
                Ok(Ok(guest)) => {
                    info!("guest {guest} joined");
                    register_peer(&shared, guest.clone(), reader, writer, sink.clone());
                    let event = PetConnectionEvent::with_device(
                        ConnectionEventType::GuestConnectionEstablished,
                        guest,
                    );
                    let _ = sink.send(TransportEvent::Connection(event)).await;
                }
                Ok(Err(guest)) => debug!("{guest} said hello after listening stopped; closing"),
                Err(e) => warn!("handshake with {addr} failed: {e}"),
            }
        });
    }
}

fn link_unavailable(e: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::LinkUnavailable(e.to_string())
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn local_device(&self) -> Device {
        let mut me = self.shared.me.clone();
        if let Some(addr) = self.listening_addr() {
            me.address = addr.to_string();
        }
        me
    }

    async fn discover_hosts(&self) -> Result<Vec<Device>, ConnectionError> {
        let target = SocketAddr::new(self.config.broadcast_address, self.config.discovery_port);
        let hosts = probe_hosts(target, &self.shared.me, self.config.discovery_window)
            .await
            .map_err(link_unavailable)?;
        if hosts.is_empty() {
            return Err(ConnectionError::NoDevicesFound);
        }
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
        self.shared.set_mode(ConnectionMode::Client);

        let mut first_host = None;
        for device in &devices {
            match self.connect_one(device, &sink).await {
                Ok(host) => {
                    info!("connected to host {host}");
                    first_host.get_or_insert(host);
                }
                Err(e) => warn!("could not connect to {device}: {e}"),
            }
        }

        let event = match first_host {
            Some(host) => {
                PetConnectionEvent::with_device(ConnectionEventType::ConnectionEstablished, host)
            }
            None => {
                self.shared.set_mode(ConnectionMode::None);
                PetConnectionEvent::new(ConnectionEventType::NoConnectionFound)
            }
        };
        let _ = sink.send(TransportEvent::Connection(event)).await;
        Ok(())
    }

    async fn start_listening(&self, sink: EventSink) -> Result<(), ConnectionError> {
        if self.shared.is_listening() {
            debug!("already listening");
        } else {
            let bind = SocketAddr::new(self.config.bind_address, self.config.control_port);
            let listener = TcpListener::bind(bind).await.map_err(link_unavailable)?;
            let addr = listener.local_addr().map_err(link_unavailable)?;

            let announcement = Announcement {
                device_id: self.shared.me.id,
                name: self.shared.me.name.clone(),
                control_port: addr.port(),
            };
            let responder = match start_discovery_responder(
                self.config.bind_address,
                self.config.discovery_port,
                announcement,
            ) {
                Ok(responder) => Some(responder),
                Err(e) => {
                    warn!("guests will not find this host by discovery: {e}");
                    None
                }
            };

            let accept = tokio::spawn(accept_loop(Arc::clone(&self.shared), listener, sink.clone()));
            *lock(&self.shared.listening) = Some(Listening {
                addr,
                accept,
                responder,
            });
            self.shared.set_mode(ConnectionMode::Server);
            info!("accepting guests on TCP {addr}");
        }

        let event = PetConnectionEvent::new(ConnectionEventType::OnListeningToGuests);
        let _ = sink.send(TransportEvent::Connection(event)).await;
        Ok(())
    }

    async fn stop_listening(&self) -> Result<(), ConnectionError> {
        let listening = lock(&self.shared.listening).take();
        let Some(listening) = listening else {
            return Ok(());
        };
        listening.accept.abort();
        if let Some(responder) = listening.responder {
            // Joining waits for the responder's read timeout.
            if tokio::task::spawn_blocking(move || responder.stop()).await.is_err() {
                error!("discovery responder did not stop cleanly");
            }
        }
        info!("stopped accepting guests on {}", listening.addr);
        Ok(())
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<Vec<DeviceId>, ConnectionError> {
        let writers: Vec<(DeviceId, SharedWriter)> = lock(&self.shared.peers)
            .iter()
            .map(|(id, peer)| (*id, Arc::clone(&peer.writer)))
            .collect();

        let mut delivered = Vec::with_capacity(writers.len());
        for (id, writer) in writers {
            match writer.lock().await.write_all(&bytes).await {
                Ok(()) => delivered.push(id),
                Err(e) => warn!("send to {id} failed: {e}"),
            }
        }
        Ok(delivered)
    }

    async fn send_to(&self, device: DeviceId, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        let writer = lock(&self.shared.peers)
            .get(&device)
            .map(|peer| Arc::clone(&peer.writer))
            .ok_or(ConnectionError::UnknownDevice(device))?;
        let result = writer.lock().await.write_all(&bytes).await;
        result.map_err(link_unavailable)
    }

    async fn disconnect(&self) {
        if let Err(e) = self.stop_listening().await {
            warn!("stop listening failed: {e}");
        }

        let peers: Vec<Peer> = lock(&self.shared.peers).drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.reader.abort();
            if let Err(e) = peer.writer.lock().await.shutdown().await {
                debug!("shutdown of {} failed: {e}", peer.device);
            }
            debug!("disconnected from {}", peer.device);
        }
        self.shared.set_mode(ConnectionMode::None);
    }

    fn total_connected(&self) -> usize {
        lock(&self.shared.peers).len()
    }

    fn connected_devices(&self) -> Vec<DeviceId> {
        lock(&self.shared.peers).keys().copied().collect()
    }

    fn mode(&self) -> ConnectionMode {
        *lock(&self.shared.mode)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use arpet_core::protocol::messages::MAX_PAYLOAD_SIZE;
    use arpet_core::{encode_message, ViewCommand};
    use tokio::sync::mpsc;

    fn loopback(name: &str) -> TcpTransport {
        TcpTransport::new(TcpTransportConfig {
            device_name: name.to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: 0,
            discovery_port: 0,
            broadcast_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_window: Duration::from_millis(200),
        })
    }

    async fn next_connection(rx: &mut mpsc::Receiver<TransportEvent>) -> PetConnectionEvent {
        loop {
            match rx.recv().await {
                Some(TransportEvent::Connection(event)) => return event,
                Some(other) => panic!("unexpected {other:?}"),
                None => panic!("sink closed"),
            }
        }
    }

    #[test]
    fn test_default_config_uses_expected_ports() {
        let cfg = TcpTransportConfig::default();
        assert_eq!(cfg.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(cfg.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(cfg.discovery_window, DEFAULT_DISCOVERY_WINDOW);
    }

    #[tokio::test]
    async fn test_read_frame_splits_back_to_back_messages() {
        // Arrange
        let a = encode_message(&PetMessage::ViewCommand(ViewCommand::SharedHost), 1, 0).unwrap();
        let b = encode_message(&PetMessage::ViewCommand(ViewCommand::LookingSideBySide), 2, 0)
            .unwrap();
        let stream = [a.clone(), b.clone()].concat();
        let mut reader = &stream[..];

        // Act
        let first = read_frame(&mut reader).await.unwrap();
        let second = read_frame(&mut reader).await.unwrap();
        let end = read_frame(&mut reader).await.unwrap();

        // Assert
        assert_eq!(first, Some(a));
        assert_eq!(second, Some(b));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_header() {
        // Arrange: a valid header claiming a payload above the limit
        let mut frame =
            encode_message(&PetMessage::ViewCommand(ViewCommand::SharedHost), 1, 0).unwrap();
        frame[4..8].copy_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_be_bytes());
        let mut reader = &frame[..];

        // Act
        let result = read_frame(&mut reader).await;

        // Assert
        assert!(matches!(
            result,
            Err(LinkError::Protocol(ProtocolError::PayloadTooLarge(_)))
        ));
    }

    #[tokio::test]
    async fn test_guest_connects_and_frames_flow_both_ways() {
        // Arrange
        let host = loopback("host");
        let guest = loopback("guest");
        let (host_tx, mut host_rx) = mpsc::channel(16);
        let (guest_tx, mut guest_rx) = mpsc::channel(16);
        host.start_listening(host_tx).await.unwrap();
        assert_eq!(
            next_connection(&mut host_rx).await.event_type,
            ConnectionEventType::OnListeningToGuests
        );

        // Act
        guest
            .connect_to_devices(vec![host.local_device()], guest_tx)
            .await
            .unwrap();
        let joined = next_connection(&mut host_rx).await;
        let established = next_connection(&mut guest_rx).await;

        let frame =
            encode_message(&PetMessage::ViewCommand(ViewCommand::SharedHost), 9, 0).unwrap();
        let sent_to = host.send(frame.clone()).await.unwrap();
        let received = guest_rx.recv().await;

        // Assert
        assert_eq!(joined.event_type, ConnectionEventType::GuestConnectionEstablished);
        assert_eq!(joined.device.map(|d| d.id), Some(guest.local_device().id));
        assert_eq!(established.event_type, ConnectionEventType::ConnectionEstablished);
        assert_eq!(established.device.map(|d| d.id), Some(host.local_device().id));
        assert_eq!(sent_to, vec![guest.local_device().id]);
        assert_eq!(
            received,
            Some(TransportEvent::Received {
                from: host.local_device().id,
                bytes: frame,
            })
        );
        assert_eq!(host.mode(), ConnectionMode::Server);
        assert_eq!(guest.mode(), ConnectionMode::Client);

        host.disconnect().await;
        guest.disconnect().await;
    }

    #[tokio::test]
    async fn test_guest_after_stop_listening_gets_no_connection_found() {
        // Arrange
        let host = loopback("host");
        let guest = loopback("guest");
        let (host_tx, _host_rx) = mpsc::channel(16);
        let (guest_tx, mut guest_rx) = mpsc::channel(16);
        host.start_listening(host_tx).await.unwrap();
        let target = host.local_device();
        host.stop_listening().await.unwrap();

        // Act
        guest.connect_to_devices(vec![target], guest_tx).await.unwrap();

        // Assert
        assert_eq!(
            next_connection(&mut guest_rx).await.event_type,
            ConnectionEventType::NoConnectionFound
        );
        assert_eq!(guest.mode(), ConnectionMode::None);
    }

    #[tokio::test]
    async fn test_hello_arriving_after_stop_listening_gets_no_answer() {
        // Arrange: the guest's socket is accepted while the host still listens
        let host = loopback("host");
        let (host_tx, mut host_rx) = mpsc::channel(16);
        host.start_listening(host_tx).await.unwrap();
        next_connection(&mut host_rx).await;
        let addr = host.listening_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        host.stop_listening().await.unwrap();

        // Act: only now does the guest say hello
        let (mut reader, mut writer) = stream.into_split();
        let late = loopback("late-guest");
        send_hello(&mut writer, &late.shared).await.unwrap();
        let answer = timeout(Duration::from_secs(2), read_hello(&mut reader, addr))
            .await
            .expect("host closes the socket instead of hanging");

        // Assert
        assert!(
            matches!(answer, Err(LinkError::Closed | LinkError::Io(_))),
            "got {answer:?}"
        );
        assert_eq!(host.total_connected(), 0);
        assert!(host_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_host_disconnect_is_seen_by_guest_as_all_connections_lost() {
        // Arrange
        let host = loopback("host");
        let guest = loopback("guest");
        let (host_tx, mut host_rx) = mpsc::channel(16);
        let (guest_tx, mut guest_rx) = mpsc::channel(16);
        host.start_listening(host_tx).await.unwrap();
        next_connection(&mut host_rx).await;
        guest
            .connect_to_devices(vec![host.local_device()], guest_tx)
            .await
            .unwrap();
        next_connection(&mut host_rx).await;
        next_connection(&mut guest_rx).await;

        // Act
        host.disconnect().await;
        let lost = next_connection(&mut guest_rx).await;

        // Assert
        assert_eq!(lost.event_type, ConnectionEventType::AllConnectionsLost);
        assert_eq!(guest.total_connected(), 0);
        assert_eq!(guest.mode(), ConnectionMode::None);
        assert_eq!(host.total_connected(), 0);
    }

    #[tokio::test]
    async fn test_send_to_unknown_device_is_rejected() {
        let host = loopback("host");
        let stranger = DeviceId::random();

        let result = host.send_to(stranger, vec![0]).await;

        assert_eq!(result, Err(ConnectionError::UnknownDevice(stranger)));
    }
}
