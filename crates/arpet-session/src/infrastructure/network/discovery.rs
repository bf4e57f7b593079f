//! UDP broadcast host discovery for the TCP transport.
//!
//! While a host is inviting, it binds a UDP socket on the discovery port and
//! answers every `Hello` datagram with a `Hello` of its own.  A guest looking
//! for hosts broadcasts one `Hello` and collects the answers that arrive
//! within the discovery window.
//!
//! # How UDP discovery works (for beginners)
//!
//! UDP is connectionless: a datagram is simply sent to an address and may or
//! may not arrive.  That is fine for discovery, because the guest just asks
//! again (the user taps "try again") if nothing answers.
//!
//! 1. The guest sends a `Hello` to the LAN broadcast address
//!    (`255.255.255.255`) on the discovery port.  Every device on the LAN
//!    receives it.
//! 2. Each inviting host answers with a unicast `Hello` naming its device id
//!    and name.  The host's control port travels in the `Hello` name field as
//!    `name@port` so the guest knows where to open the TCP connection.
//! 3. The guest turns every answer into a [`Device`] whose address is
//!    `ip:control_port`.
//!
//! # Read timeout
//!
//! The responder socket uses a 500 ms read timeout.  On each timeout the
//! responder thread checks its `running` flag and exits when the host stops
//! inviting.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use arpet_core::protocol::codec::encode_message_now;
use arpet_core::protocol::SequenceCounter;
use arpet_core::{decode_message, Device, DeviceId, PetMessage};
use thiserror::Error;
use tokio::net::UdpSocket as AsyncUdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(500);
const DATAGRAM_SIZE: usize = 2048;

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// The responder thread could not be started.
    #[error("failed to start discovery thread: {0}")]
    Spawn(std::io::Error),
    /// The probe could not be sent.
    #[error("failed to send discovery probe: {0}")]
    Send(std::io::Error),
    #[error("failed to encode discovery message: {0}")]
    Encode(#[from] arpet_core::ProtocolError),
}

/// A host that answered a discovery probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub device_id: DeviceId,
    pub name: String,
    pub control_port: u16,
}

impl Announcement {
    /// Packs the name and control port into the `Hello` name field.
    fn to_message(&self) -> PetMessage {
        PetMessage::Hello {
            device_id: self.device_id,
            name: format!("{}@{}", self.name, self.control_port),
        }
    }

    /// Reads an announcement back out of a `Hello`.
    fn from_message(message: &PetMessage) -> Option<Self> {
        let PetMessage::Hello { device_id, name } = message else {
            return None;
        };
        let (name, port) = name.rsplit_once('@')?;
        Some(Self {
            device_id: *device_id,
            name: name.to_string(),
            control_port: port.parse().ok()?,
        })
    }

    fn into_device(self, ip: std::net::IpAddr) -> Device {
        Device::new(
            self.device_id,
            self.name,
            SocketAddr::new(ip, self.control_port).to_string(),
        )
    }
}

/// A running responder.  Dropping it does not stop the thread; call
/// [`DiscoveryResponder::stop`].
#[derive(Debug)]
pub struct DiscoveryResponder {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl DiscoveryResponder {
    /// Address the responder socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Asks the responder thread to exit and waits for it.
    ///
    /// Blocks for at most one read timeout.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("discovery responder thread panicked");
            }
        }
    }
}

/// Binds a UDP socket on `discovery_port` and answers probes on a
/// background thread until stopped.
///
/// # Errors
///
/// Returns [`DiscoveryError::BindFailed`] if the socket cannot be bound.
pub fn start_discovery_responder(
    bind_ip: std::net::IpAddr,
    discovery_port: u16,
    announcement: Announcement,
) -> Result<DiscoveryResponder, DiscoveryError> {
    let addr = SocketAddr::new(bind_ip, discovery_port);
    let socket =
        UdpSocket::bind(addr).map_err(|source| DiscoveryError::BindFailed { addr, source })?;
    socket.set_read_timeout(Some(READ_TIMEOUT)).ok();
    let local_addr = socket.local_addr().unwrap_or(addr);

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    let thread = std::thread::Builder::new()
        .name("arpet-discovery".to_string())
        .spawn(move || discovery_loop(socket, announcement, flag))
        .map_err(DiscoveryError::Spawn)?;

    info!("discovery responder listening on UDP {local_addr}");
    Ok(DiscoveryResponder {
        running,
        thread: Some(thread),
        local_addr,
    })
}

/// The receive loop executed on the responder thread.
fn discovery_loop(socket: UdpSocket, announcement: Announcement, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; DATAGRAM_SIZE];
    let sequence = SequenceCounter::new();

    while running.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                error!("discovery recv error: {e}");
                continue;
            }
        };

        match decode_message(&buf[..len]) {
            Ok((envelope, _)) => match envelope.message {
                PetMessage::Hello { device_id, .. } if device_id == announcement.device_id => {}
                PetMessage::Hello { device_id, name } => {
                    debug!("probe from {name} ({device_id}) at {src}");
                    send_announcement(&socket, src, &announcement, &sequence);
                }
                other => {
                    warn!("unexpected {:?} on discovery port from {src}", other.message_type());
                }
            },
            Err(e) => debug!("failed to decode discovery datagram from {src}: {e}"),
        }
    }

    info!("discovery responder stopped");
}

fn send_announcement(
    socket: &UdpSocket,
    dest: SocketAddr,
    announcement: &Announcement,
    sequence: &SequenceCounter,
) {
    match encode_message_now(&announcement.to_message(), sequence.next()) {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, dest) {
                warn!("failed to answer probe from {dest}: {e}");
            }
        }
        Err(e) => error!("failed to encode announcement: {e}"),
    }
}

/// Broadcasts one probe and collects the hosts that answer within `window`.
///
/// `target` is normally the LAN broadcast address on the discovery port;
/// tests pass a loopback address instead.
///
/// # Errors
///
/// Returns a [`DiscoveryError`] if the probe socket cannot be bound or the
/// probe cannot be sent.  An empty result is not an error here.
pub async fn probe_hosts(
    target: SocketAddr,
    me: &Device,
    window: Duration,
) -> Result<Vec<Device>, DiscoveryError> {
    let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
    let socket = AsyncUdpSocket::bind(bind)
        .await
        .map_err(|source| DiscoveryError::BindFailed { addr: bind, source })?;
    socket.set_broadcast(true).map_err(DiscoveryError::Send)?;

    let probe = encode_message_now(
        &PetMessage::Hello {
            device_id: me.id,
            name: me.name.clone(),
        },
        0,
    )?;
    socket
        .send_to(&probe, target)
        .await
        .map_err(DiscoveryError::Send)?;
    debug!("discovery probe sent to {target}");

    let deadline = Instant::now() + window;
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();
    let mut buf = vec![0u8; DATAGRAM_SIZE];

    loop {
        let (len, src) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => {
                warn!("discovery probe recv error: {e}");
                continue;
            }
            Ok(Ok(pair)) => pair,
        };
        let Ok((envelope, _)) = decode_message(&buf[..len]) else {
            debug!("ignoring undecodable answer from {src}");
            continue;
        };
        match Announcement::from_message(&envelope.message) {
            Some(answer) if answer.device_id != me.id && seen.insert(answer.device_id) => {
                info!("found host {} at {src}", answer.name);
                hosts.push(answer.into_device(src.ip()));
            }
            Some(_) => {}
            None => debug!("ignoring non-announcement from {src}"),
        }
    }

    Ok(hosts)
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
