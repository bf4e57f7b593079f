//! Transport port: the seam between the session and the wireless link.
//!
//! The session never talks to sockets, Bluetooth or Wi-Fi Direct directly.
//! It talks to a [`Transport`], and each link technology provides one
//! implementation of it under `infrastructure::network`.
//!
//! # Events vs. return values (for beginners)
//!
//! Operations such as [`Transport::start_listening`] return as soon as the
//! link has been *asked* to do something.  What happens afterwards (a guest
//! joins, a peer drops, a message arrives) is reported asynchronously as a
//! [`TransportEvent`] on the [`EventSink`] the caller handed in.  A returned
//! `Err` means the request itself could not be made; it is never used to
//! report something that happened later.
//!
//! # Framing
//!
//! Every `bytes` buffer passed to [`Transport::send`] and delivered in
//! [`TransportEvent::Received`] is exactly one encoded protocol frame.
//! Implementations that sit on a byte stream must do their own framing.

use arpet_core::{ConnectionMode, Device, DeviceId, PetConnectionEvent};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel on which a transport reports what happened on the link.
pub type EventSink = mpsc::Sender<TransportEvent>;

/// Something that happened on the link after an operation returned.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A connection lifecycle change.
    Connection(PetConnectionEvent),
    /// One frame arrived from a connected peer.
    Received { from: DeviceId, bytes: Vec<u8> },
}

/// Why a transport operation could not be started.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Discovery finished without finding an inviting host.
    #[error("no inviting device found")]
    NoDevicesFound,

    /// The radio or socket needed for the operation is unavailable.
    #[error("link unavailable: {0}")]
    LinkUnavailable(String),

    /// The user or the OS refused a permission the link needs.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// This link technology is not implemented on the current platform.
    #[error("{transport} transport is not supported on this platform")]
    Unsupported { transport: &'static str },

    /// `send_to` named a device that is not connected.
    #[error("device {0} is not connected")]
    UnknownDevice(DeviceId),
}

/// A link that can invite, find and connect AR-pet devices.
///
/// A transport is in exactly one [`ConnectionMode`] at a time: `Server`
/// after `start_listening`, `Client` after `connect_to_devices`, and back to
/// `None` after `disconnect`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs and in [`ConnectionError::Unsupported`].
    fn name(&self) -> &'static str;

    /// This device as peers will see it.
    fn local_device(&self) -> Device;

    /// Looks for hosts that are currently inviting.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::NoDevicesFound`] when the search finds nobody.
    async fn discover_hosts(&self) -> Result<Vec<Device>, ConnectionError>;

    /// Connects to one or more discovered devices as a client.
    ///
    /// Reports `ConnectionEstablished` (or `NoConnectionFound` when none of
    /// the devices accepted) on `sink`.
    async fn connect_to_devices(
        &self,
        devices: Vec<Device>,
        sink: EventSink,
    ) -> Result<(), ConnectionError>;

    /// Makes this device visible and starts accepting guests.
    ///
    /// Reports `OnListeningToGuests` once visible and one
    /// `GuestConnectionEstablished` per accepted guest on `sink`.
    async fn start_listening(&self, sink: EventSink) -> Result<(), ConnectionError>;

    /// Stops accepting new guests.  Guests already connected stay connected.
    async fn stop_listening(&self) -> Result<(), ConnectionError>;

    /// Sends one frame to every connected peer.
    ///
    /// Returns the devices the frame was handed to.
    async fn send(&self, bytes: Vec<u8>) -> Result<Vec<DeviceId>, ConnectionError>;

    /// Sends one frame to a single connected peer.
    async fn send_to(&self, device: DeviceId, bytes: Vec<u8>) -> Result<(), ConnectionError>;

    /// Stops listening or searching and drops every peer.
    ///
    /// A voluntary disconnect does not report `AllConnectionsLost` to the
    /// local sink; only the remote side sees the connection drop.
    async fn disconnect(&self);

    /// Number of peers currently connected.
    fn total_connected(&self) -> usize;

    /// Peers currently connected.
    fn connected_devices(&self) -> Vec<DeviceId>;

    fn mode(&self) -> ConnectionMode;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_error_names_the_transport() {
        let err = ConnectionError::Unsupported {
            transport: "wifi-direct",
        };
        assert_eq!(
            err.to_string(),
            "wifi-direct transport is not supported on this platform"
        );
    }

    #[tokio::test]
    async fn test_mock_transport_reports_configured_peers() {
        // Arrange
        let peer = DeviceId::random();
        let mut mock = MockTransport::new();
        mock.expect_connected_devices().return_const(vec![peer]);
        mock.expect_send().returning(move |_| Ok(vec![peer]));

        // Act
        let reached = mock.send(vec![1, 2, 3]).await;

        // Assert
        assert_eq!(mock.connected_devices(), vec![peer]);
        assert_eq!(reached, Ok(vec![peer]));
    }
}
