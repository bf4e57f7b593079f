//! Connection lifecycle events.
//!
//! Every transport (socket, in-memory, ...) reports what happens to its links
//! through [`PetConnectionEvent`]s.  The session state machine is the only
//! consumer; it never looks at sockets directly.

use serde::{Deserialize, Serialize};

use crate::domain::device::Device;

/// Which side of a link this device is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionMode {
    /// No link and not listening.
    #[default]
    None,
    /// Accepting guests (host side).
    Server,
    /// Connected to a host (guest side).
    Client,
}

/// Kind of connection lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionEventType {
    /// Guest side: the link to the host is up.
    ConnectionEstablished,
    /// Guest side: no host accepted the connection.
    NoConnectionFound,
    /// Every link of this device is gone.
    AllConnectionsLost,
    /// One peer dropped while others remain.
    OneConnectionLost,
    /// Host side: the listener is up and visible to guests.
    OnListeningToGuests,
    /// Host side: a guest joined.
    GuestConnectionEstablished,
    /// Host side: the listener stopped accepting guests.
    ListenerStopped,
    /// The user refused to enable the radio the link needs.
    EnableBluetoothDenied,
    /// The user refused to make this device discoverable.
    HostVisibilityDenied,
}

impl ConnectionEventType {
    /// Whether the event reports a refused permission.
    pub fn is_permission_error(self) -> bool {
        matches!(
            self,
            ConnectionEventType::EnableBluetoothDenied | ConnectionEventType::HostVisibilityDenied
        )
    }
}

/// A connection lifecycle event, optionally naming the peer involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PetConnectionEvent {
    pub event_type: ConnectionEventType,
    pub device: Option<Device>,
}

impl PetConnectionEvent {
    pub fn new(event_type: ConnectionEventType) -> Self {
        Self {
            event_type,
            device: None,
        }
    }

    pub fn with_device(event_type: ConnectionEventType, device: Device) -> Self {
        Self {
            event_type,
            device: Some(device),
        }
    }
}
