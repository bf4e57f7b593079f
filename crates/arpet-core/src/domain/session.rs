//! Session role, state and screen enums.
//!
//! # Session lifecycle (for beginners)
//!
//! ```text
//!                 ┌──► WaitingForGuests (host) ──┐
//! Init ──choose───┤                              ├──► Connected ──► Pairing ──► Shared
//!                 └──► FindingHost      (guest) ──┘                                 │
//!                                                                                    ▼
//!                                                                             Disconnected
//! ```
//!
//! - `Init`: nothing started, no role chosen.
//! - `WaitingForGuests` / `FindingHost`: the invitation phase.  Exactly one
//!   of them is reachable for a given role.
//! - `Connected`: at least one link is up.
//! - `Pairing`: anchors are being hosted, shared or resolved.
//! - `Shared`: both sides agree on the world center; the live session runs.
//! - `Disconnected`: terminal; control returns to the caller.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of this device in the sharing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Role {
    #[default]
    None,
    Host,
    Guest,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::None => "none",
            Role::Host => "host",
            Role::Guest => "guest",
        };
        f.write_str(s)
    }
}

/// State of the sharing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Init,
    WaitingForGuests,
    FindingHost,
    Connected,
    Pairing,
    Shared,
    Disconnected,
}

impl SessionState {
    /// States in which at least one link is expected to be up.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Pairing | SessionState::Shared
        )
    }

    /// Whether the state is the terminal one.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Disconnected
    }
}

/// Who could not be found when a `NotFound` screen is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotFoundTarget {
    /// Shown to a host whose invitation expired without guests.
    Guest,
    /// Shown to a guest that found no inviting host.
    Host,
}

/// Screen the UI layer is asked to show.
///
/// The session never draws anything itself; it emits one of these and the
/// embedding application maps it onto its own widgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Screen {
    /// Host/guest choice.
    Main,
    /// Host waiting for guests to accept the invitation.
    WaitingForGuests { guests: usize },
    /// Guest looking for an inviting host.
    FindingHost,
    /// Host: the invitation closed with guests on board.
    InviteAcceptedHost { guests: usize },
    /// Guest: the host accepted us.
    InviteAcceptedGuest,
    /// Host: keep the pet centered in view.
    CenterPet,
    /// Host: move around so the anchor gets good coverage.
    MoveAround,
    /// Guest: waiting for the host to finish hosting.
    Waiting,
    /// Host: stay in position while guests pair.
    StayInPosition,
    /// Guest: look at the pet from the host's side.
    LookingSideBySide,
    /// Guest: the host finished hosting.
    SharedHost,
    /// Paired; the shared mode view.
    ModeView,
    PairingError,
    NotFound(NotFoundTarget),
    NoInternet,
    BluetoothDisabled,
    DeviceNotVisible,
    /// The selected transport cannot be used on this device.
    ConnectionUnavailable,
    DisconnectHost,
    DisconnectGuest,
}
