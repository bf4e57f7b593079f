//! All anchor-sharing protocol message types.
//!
//! Every message travels with a 24-byte header (see [`crate::protocol::codec`])
//! and one of the payloads below.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::anchor::CloudAnchor;
use crate::domain::device::DeviceId;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Total size of the common message header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Upper bound on a single payload; larger declared lengths are rejected
/// before any allocation happens.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

// ── Message type codes ────────────────────────────────────────────────────────

/// All message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    ViewCommand = 0x01,
    SharedCloudAnchors = 0x02,
    Reply = 0x03,
    Hello = 0x04,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::ViewCommand),
            0x02 => Ok(MessageType::SharedCloudAnchors),
            0x03 => Ok(MessageType::Reply),
            0x04 => Ok(MessageType::Hello),
            _ => Err(()),
        }
    }
}

// ── View commands ─────────────────────────────────────────────────────────────

/// A request from one device asking its peers to switch their UI mode.
///
/// Codes this build does not know survive decoding as [`ViewCommand::Other`]
/// so that a newer peer cannot break an older one; dispatch logs and ignores
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewCommand {
    ShowModeShareAnchorView,
    LookingSideBySide,
    SharedHost,
    PairingErrorView,
    Other(u8),
}

impl ViewCommand {
    /// Every command with a defined meaning.
    pub const DEFINED: [ViewCommand; 4] = [
        ViewCommand::ShowModeShareAnchorView,
        ViewCommand::LookingSideBySide,
        ViewCommand::SharedHost,
        ViewCommand::PairingErrorView,
    ];

    /// Wire code of the command.
    pub fn code(self) -> u8 {
        match self {
            ViewCommand::ShowModeShareAnchorView => 0x01,
            ViewCommand::LookingSideBySide => 0x02,
            ViewCommand::SharedHost => 0x03,
            ViewCommand::PairingErrorView => 0x04,
            ViewCommand::Other(code) => code,
        }
    }

    /// Maps a wire code to a command; never fails.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => ViewCommand::ShowModeShareAnchorView,
            0x02 => ViewCommand::LookingSideBySide,
            0x03 => ViewCommand::SharedHost,
            0x04 => ViewCommand::PairingErrorView,
            other => ViewCommand::Other(other),
        }
    }
}

impl fmt::Display for ViewCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewCommand::ShowModeShareAnchorView => f.write_str("SHOW_MODE_SHARE_ANCHOR_VIEW"),
            ViewCommand::LookingSideBySide => f.write_str("LOOKING_SIDE_BY_SIDE"),
            ViewCommand::SharedHost => f.write_str("SHARED_HOST"),
            ViewCommand::PairingErrorView => f.write_str("PAIRING_ERROR_VIEW"),
            ViewCommand::Other(code) => write!(f, "UNKNOWN(0x{code:02X})"),
        }
    }
}

// ── Replies ───────────────────────────────────────────────────────────────────

/// Outcome reported by a peer after processing a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Ok,
    /// The peer failed to process the request; carries a human-readable reason.
    Failed(String),
}

impl ReplyStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ReplyStatus::Ok)
    }
}

// ── Common message header ─────────────────────────────────────────────────────

/// 24-byte header prepended to every message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Protocol version; always [`PROTOCOL_VERSION`].
    pub version: u8,
    /// Identifies the payload type.
    pub message_type: MessageType,
    /// Length of the payload in bytes (not including this header).
    pub payload_length: u32,
    /// Monotonically increasing per-sender counter; replies refer to it.
    pub sequence_number: u64,
    /// Microseconds since Unix epoch at time of generation.
    pub timestamp_us: u64,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// Any message exchanged between host and guests.
#[derive(Debug, Clone, PartialEq)]
pub enum PetMessage {
    /// Ask peers to switch UI mode.
    ViewCommand(ViewCommand),
    /// Host → guests: the anchors to resolve.
    SharedCloudAnchors(Vec<CloudAnchor>),
    /// Answer to a `ViewCommand` or `SharedCloudAnchors` request.
    Reply {
        request_seq: u64,
        status: ReplyStatus,
    },
    /// First message on a fresh link; introduces the sender.
    Hello { device_id: DeviceId, name: String },
}

impl PetMessage {
    /// Returns the [`MessageType`] code for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            PetMessage::ViewCommand(_) => MessageType::ViewCommand,
            PetMessage::SharedCloudAnchors(_) => MessageType::SharedCloudAnchors,
            PetMessage::Reply { .. } => MessageType::Reply,
            PetMessage::Hello { .. } => MessageType::Hello,
        }
    }

    /// Whether the receiver is expected to answer with a `Reply`.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            PetMessage::ViewCommand(_) | PetMessage::SharedCloudAnchors(_)
        )
    }
}

/// A decoded message together with the header fields callers need.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sequence_number: u64,
    pub timestamp_us: u64,
    pub message: PetMessage,
}
