//! # arpet-core
//!
//! Shared library for AR pet anchor sharing containing the domain entities
//! and the binary wire protocol used between a host device and its guests.
//!
//! This crate is used by the session coordinator and by every transport.
//! It has zero dependencies on OS APIs, async runtimes, or network sockets.
//!
//! # Architecture overview (for beginners)
//!
//! Anchor sharing lets several phones look at the *same* virtual pet in the
//! *same* physical spot.  One device (the "host") uploads the pose of its
//! anchors to a cloud anchor service and receives an opaque cloud id for
//! each one.  It then sends the list of ids to every connected device (the
//! "guests"), which ask the cloud service to resolve the ids back into poses
//! expressed in their own coordinate frame.
//!
//! This crate (`arpet-core`) is the shared foundation.  It defines:
//!
//! - **`domain`** – Plain value types with no I/O: anchors and their object
//!   types, devices, connection lifecycle events, the session role/state
//!   enums and the screens the UI is asked to show.
//!
//! - **`protocol`** – How bytes travel between devices.  Messages are encoded
//!   into a compact binary format (24-byte header + payload) and decoded back
//!   into typed Rust values on the other end.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `arpet_core::CloudAnchor` instead of `arpet_core::domain::anchor::CloudAnchor`.
pub use domain::anchor::{AnchorHandle, CloudAnchor, LocalAnchor, ObjectType, Pose, ResolvedCloudAnchor};
pub use domain::connection::{ConnectionEventType, ConnectionMode, PetConnectionEvent};
pub use domain::device::{Device, DeviceId};
pub use domain::session::{NotFoundTarget, Role, Screen, SessionState};
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::{PetMessage, ReplyStatus, ViewCommand};
