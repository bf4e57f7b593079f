//! Transport implementations.
//!
//! # Sub-modules
//!
//! - **`tcp`** – Real sockets.  Hosts accept guests on a TCP control port;
//!   every frame is one encoded protocol message.
//!
//! - **`discovery`** – UDP broadcast probe and responder used by `tcp` so
//!   guests can find an inviting host without typing an IP address.
//!
//! - **`memory`** – Several devices in one process sharing a simulated link.
//!   Used by the integration tests and by embedders without a radio.
//!
//! - **`wifi_direct`** – Reports Wi-Fi Direct as unsupported from every
//!   operation.

pub mod discovery;
pub mod memory;
pub mod tcp;
pub mod wifi_direct;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use wifi_direct::WifiDirectTransport;
