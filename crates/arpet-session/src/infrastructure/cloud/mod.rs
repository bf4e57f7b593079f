//! Cloud anchor service backends.
//!
//! - **`offline`** – A self-contained backend for local runs and tests.  The
//!   cloud id it issues carries the pose itself, so two processes can swap
//!   anchors without any server.

pub mod offline;

pub use offline::OfflineCloudService;
