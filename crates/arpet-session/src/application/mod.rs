//! Application layer: the sharing session and the ports it depends on.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure value types in `arpet-core`) and the infrastructure (sockets, cloud
//! backends, config files).
//!
//! Code in this layer:
//!
//! - **Orchestrates** domain objects to fulfil a user goal (e.g., "pair this
//!   phone with the host and show the same pet in the same place").
//! - **Depends on abstractions** ([`transport::Transport`],
//!   [`cloud_anchor::CloudAnchorService`]) rather than concrete
//!   implementations, so links and backends can be swapped without changing
//!   this code.
//! - **Contains no OS calls, no socket I/O, no file system access**.
//!
//! # Sub-modules
//!
//! - **`transport`** – The link port and its events and errors.
//!
//! - **`message_service`** – Request/reply messaging over a transport:
//!   view commands and shared cloud anchors, each answered by every peer.
//!
//! - **`cloud_anchor`** – Hosts local anchors and resolves remote ones
//!   through a cloud anchor service.
//!
//! - **`view_dispatch`** – Maps view commands from the host onto screens.
//!
//! - **`session`** – The synchronous pairing state machine.
//!
//! - **`coordinator`** – Runs the state machine on a tokio task and carries
//!   out its effects.

pub mod cloud_anchor;
pub mod coordinator;
pub mod message_service;
pub mod session;
pub mod transport;
pub mod view_dispatch;
