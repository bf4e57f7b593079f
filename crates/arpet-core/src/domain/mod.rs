//! Domain entities for AR pet anchor sharing.
//!
//! This module contains pure value types with no infrastructure dependencies.
//!
//! # What is "domain" here? (for beginners)
//!
//! The domain layer holds the vocabulary the rest of the system speaks:
//!
//! - It has **no** imports from OS APIs, network libraries, or async runtimes.
//! - It can be compiled and tested on any platform without external setup.
//! - Outer layers (transports, the session coordinator, the CLI) depend on
//!   it, but it never depends on them.
//!
//! An anchor is a plain value.  Whatever the renderer attaches to it lives
//! elsewhere and is referenced by an [`anchor::AnchorHandle`].

/// Anchors, poses and the closed set of anchored object types.
pub mod anchor;

/// Connection lifecycle events emitted by transports.
pub mod connection;

/// Peer devices taking part in a sharing session.
pub mod device;

/// Session role, state and UI screen enums.
pub mod session;
