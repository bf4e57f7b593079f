//! Infrastructure layer for the session coordinator.
//!
//! Contains the adapters behind the application ports: wireless links
//! (`network`), cloud anchor backends (`cloud`) and file-system
//! configuration (`storage`).
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `arpet_core`, but MUST NOT be imported by the `application` or domain
//! layers.

pub mod cloud;
pub mod network;
pub mod storage;
