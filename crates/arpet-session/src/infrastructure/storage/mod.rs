//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module handles:
//!
//! - Reading the TOML configuration file from the platform-appropriate
//!   directory, or from a path given on the command line.
//! - Writing changes back to disk.
//! - Providing sensible defaults when the file does not exist yet (first run).
//! - Turning the file's plain values into the session and transport settings
//!   the rest of the crate uses.

pub mod config;
