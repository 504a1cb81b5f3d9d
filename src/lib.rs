#![cfg_attr(not(test), deny(clippy::panic))]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines
)]

//! # Slipstream Server
//!
//! Network core of a real-time multiplayer racing game server.
//!
//! Clients hold a TLS control channel (newline-delimited JSON) for lobby and
//! room commands, plus a UDP datagram channel (length-prefixed AES-CBC) for
//! high-frequency position and input replication.

/// Server configuration loading and defaults
pub mod config;

/// Pluggable connection/security/room event sink
pub mod events;

/// Structured logging configuration
pub mod logging;

/// Wire protocol definitions for both channels
pub mod protocol;

/// Datagram crypto, rate limiting, validation, certificates
pub mod security;

/// Main server orchestration
pub mod server;
