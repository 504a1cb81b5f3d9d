//! Security subsystem: datagram crypto, rate limiting, packet validation,
//! violation accounting, and TLS certificate provisioning.

/// Self-signed certificate load-or-generate and rustls config assembly.
pub mod certificate;

/// Per-session AES-256-CBC datagram cipher.
pub mod cipher;

/// Violation accounting and screening orchestration.
pub mod manager;

/// Structural, physics, and input-range datagram validation.
pub mod packet_validator;

/// Sliding-window rate accounting for both channels.
pub mod rate_limiter;

pub use certificate::{server_tls_config, CertificateConfig};
pub use cipher::{CipherError, DatagramCipher, LENGTH_PREFIX_SIZE, UDP_SHARED_SECRET};
pub use manager::{ClientSecurityStats, DatagramVerdict, SecurityConfig, SecurityManager};
pub use packet_validator::{
    FailureCategory, PacketValidator, PhysicsConfig, ValidatedPacket, ValidationFailure,
};
pub use rate_limiter::{RateLimitConfig, SlidingRateLimiter, TrafficChannel};
