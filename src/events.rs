//! Pluggable event sink for connection, security, and room lifecycle events.
//!
//! The server calls the sink fire-and-forget; implementations must swallow
//! their own failures. A database-backed sink plugs in behind the same trait.

use std::net::SocketAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::protocol::{RoomId, SessionId};

/// Severity for free-form server events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    Connected,
    Authenticated,
    Disconnected,
    Kicked,
    IdleTimeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    pub remote_addr: Option<SocketAddr>,
    pub kind: ConnectionEventKind,
    pub detail: String,
}

impl ConnectionEvent {
    pub fn new(session_id: SessionId, kind: ConnectionEventKind, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id,
            remote_addr: None,
            kind,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomEventKind {
    Created,
    Joined,
    Left,
    HostTransferred,
    GameStarted,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomEvent {
    pub timestamp: DateTime<Utc>,
    pub room_id: RoomId,
    pub session_id: Option<SessionId>,
    pub kind: RoomEventKind,
    pub detail: String,
}

impl RoomEvent {
    pub fn new(room_id: RoomId, kind: RoomEventKind, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            room_id,
            session_id: None,
            kind,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Classification of security events; each kind has a fixed severity (1-5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    RateLimitExceeded,
    PacketValidationFailure,
    PhysicsViolation,
    SessionSpoof,
    PlayerKicked,
}

impl SecurityEventKind {
    #[must_use]
    pub fn severity(self) -> u8 {
        match self {
            Self::RateLimitExceeded => 2,
            Self::PacketValidationFailure | Self::PhysicsViolation | Self::SessionSpoof => 3,
            Self::PlayerKicked => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: SecurityEventKind,
    pub client_id: SessionId,
    pub description: String,
    pub severity: u8,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, client_id: SessionId, description: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            client_id,
            description: description.into(),
            severity: kind.severity(),
        }
    }
}

/// Narrow logging interface the core emits into.
///
/// Implementations may be synchronous, asynchronous, or null; errors must
/// never propagate back into the caller.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn log_connection(&self, event: ConnectionEvent);
    async fn log_security(&self, event: SecurityEvent);
    async fn log_room_activity(&self, event: RoomEvent);
    async fn log_server_event(
        &self,
        level: EventLevel,
        category: &str,
        message: &str,
        context: Option<Value>,
    );
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn log_connection(&self, _event: ConnectionEvent) {}
    async fn log_security(&self, _event: SecurityEvent) {}
    async fn log_room_activity(&self, _event: RoomEvent) {}
    async fn log_server_event(
        &self,
        _level: EventLevel,
        _category: &str,
        _message: &str,
        _context: Option<Value>,
    ) {
    }
}

/// Forwards events to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn log_connection(&self, event: ConnectionEvent) {
        tracing::info!(
            session_id = %event.session_id,
            kind = ?event.kind,
            detail = %event.detail,
            "connection event"
        );
    }

    async fn log_security(&self, event: SecurityEvent) {
        tracing::warn!(
            client_id = %event.client_id,
            kind = ?event.kind,
            severity = event.severity,
            description = %event.description,
            "security event"
        );
    }

    async fn log_room_activity(&self, event: RoomEvent) {
        tracing::info!(
            room_id = %event.room_id,
            kind = ?event.kind,
            detail = %event.detail,
            "room event"
        );
    }

    async fn log_server_event(
        &self,
        level: EventLevel,
        category: &str,
        message: &str,
        context: Option<Value>,
    ) {
        match level {
            EventLevel::Debug => {
                tracing::debug!(category, context = ?context, "{message}");
            }
            EventLevel::Info => {
                tracing::info!(category, context = ?context, "{message}");
            }
            EventLevel::Warning => {
                tracing::warn!(category, context = ?context, "{message}");
            }
            EventLevel::Error => {
                tracing::error!(category, context = ?context, "{message}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping_matches_policy() {
        assert_eq!(SecurityEventKind::RateLimitExceeded.severity(), 2);
        assert_eq!(SecurityEventKind::PacketValidationFailure.severity(), 3);
        assert_eq!(SecurityEventKind::PhysicsViolation.severity(), 3);
        assert_eq!(SecurityEventKind::PlayerKicked.severity(), 4);
    }

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        let sink = NullEventSink;
        sink.log_connection(ConnectionEvent::new(
            SessionId::from("s1"),
            ConnectionEventKind::Connected,
            "test",
        ))
        .await;
        sink.log_server_event(EventLevel::Info, "test", "hello", None)
            .await;
    }
}
