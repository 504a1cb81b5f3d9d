use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::events::{EventSink, SecurityEvent, SecurityEventKind};
use crate::protocol::SessionId;

use super::packet_validator::{
    FailureCategory, PacketValidator, PhysicsConfig, ValidatedPacket,
};
use super::rate_limiter::{RateLimitConfig, SlidingRateLimiter, TrafficChannel};

/// Aggregate configuration for the security subsystem.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub rate_limits: RateLimitConfig,
    pub physics: PhysicsConfig,
    /// Recent violations that trigger a kick.
    pub violation_threshold: usize,
    /// Sliding window for violation accounting.
    pub violation_window: Duration,
    /// Capacity of the in-memory security event ring buffer.
    pub event_buffer_capacity: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimitConfig::default(),
            physics: PhysicsConfig::default(),
            violation_threshold: 3,
            violation_window: Duration::from_secs(300),
            event_buffer_capacity: 1000,
        }
    }
}

/// Outcome of screening one inbound datagram.
#[derive(Debug)]
pub enum DatagramVerdict {
    Accept(ValidatedPacket),
    Reject {
        /// The client crossed the violation threshold and must be disconnected.
        kick: bool,
    },
}

/// Point-in-time security view of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSecurityStats {
    pub control_rate: usize,
    pub datagram_rate: usize,
    pub recent_violations: usize,
    pub threat_level: u8,
}

/// Orchestrates rate limiting, packet validation, and violation accounting.
pub struct SecurityManager {
    config: SecurityConfig,
    rate_limiter: SlidingRateLimiter,
    validator: PacketValidator,
    violations: DashMap<SessionId, VecDeque<Instant>>,
    events: Mutex<VecDeque<SecurityEvent>>,
    sink: Arc<dyn EventSink>,
}

impl SecurityManager {
    #[must_use]
    pub fn new(config: SecurityConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            rate_limiter: SlidingRateLimiter::new(config.rate_limits.clone()),
            validator: PacketValidator::new(config.physics.clone()),
            violations: DashMap::new(),
            events: Mutex::new(VecDeque::new()),
            config,
            sink,
        }
    }

    /// Rate-check one control-channel message. Over-limit messages are
    /// recorded as security events but do not count as violations.
    pub async fn allow_control(&self, client: &SessionId) -> bool {
        if self.rate_limiter.allow(client, TrafficChannel::Control) {
            return true;
        }
        self.emit(
            SecurityEventKind::RateLimitExceeded,
            client.clone(),
            "control message rate limit exceeded",
        )
        .await;
        false
    }

    /// Screen one decrypted datagram attributed to `client`.
    pub async fn screen_datagram(&self, client: &SessionId, payload: &Value) -> DatagramVerdict {
        if !self.rate_limiter.allow(client, TrafficChannel::Datagram) {
            self.emit(
                SecurityEventKind::RateLimitExceeded,
                client.clone(),
                "datagram rate limit exceeded",
            )
            .await;
            return DatagramVerdict::Reject { kick: false };
        }

        match self.validator.validate(client, payload) {
            Ok(packet) => DatagramVerdict::Accept(packet),
            Err(failure) => {
                let kind = match failure.category {
                    FailureCategory::Physics => SecurityEventKind::PhysicsViolation,
                    FailureCategory::Structural | FailureCategory::Input => {
                        SecurityEventKind::PacketValidationFailure
                    }
                };
                self.emit(kind, client.clone(), failure.reason).await;

                let recent = self.record_violation(client);
                if recent >= self.config.violation_threshold {
                    self.emit(
                        SecurityEventKind::PlayerKicked,
                        client.clone(),
                        format!("{recent} validation failures within the accounting window"),
                    )
                    .await;
                    return DatagramVerdict::Reject { kick: true };
                }
                DatagramVerdict::Reject { kick: false }
            }
        }
    }

    /// Record a sender-identity mismatch on an encrypted datagram.
    pub async fn record_spoof(&self, client: &SessionId, description: impl Into<String>) {
        self.emit(SecurityEventKind::SessionSpoof, client.clone(), description)
            .await;
        self.record_violation(client);
    }

    fn record_violation(&self, client: &SessionId) -> usize {
        let now = Instant::now();
        let mut window = self.violations.entry(client.clone()).or_default();
        window.push_back(now);
        let cutoff = now.checked_sub(self.config.violation_window);
        if let Some(cutoff) = cutoff {
            while window.front().is_some_and(|t| *t <= cutoff) {
                window.pop_front();
            }
        }
        window.len()
    }

    fn recent_violations(&self, client: &SessionId) -> usize {
        let Some(mut window) = self.violations.get_mut(client) else {
            return 0;
        };
        let cutoff = Instant::now().checked_sub(self.config.violation_window);
        if let Some(cutoff) = cutoff {
            while window.front().is_some_and(|t| *t <= cutoff) {
                window.pop_front();
            }
        }
        window.len()
    }

    /// 0 = clean; 1-3 = recent violations, saturating.
    #[must_use]
    pub fn threat_level(&self, client: &SessionId) -> u8 {
        self.recent_violations(client).min(3) as u8
    }

    #[must_use]
    pub fn stats(&self, client: &SessionId) -> ClientSecurityStats {
        ClientSecurityStats {
            control_rate: self.rate_limiter.current_rate(client, TrafficChannel::Control),
            datagram_rate: self
                .rate_limiter
                .current_rate(client, TrafficChannel::Datagram),
            recent_violations: self.recent_violations(client),
            threat_level: self.threat_level(client),
        }
    }

    /// Snapshot of the bounded event buffer, oldest first.
    #[must_use]
    pub fn recent_events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all per-client state for a departed session.
    pub fn forget(&self, client: &SessionId) {
        self.rate_limiter.forget(client);
        self.validator.forget(client);
        self.violations.remove(client);
    }

    /// Periodically evict idle rate-limiter state until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.rate_limits.sweep_interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => self.rate_limiter.sweep(),
            }
        }
    }

    async fn emit(&self, kind: SecurityEventKind, client: SessionId, description: impl Into<String>) {
        let event = SecurityEvent::new(kind, client, description);
        tracing::warn!(
            client_id = %event.client_id,
            kind = ?event.kind,
            severity = event.severity,
            "{}",
            event.description
        );
        if let Ok(mut events) = self.events.lock() {
            if events.len() >= self.config.event_buffer_capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
        self.sink.log_security(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use serde_json::json;

    fn manager() -> SecurityManager {
        SecurityManager::new(SecurityConfig::default(), Arc::new(NullEventSink))
    }

    // Structurally broken: empty sessionId.
    fn bad_update() -> Value {
        json!({"command": "UPDATE", "sessionId": ""})
    }

    fn good_update(session: &str) -> Value {
        json!({
            "command": "UPDATE",
            "sessionId": session,
            "position": {"x": 0.0, "y": 0.0, "z": 0.0},
            "rotation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0},
        })
    }

    #[tokio::test]
    async fn valid_update_is_accepted() {
        let manager = manager();
        let client = SessionId::from("a");
        assert!(matches!(
            manager.screen_datagram(&client, &good_update("a")).await,
            DatagramVerdict::Accept(ValidatedPacket::Update(_))
        ));
        assert_eq!(manager.threat_level(&client), 0);
    }

    #[tokio::test]
    async fn three_violations_trigger_kick() {
        let manager = manager();
        let client = SessionId::from("a");

        for round in 0..2 {
            match manager.screen_datagram(&client, &bad_update()).await {
                DatagramVerdict::Reject { kick } => {
                    assert!(!kick, "round {round} should not kick yet")
                }
                DatagramVerdict::Accept(_) => panic!("broken packet accepted"),
            }
        }
        assert_eq!(manager.threat_level(&client), 2);

        match manager.screen_datagram(&client, &bad_update()).await {
            DatagramVerdict::Reject { kick } => assert!(kick, "third violation must kick"),
            DatagramVerdict::Accept(_) => panic!("broken packet accepted"),
        }
        assert_eq!(manager.threat_level(&client), 3);

        let events = manager.recent_events();
        assert!(events
            .iter()
            .any(|e| e.kind == SecurityEventKind::PlayerKicked && e.severity == 4));
    }

    #[tokio::test]
    async fn physics_violation_is_classified() {
        let manager = manager();
        let client = SessionId::from("a");

        let _ = manager.screen_datagram(&client, &good_update("a")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let teleport = json!({
            "command": "UPDATE",
            "sessionId": "a",
            "position": {"x": 500.0, "y": 0.0, "z": 0.0},
        });
        let _ = manager.screen_datagram(&client, &teleport).await;

        let events = manager.recent_events();
        assert!(events
            .iter()
            .any(|e| e.kind == SecurityEventKind::PhysicsViolation && e.severity == 3));
    }

    #[tokio::test]
    async fn datagram_flood_emits_rate_limit_event() {
        let manager = manager();
        let client = SessionId::from("a");

        let mut rejected = false;
        for _ in 0..140 {
            if matches!(
                manager.screen_datagram(&client, &good_update("a")).await,
                DatagramVerdict::Reject { .. }
            ) {
                rejected = true;
                break;
            }
            // Keep updates physically plausible so only the limiter can trip.
            tokio::task::yield_now().await;
        }
        assert!(rejected);
        assert!(manager
            .recent_events()
            .iter()
            .any(|e| e.kind == SecurityEventKind::RateLimitExceeded && e.severity == 2));
        // Rate overages are not violations.
        assert_eq!(manager.threat_level(&client), 0);
    }

    #[tokio::test]
    async fn forget_clears_violations() {
        let manager = manager();
        let client = SessionId::from("a");
        let _ = manager.screen_datagram(&client, &bad_update()).await;
        assert_eq!(manager.threat_level(&client), 1);

        manager.forget(&client);
        assert_eq!(manager.threat_level(&client), 0);
    }

    #[tokio::test]
    async fn stats_snapshot_reflects_activity() {
        let manager = manager();
        let client = SessionId::from("a");

        let _ = manager.screen_datagram(&client, &good_update("a")).await;
        let _ = manager.screen_datagram(&client, &bad_update()).await;
        manager.allow_control(&client).await;

        let stats = manager.stats(&client);
        assert_eq!(stats.control_rate, 1);
        assert_eq!(stats.datagram_rate, 2);
        assert_eq!(stats.recent_violations, 1);
        assert_eq!(stats.threat_level, 1);
    }

    #[tokio::test]
    async fn spoof_records_violation() {
        let manager = manager();
        let client = SessionId::from("a");
        manager.record_spoof(&client, "sessionId mismatch").await;
        assert_eq!(manager.threat_level(&client), 1);
        assert!(manager
            .recent_events()
            .iter()
            .any(|e| e.kind == SecurityEventKind::SessionSpoof));
    }

    #[tokio::test]
    async fn event_buffer_is_bounded() {
        let config = SecurityConfig {
            event_buffer_capacity: 5,
            ..SecurityConfig::default()
        };
        let manager = SecurityManager::new(config, Arc::new(NullEventSink));
        let client = SessionId::from("a");
        for _ in 0..20 {
            manager.record_spoof(&client, "x").await;
        }
        assert!(manager.recent_events().len() <= 5);
    }
}
