use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::{Duration, Instant};

use crate::protocol::{InputPacket, Quaternion, SessionId, UpdatePacket, Vector3};

/// Physics and input-range thresholds for datagram validation.
#[derive(Debug, Clone)]
pub struct PhysicsConfig {
    /// Maximum sustained speed, units per second.
    pub max_speed: f32,
    /// Instantaneous jump allowance, units.
    pub max_jump: f32,
    /// Maximum rotation speed, radians per second.
    pub max_angular_velocity: f32,
    /// World half-extent on the x and z axes.
    pub world_bounds_xz: f32,
    /// World half-extent on the y axis.
    pub world_bounds_y: f32,
    /// Updates closer together than this are accepted without physics checks.
    pub min_update_interval: Duration,
    /// Gaps longer than this reset motion history (reconnect / respawn).
    pub max_update_interval: Duration,
    /// Accepted skew between an INPUT timestamp and wall clock, milliseconds.
    pub input_timestamp_tolerance_ms: i64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            max_speed: 200.0,
            max_jump: 50.0,
            max_angular_velocity: 10.0,
            world_bounds_xz: 1000.0,
            world_bounds_y: 100.0,
            min_update_interval: Duration::from_millis(8),
            max_update_interval: Duration::from_secs(5),
            input_timestamp_tolerance_ms: 60_000,
        }
    }
}

/// Which class of check a packet failed; drives security event classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Structural,
    Physics,
    Input,
}

/// A rejected packet with the reason a client would be told (and isn't).
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub category: FailureCategory,
    pub reason: String,
}

impl ValidationFailure {
    fn structural(reason: impl Into<String>) -> Self {
        Self {
            category: FailureCategory::Structural,
            reason: reason.into(),
        }
    }

    fn physics(reason: impl Into<String>) -> Self {
        Self {
            category: FailureCategory::Physics,
            reason: reason.into(),
        }
    }

    fn input(reason: impl Into<String>) -> Self {
        Self {
            category: FailureCategory::Input,
            reason: reason.into(),
        }
    }
}

/// A structurally and physically acceptable datagram payload.
#[derive(Debug, Clone)]
pub enum ValidatedPacket {
    Update(UpdatePacket),
    Input(InputPacket),
}

#[derive(Debug, Clone)]
struct MotionState {
    position: Vector3,
    rotation: Quaternion,
    updated_at: Instant,
    /// Set after a reset; grants the enlarged jump allowance once.
    after_gap: bool,
}

/// Stateful validator for decrypted datagrams.
///
/// UPDATE validation keeps per-session motion history; INPUT validation is
/// stateless range checking.
pub struct PacketValidator {
    config: PhysicsConfig,
    history: DashMap<SessionId, MotionState>,
}

impl PacketValidator {
    #[must_use]
    pub fn new(config: PhysicsConfig) -> Self {
        Self {
            config,
            history: DashMap::new(),
        }
    }

    /// Validate a decrypted payload attributed to `client`.
    pub fn validate(
        &self,
        client: &SessionId,
        payload: &Value,
    ) -> Result<ValidatedPacket, ValidationFailure> {
        let Some(command) = payload.get("command").and_then(Value::as_str) else {
            return Err(ValidationFailure::structural("missing command field"));
        };
        match command {
            "UPDATE" => self.validate_update(client, payload),
            "INPUT" => self.validate_input(payload),
            other => Err(ValidationFailure::structural(format!(
                "unexpected datagram command {other}"
            ))),
        }
    }

    /// Drop motion history for a departed session.
    pub fn forget(&self, client: &SessionId) {
        self.history.remove(client);
    }

    fn validate_update(
        &self,
        client: &SessionId,
        payload: &Value,
    ) -> Result<ValidatedPacket, ValidationFailure> {
        let packet: UpdatePacket = serde_json::from_value(payload.clone())
            .map_err(|err| ValidationFailure::structural(format!("malformed UPDATE: {err}")))?;
        if packet.session_id.is_empty() {
            return Err(ValidationFailure::structural(
                "sessionId must be a non-empty string",
            ));
        }

        self.check_world_bounds(&packet.position)?;

        let now = Instant::now();
        let mut occupied = match self.history.entry(client.clone()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                // First update from this session: seed history.
                vacant.insert(MotionState {
                    position: packet.position,
                    rotation: packet.rotation,
                    updated_at: now,
                    after_gap: false,
                });
                return Ok(ValidatedPacket::Update(packet));
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied,
        };
        let state = occupied.get_mut();

        let elapsed = now.duration_since(state.updated_at);

        if elapsed < self.config.min_update_interval {
            // Burst tolerance: accept and track without physics checks.
            state.position = packet.position;
            state.rotation = packet.rotation;
            state.updated_at = now;
            return Ok(ValidatedPacket::Update(packet));
        }

        if elapsed > self.config.max_update_interval {
            // Long silence: treat as reconnect or respawn.
            state.position = packet.position;
            state.rotation = packet.rotation;
            state.updated_at = now;
            state.after_gap = true;
            return Ok(ValidatedPacket::Update(packet));
        }

        let dt = elapsed.as_secs_f32();
        let jump_allowance = if state.after_gap {
            3.0 * self.config.max_jump
        } else {
            self.config.max_jump
        };
        let max_distance = (self.config.max_speed * dt).max(jump_allowance);
        let distance = state.position.distance_to(&packet.position);
        if distance > max_distance {
            return Err(ValidationFailure::physics(format!(
                "moved {distance:.1} units in {:.0} ms (allowed {max_distance:.1})",
                dt * 1000.0
            )));
        }

        let angle = state.rotation.angle_to(&packet.rotation);
        let max_angle = self.config.max_angular_velocity * dt;
        if angle > max_angle {
            return Err(ValidationFailure::physics(format!(
                "rotated {angle:.2} rad in {:.0} ms (allowed {max_angle:.2})",
                dt * 1000.0
            )));
        }

        state.position = packet.position;
        state.rotation = packet.rotation;
        state.updated_at = now;
        state.after_gap = false;
        Ok(ValidatedPacket::Update(packet))
    }

    fn check_world_bounds(&self, position: &Vector3) -> Result<(), ValidationFailure> {
        if position.x.abs() > self.config.world_bounds_xz
            || position.z.abs() > self.config.world_bounds_xz
            || position.y.abs() > self.config.world_bounds_y
        {
            return Err(ValidationFailure::physics(format!(
                "position ({}, {}, {}) outside world bounds",
                position.x, position.y, position.z
            )));
        }
        Ok(())
    }

    fn validate_input(&self, payload: &Value) -> Result<ValidatedPacket, ValidationFailure> {
        let packet: InputPacket = serde_json::from_value(payload.clone())
            .map_err(|err| ValidationFailure::structural(format!("malformed INPUT: {err}")))?;
        if packet.session_id.is_empty() {
            return Err(ValidationFailure::structural(
                "sessionId must be a non-empty string",
            ));
        }

        // Missing input state is accepted pass-through.
        let Some(input) = packet.input else {
            return Ok(ValidatedPacket::Input(packet));
        };

        if !(-1.0..=1.0).contains(&input.steering) {
            return Err(ValidationFailure::input(format!(
                "steering {} out of range [-1, 1]",
                input.steering
            )));
        }
        if !(0.0..=1.0).contains(&input.throttle) {
            return Err(ValidationFailure::input(format!(
                "throttle {} out of range [0, 1]",
                input.throttle
            )));
        }
        if !(0.0..=1.0).contains(&input.brake) {
            return Err(ValidationFailure::input(format!(
                "brake {} out of range [0, 1]",
                input.brake
            )));
        }
        if let Some(timestamp) = input.timestamp {
            let skew = (Utc::now().timestamp_millis() - timestamp).abs();
            if skew > self.config.input_timestamp_tolerance_ms {
                return Err(ValidationFailure::input(format!(
                    "input timestamp skew {skew} ms exceeds tolerance"
                )));
            }
        }

        Ok(ValidatedPacket::Input(packet))
    }
}
