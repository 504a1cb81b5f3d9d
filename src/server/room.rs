use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::protocol::{PlayerBrief, Quaternion, RoomId, RoomSummary, SessionId, Vector3};

/// Size of the spawn table; joins beyond this are rejected.
pub const MAX_SPAWN_SLOTS: usize = 20;

/// World-space spawn point for a slot: a grid line along the start straight.
#[must_use]
pub fn spawn_position(slot: usize) -> Vector3 {
    Vector3::new(66.0 - 6.0 * slot as f32, -2.0, 0.8)
}

/// One session's presence inside a room.
#[derive(Debug, Clone)]
pub struct RoomMember {
    pub id: SessionId,
    pub name: String,
    pub udp_addr: Option<SocketAddr>,
    pub position: Vector3,
    pub rotation: Quaternion,
}

impl RoomMember {
    pub fn new(id: SessionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            udp_addr: None,
            position: Vector3::default(),
            rotation: Quaternion::default(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoomJoinError {
    #[error("Room is full")]
    Full,
    #[error("Game already in progress")]
    AlreadyStarted,
    #[error("Already in this room")]
    AlreadyMember,
    #[error("No spawn positions left")]
    OutOfSpawnSlots,
}

/// What happened when a member was removed.
#[derive(Debug)]
pub struct RemovalOutcome {
    pub removed: RoomMember,
    /// Set when host duty moved to another member.
    pub new_host: Option<SessionId>,
    pub room_now_empty: bool,
}

/// One race instance: members, host, spawn assignment, and the live
/// position cache replicated to late observers.
#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub host_id: Option<SessionId>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub max_players: usize,
    members: HashMap<SessionId, RoomMember>,
    /// Join order; drives deterministic host transfer.
    join_order: Vec<SessionId>,
    /// Spawn slots are handed out monotonically and never reused, so a
    /// rejoining player never lands on another car's grid position.
    spawn_slots: HashMap<SessionId, usize>,
    next_spawn_slot: usize,
}

impl Room {
    #[must_use]
    pub fn new(id: RoomId, name: impl Into<String>, max_players: usize) -> Self {
        Self {
            id,
            name: name.into(),
            host_id: None,
            is_active: false,
            created_at: Utc::now(),
            max_players,
            members: HashMap::new(),
            join_order: Vec::new(),
            spawn_slots: HashMap::new(),
            next_spawn_slot: 0,
        }
    }

    /// Add a member and assign its spawn slot. The first member becomes host.
    pub fn try_add(&mut self, member: RoomMember) -> Result<usize, RoomJoinError> {
        if self.members.contains_key(&member.id) {
            return Err(RoomJoinError::AlreadyMember);
        }
        if self.is_active {
            return Err(RoomJoinError::AlreadyStarted);
        }
        if self.members.len() >= self.max_players {
            return Err(RoomJoinError::Full);
        }
        if self.next_spawn_slot >= MAX_SPAWN_SLOTS {
            return Err(RoomJoinError::OutOfSpawnSlots);
        }

        let slot = self.next_spawn_slot;
        self.next_spawn_slot += 1;
        self.spawn_slots.insert(member.id.clone(), slot);
        self.join_order.push(member.id.clone());
        if self.host_id.is_none() {
            self.host_id = Some(member.id.clone());
        }
        self.members.insert(member.id.clone(), member);
        Ok(slot)
    }

    /// Remove a member, transferring host duty to the first remaining member
    /// in join order when the host departs. Spawn slots are not freed.
    pub fn try_remove(&mut self, id: &SessionId) -> Option<RemovalOutcome> {
        let removed = self.members.remove(id)?;
        self.join_order.retain(|member| member != id);

        let mut new_host = None;
        if self.host_id.as_ref() == Some(id) {
            self.host_id = self.join_order.first().cloned();
            new_host = self.host_id.clone();
        }

        Some(RemovalOutcome {
            removed,
            new_host,
            room_now_empty: self.members.is_empty(),
        })
    }

    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.members.contains_key(id)
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_host(&self, id: &SessionId) -> bool {
        self.host_id.as_ref() == Some(id)
    }

    /// Refresh a member's replicated transform and datagram endpoint.
    pub fn update_position(
        &mut self,
        id: &SessionId,
        position: Vector3,
        rotation: Quaternion,
        udp_addr: Option<SocketAddr>,
    ) -> bool {
        let Some(member) = self.members.get_mut(id) else {
            return false;
        };
        member.position = position;
        member.rotation = rotation;
        if udp_addr.is_some() {
            member.udp_addr = udp_addr;
        }
        true
    }

    /// Spawn point assigned to a member on join.
    #[must_use]
    pub fn spawn_for(&self, id: &SessionId) -> Option<Vector3> {
        self.spawn_slots.get(id).map(|slot| spawn_position(*slot))
    }

    /// Flip to in-game and compute the spawn map broadcast with GAME_STARTED.
    pub fn start_game(&mut self) -> HashMap<SessionId, Vector3> {
        self.is_active = true;
        self.members
            .keys()
            .filter_map(|id| self.spawn_for(id).map(|pos| (id.clone(), pos)))
            .collect()
    }

    /// Members in join order, as listed by GET_ROOM_PLAYERS.
    #[must_use]
    pub fn player_list(&self) -> Vec<PlayerBrief> {
        self.join_order
            .iter()
            .filter_map(|id| self.members.get(id))
            .map(|member| PlayerBrief {
                id: member.id.clone(),
                name: member.name.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            player_count: self.members.len(),
            is_active: self.is_active,
            host_id: self.host_id.clone(),
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &RoomMember> {
        self.members.values()
    }

    #[must_use]
    pub fn member(&self, id: &SessionId) -> Option<&RoomMember> {
        self.members.get(id)
    }
}
