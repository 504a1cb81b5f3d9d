//! Wire protocol: identifiers, math types, and the JSON command catalog for
//! both the control channel and the datagram channel.

mod messages;
mod types;

/// Field-level validation helpers for control commands.
pub mod validation;

pub use messages::{
    ClientCommand, CommandParseError, InputPacket, InputState, ServerReply, UpdatePacket,
};
pub use types::{
    PlayerBrief, PlayerProfile, Quaternion, RoomId, RoomSummary, SessionId, Vector3,
    DEFAULT_MAX_PLAYERS, DEFAULT_PLAYER_NAME,
};
