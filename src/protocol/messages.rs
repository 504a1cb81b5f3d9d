use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::types::{PlayerBrief, PlayerProfile, Quaternion, RoomId, RoomSummary, SessionId, Vector3};

/// Commands accepted on the control channel, tagged by the `command` field.
///
/// Unspecified fields in a request are ignored; missing required fields fail
/// structurally and surface as an `ERROR` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ClientCommand {
    /// Set the display name; with a password this doubles as authentication.
    #[serde(rename = "NAME")]
    Name {
        name: String,
        #[serde(default)]
        password: Option<String>,
    },
    /// Re-verify a password against the previously announced name.
    #[serde(rename = "AUTHENTICATE")]
    Authenticate { password: String },
    #[serde(rename = "CREATE_ROOM")]
    CreateRoom { name: String },
    #[serde(rename = "JOIN_ROOM")]
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    #[serde(rename = "LEAVE_ROOM")]
    LeaveRoom,
    #[serde(rename = "START_GAME")]
    StartGame,
    #[serde(rename = "LIST_ROOMS")]
    ListRooms,
    #[serde(rename = "GET_ROOM_PLAYERS")]
    GetRoomPlayers,
    /// Deliver an arbitrary JSON payload to another session's control channel.
    #[serde(rename = "RELAY_MESSAGE")]
    RelayMessage {
        #[serde(rename = "targetId")]
        target_id: SessionId,
        message: Value,
    },
    #[serde(rename = "PLAYER_INFO")]
    PlayerInfo,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "BYE")]
    Bye,
}

/// Every command tag the server understands, used to tell a malformed known
/// command apart from an unknown one.
const KNOWN_COMMANDS: &[&str] = &[
    "NAME",
    "AUTHENTICATE",
    "CREATE_ROOM",
    "JOIN_ROOM",
    "LEAVE_ROOM",
    "START_GAME",
    "LIST_ROOMS",
    "GET_ROOM_PLAYERS",
    "RELAY_MESSAGE",
    "PLAYER_INFO",
    "PING",
    "BYE",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("Missing command field")]
    MissingCommand,
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("Malformed {command} command: {reason}")]
    Malformed { command: String, reason: String },
}

impl ClientCommand {
    /// Decode a control-channel JSON object into a command.
    ///
    /// A recognized tag with bad fields is [`CommandParseError::Malformed`];
    /// an unrecognized tag maps to the `UNKNOWN_COMMAND` reply upstream.
    pub fn parse(value: &Value) -> Result<Self, CommandParseError> {
        let Some(command) = value.get("command").and_then(Value::as_str) else {
            return Err(CommandParseError::MissingCommand);
        };
        if !KNOWN_COMMANDS.contains(&command) {
            return Err(CommandParseError::Unknown(command.to_owned()));
        }
        let command = command.to_owned();
        serde_json::from_value(value.clone()).map_err(|err| CommandParseError::Malformed {
            command,
            reason: err.to_string(),
        })
    }
}

/// Replies and broadcasts emitted on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ServerReply {
    #[serde(rename = "NAME_OK")]
    NameOk {
        name: String,
        authenticated: bool,
        #[serde(rename = "udpEncryption")]
        udp_encryption: bool,
    },
    #[serde(rename = "AUTH_OK")]
    AuthOk { name: String },
    #[serde(rename = "AUTH_FAILED")]
    AuthFailed { message: String },
    #[serde(rename = "ROOM_CREATED")]
    RoomCreated {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        name: String,
    },
    #[serde(rename = "JOIN_OK")]
    JoinOk {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    #[serde(rename = "LEAVE_OK")]
    LeaveOk {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    /// Broadcast to every member when the host starts the race.
    #[serde(rename = "GAME_STARTED")]
    GameStarted {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        #[serde(rename = "hostId")]
        host_id: SessionId,
        #[serde(rename = "spawnPositions")]
        spawn_positions: HashMap<SessionId, Vector3>,
    },
    #[serde(rename = "ROOM_LIST")]
    RoomList { rooms: Vec<RoomSummary> },
    #[serde(rename = "ROOM_PLAYERS")]
    RoomPlayers {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        players: Vec<PlayerBrief>,
    },
    #[serde(rename = "RELAY_OK")]
    RelayOk {
        #[serde(rename = "targetId")]
        target_id: SessionId,
    },
    /// Delivered to the target of a RELAY_MESSAGE.
    #[serde(rename = "RELAYED_MESSAGE")]
    RelayedMessage {
        #[serde(rename = "senderId")]
        sender_id: SessionId,
        #[serde(rename = "senderName")]
        sender_name: String,
        message: Value,
    },
    #[serde(rename = "PLAYER_INFO")]
    PlayerInfo {
        #[serde(rename = "playerInfo")]
        player_info: PlayerProfile,
    },
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "BYE_OK")]
    ByeOk,
    #[serde(rename = "ERROR")]
    Error { message: String },
    #[serde(rename = "UNKNOWN_COMMAND")]
    UnknownCommand {
        #[serde(rename = "originalCommand")]
        original_command: String,
    },
}

impl ServerReply {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Decrypted UPDATE datagram body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePacket {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(default)]
    pub position: Vector3,
    #[serde(default)]
    pub rotation: Quaternion,
}

/// Steering/throttle/brake state carried by an INPUT datagram.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InputState {
    #[serde(default)]
    pub steering: f32,
    #[serde(default)]
    pub throttle: f32,
    #[serde(default)]
    pub brake: f32,
    /// Client wall-clock in epoch milliseconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Decrypted INPUT datagram body. `input` is optional pass-through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPacket {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
    #[serde(default)]
    pub input: Option<InputState>,
    #[serde(default)]
    pub client_id: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_name_with_password() {
        let value = json!({"command": "NAME", "name": "alice", "password": "pw"});
        let cmd = ClientCommand::parse(&value).unwrap();
        assert!(matches!(
            cmd,
            ClientCommand::Name { name, password: Some(pw) } if name == "alice" && pw == "pw"
        ));
    }

    #[test]
    fn parse_ignores_unspecified_fields() {
        let value = json!({"command": "PING", "extra": 42});
        assert!(matches!(
            ClientCommand::parse(&value).unwrap(),
            ClientCommand::Ping
        ));
    }

    #[test]
    fn parse_unknown_command() {
        let value = json!({"command": "FOO"});
        assert_eq!(
            ClientCommand::parse(&value),
            Err(CommandParseError::Unknown("FOO".to_owned()))
        );
    }

    #[test]
    fn parse_missing_command_field() {
        let value = json!({"name": "alice"});
        assert_eq!(
            ClientCommand::parse(&value),
            Err(CommandParseError::MissingCommand)
        );
    }

    #[test]
    fn parse_known_command_with_missing_field_is_malformed() {
        let value = json!({"command": "JOIN_ROOM"});
        assert!(matches!(
            ClientCommand::parse(&value),
            Err(CommandParseError::Malformed { command, .. }) if command == "JOIN_ROOM"
        ));
    }

    #[test]
    fn replies_carry_the_wire_command_tag() {
        let reply = ServerReply::JoinOk {
            room_id: RoomId::from("r1"),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["command"], "JOIN_OK");
        assert_eq!(value["roomId"], "r1");
    }

    #[test]
    fn unknown_command_reply_echoes_original() {
        let reply = ServerReply::UnknownCommand {
            original_command: "FOO".to_owned(),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["command"], "UNKNOWN_COMMAND");
        assert_eq!(value["originalCommand"], "FOO");
    }

    #[test]
    fn update_packet_defaults() {
        let value = json!({"command": "UPDATE", "sessionId": "abc"});
        let packet: UpdatePacket = serde_json::from_value(value).unwrap();
        assert_eq!(packet.position, Vector3::default());
        assert_eq!(packet.rotation.w, 1.0);
    }
}
