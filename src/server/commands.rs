use std::sync::Arc;

use serde_json::Value;

use crate::events::{ConnectionEvent, ConnectionEventKind, RoomEvent, RoomEventKind};
use crate::protocol::{
    validation, ClientCommand, CommandParseError, PlayerProfile, RoomId, ServerReply, SessionId,
};
use crate::security::DatagramCipher;

use super::room::{Room, RoomMember};
use super::{password_hash, RaceServer};

/// Result of processing one control-channel line.
#[derive(Debug)]
pub struct CommandOutcome {
    /// Reply to queue on the caller's channel, if any. Commands answered via
    /// a room broadcast (START_GAME) produce no direct reply.
    pub reply: Option<ServerReply>,
    /// The session should be closed after the reply is delivered.
    pub close: bool,
}

impl CommandOutcome {
    fn reply(reply: ServerReply) -> Self {
        Self {
            reply: Some(reply),
            close: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::reply(ServerReply::error(message))
    }

    fn silent() -> Self {
        Self {
            reply: None,
            close: false,
        }
    }
}

fn requires_authentication(command: &ClientCommand) -> bool {
    matches!(
        command,
        ClientCommand::CreateRoom { .. }
            | ClientCommand::JoinRoom { .. }
            | ClientCommand::LeaveRoom
            | ClientCommand::StartGame
            | ClientCommand::GetRoomPlayers
            | ClientCommand::RelayMessage { .. }
    )
}

impl RaceServer {
    /// Process one LF-framed control-channel line for `id`.
    pub async fn handle_line(&self, id: &SessionId, line: &str) -> CommandOutcome {
        self.touch_activity(id);

        if !self.security().allow_control(id).await {
            return CommandOutcome::error("Rate limit exceeded. Slow down.");
        }

        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return CommandOutcome::error("Invalid JSON format");
        };

        match ClientCommand::parse(&value) {
            Ok(command) => self.dispatch(id, command).await,
            Err(CommandParseError::Unknown(original_command)) => {
                CommandOutcome::reply(ServerReply::UnknownCommand { original_command })
            }
            Err(err) => CommandOutcome::error(err.to_string()),
        }
    }

    async fn dispatch(&self, id: &SessionId, command: ClientCommand) -> CommandOutcome {
        if requires_authentication(&command) && !self.is_authenticated(id) {
            return CommandOutcome::error("Authentication required. Please authenticate first.");
        }

        match command {
            ClientCommand::Name { name, password } => self.handle_name(id, name, password).await,
            ClientCommand::Authenticate { password } => {
                self.handle_authenticate(id, &password).await
            }
            ClientCommand::CreateRoom { name } => self.handle_create_room(id, name).await,
            ClientCommand::JoinRoom { room_id } => self.handle_join_room(id, room_id).await,
            ClientCommand::LeaveRoom => self.handle_leave_room(id).await,
            ClientCommand::StartGame => self.handle_start_game(id).await,
            ClientCommand::ListRooms => CommandOutcome::reply(ServerReply::RoomList {
                rooms: self.room_summaries(),
            }),
            ClientCommand::GetRoomPlayers => self.handle_room_players(id),
            ClientCommand::RelayMessage { target_id, message } => {
                self.handle_relay(id, target_id, message).await
            }
            ClientCommand::PlayerInfo => self.handle_player_info(id),
            ClientCommand::Ping => CommandOutcome::reply(ServerReply::Pong),
            ClientCommand::Bye => CommandOutcome {
                reply: Some(ServerReply::ByeOk),
                close: true,
            },
        }
    }

    async fn handle_name(
        &self,
        id: &SessionId,
        name: String,
        password: Option<String>,
    ) -> CommandOutcome {
        if let Err(reason) = validation::validate_player_name(&name) {
            return CommandOutcome::error(reason);
        }

        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.name = name.clone();
        } else {
            return CommandOutcome::error("Session not found");
        }

        let Some(password) = password else {
            // Rename only; authentication state is untouched.
            let authenticated = self.is_authenticated(id);
            return CommandOutcome::reply(ServerReply::NameOk {
                name,
                authenticated,
                udp_encryption: authenticated,
            });
        };

        if !self.verify_or_register_password(&name, &password) {
            return CommandOutcome::reply(ServerReply::AuthFailed {
                message: "Invalid password for this player name".to_owned(),
            });
        }

        self.mark_authenticated(id).await;
        CommandOutcome::reply(ServerReply::NameOk {
            name,
            authenticated: true,
            udp_encryption: true,
        })
    }

    async fn handle_authenticate(&self, id: &SessionId, password: &str) -> CommandOutcome {
        let Some(name) = self.session_name(id) else {
            return CommandOutcome::error("Session not found");
        };

        if !self.verify_or_register_password(&name, password) {
            return CommandOutcome::reply(ServerReply::AuthFailed {
                message: "Invalid password".to_owned(),
            });
        }

        self.mark_authenticated(id).await;
        CommandOutcome::reply(ServerReply::AuthOk { name })
    }

    /// Trust-on-first-use: an unknown name registers the presented password;
    /// a known name must match the stored hash.
    fn verify_or_register_password(&self, name: &str, password: &str) -> bool {
        let hash = password_hash(password);
        match self.passwords.entry(name.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(stored) => stored.get() == &hash,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(hash);
                true
            }
        }
    }

    async fn mark_authenticated(&self, id: &SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.authenticated = true;
            if entry.cipher.is_none() {
                entry.cipher = Some(Arc::new(DatagramCipher::for_session(id)));
            }
        }
        tracing::info!(session_id = %id, "Session authenticated");
        self.sink
            .log_connection(ConnectionEvent::new(
                id.clone(),
                ConnectionEventKind::Authenticated,
                "password accepted",
            ))
            .await;
    }

    async fn handle_create_room(&self, id: &SessionId, name: String) -> CommandOutcome {
        if let Err(reason) = validation::validate_room_name(&name) {
            return CommandOutcome::error(reason);
        }
        if self.session_room(id).is_some() {
            return CommandOutcome::error("Already in a room. Leave it first.");
        }
        let Some(player_name) = self.session_name(id) else {
            return CommandOutcome::error("Session not found");
        };

        let room_id = RoomId::generate();
        let mut room = Room::new(room_id.clone(), name.clone(), self.config.max_players_per_room);
        if let Err(err) = room.try_add(RoomMember::new(id.clone(), player_name)) {
            return CommandOutcome::error(err.to_string());
        }
        self.rooms.insert(room_id.clone(), room);
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.room_id = Some(room_id.clone());
        }

        tracing::info!(session_id = %id, %room_id, room_name = %name, "Room created");
        self.sink
            .log_room_activity(
                RoomEvent::new(room_id.clone(), RoomEventKind::Created, name.clone())
                    .with_session(id.clone()),
            )
            .await;

        CommandOutcome::reply(ServerReply::RoomCreated { room_id, name })
    }

    async fn handle_join_room(&self, id: &SessionId, room_id: RoomId) -> CommandOutcome {
        if self.session_room(id).is_some() {
            return CommandOutcome::error("Already in a room. Leave it first.");
        }
        let Some(player_name) = self.session_name(id) else {
            return CommandOutcome::error("Session not found");
        };

        let result = {
            let Some(mut room) = self.rooms.get_mut(&room_id) else {
                return CommandOutcome::error("Room not found");
            };
            room.try_add(RoomMember::new(id.clone(), player_name))
        };

        match result {
            Ok(_slot) => {
                if let Some(mut entry) = self.sessions.get_mut(id) {
                    entry.room_id = Some(room_id.clone());
                }
                tracing::info!(session_id = %id, %room_id, "Player joined room");
                self.sink
                    .log_room_activity(
                        RoomEvent::new(room_id.clone(), RoomEventKind::Joined, "player joined")
                            .with_session(id.clone()),
                    )
                    .await;
                CommandOutcome::reply(ServerReply::JoinOk { room_id })
            }
            Err(err) => CommandOutcome::error(err.to_string()),
        }
    }

    async fn handle_leave_room(&self, id: &SessionId) -> CommandOutcome {
        let Some(room_id) = self.session_room(id) else {
            return CommandOutcome::error("No room joined");
        };

        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.room_id = None;
        }
        self.detach_from_room(id, &room_id).await;

        CommandOutcome::reply(ServerReply::LeaveOk { room_id })
    }

    async fn handle_start_game(&self, id: &SessionId) -> CommandOutcome {
        let Some(room_id) = self.session_room(id) else {
            return CommandOutcome::error("No room joined");
        };

        let (host_id, spawn_positions) = {
            let Some(mut room) = self.rooms.get_mut(&room_id) else {
                return CommandOutcome::error("Room not found");
            };
            if !room.is_host(id) {
                return CommandOutcome::error(
                    "Cannot start game. Only the host can start the game.",
                );
            }
            if room.is_active {
                return CommandOutcome::error("Game already in progress");
            }
            let spawns = room.start_game();
            (room.host_id.clone().unwrap_or_else(|| id.clone()), spawns)
        };

        tracing::info!(%room_id, host_id = %host_id, players = spawn_positions.len(), "Game started");
        self.sink
            .log_room_activity(
                RoomEvent::new(room_id.clone(), RoomEventKind::GameStarted, "race started")
                    .with_session(host_id.clone()),
            )
            .await;

        self.broadcast_to_room(
            &room_id,
            Arc::new(ServerReply::GameStarted {
                room_id: room_id.clone(),
                host_id,
                spawn_positions,
            }),
            None,
        )
        .await;

        // The host hears about the start through the broadcast.
        CommandOutcome::silent()
    }

    fn handle_room_players(&self, id: &SessionId) -> CommandOutcome {
        let Some(room_id) = self.session_room(id) else {
            return CommandOutcome::error("No room joined");
        };
        let Some(players) = self.rooms.get(&room_id).map(|room| room.player_list()) else {
            return CommandOutcome::error("Room not found");
        };
        CommandOutcome::reply(ServerReply::RoomPlayers { room_id, players })
    }

    async fn handle_relay(
        &self,
        id: &SessionId,
        target_id: SessionId,
        message: Value,
    ) -> CommandOutcome {
        let Some(sender_name) = self.session_name(id) else {
            return CommandOutcome::error("Session not found");
        };

        let delivered = self
            .send_to_session(
                &target_id,
                Arc::new(ServerReply::RelayedMessage {
                    sender_id: id.clone(),
                    sender_name,
                    message,
                }),
            )
            .await;

        if delivered {
            CommandOutcome::reply(ServerReply::RelayOk { target_id })
        } else {
            CommandOutcome::error("Target player not found")
        }
    }

    fn handle_player_info(&self, id: &SessionId) -> CommandOutcome {
        let Some(entry) = self.sessions.get(id) else {
            return CommandOutcome::error("Session not found");
        };
        CommandOutcome::reply(ServerReply::PlayerInfo {
            player_info: PlayerProfile {
                id: id.clone(),
                name: entry.name.clone(),
                current_room_id: entry.room_id.clone(),
            },
        })
    }
}
