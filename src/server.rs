use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use smallvec::SmallVec;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::events::{
    ConnectionEvent, ConnectionEventKind, EventSink, RoomEvent, RoomEventKind,
};
use crate::protocol::{RoomId, ServerReply, SessionId, DEFAULT_MAX_PLAYERS, DEFAULT_PLAYER_NAME};
use crate::security::{
    self, CertificateConfig, DatagramCipher, SecurityConfig, SecurityManager,
};

mod commands;
mod datagram;
mod heartbeat;
mod room;
mod session;

pub use commands::CommandOutcome;
pub use room::{spawn_position, Room, RoomJoinError, RoomMember, MAX_SPAWN_SLOTS};

/// Top-level server tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port shared (by convention) between the TCP and UDP listeners.
    pub port: u16,
    pub bind_addr: IpAddr,
    /// Certificate CN and primary SAN.
    pub hostname: String,
    /// Publicly routable address advertised in the certificate.
    pub public_ip: Option<IpAddr>,
    pub max_players_per_room: usize,
    /// Sessions idle beyond this are reaped by the heartbeat.
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Outbound control-channel queue depth per session.
    pub session_buffer: usize,
    /// Control-channel lines above this length terminate the session.
    pub max_line_length: usize,
    pub certificate: CertificateConfig,
    pub security: SecurityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 443,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            hostname: "localhost".to_owned(),
            public_ip: None,
            max_players_per_room: DEFAULT_MAX_PLAYERS,
            idle_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            session_buffer: 64,
            max_line_length: 64 * 1024,
            certificate: CertificateConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

/// Why a session left the registry; drives the connection event emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    SocketError,
    IdleTimeout,
    Kicked,
    ServerShutdown,
}

impl DisconnectReason {
    fn event_kind(self) -> ConnectionEventKind {
        match self {
            Self::IdleTimeout => ConnectionEventKind::IdleTimeout,
            Self::Kicked => ConnectionEventKind::Kicked,
            Self::ClientClosed | Self::SocketError | Self::ServerShutdown => {
                ConnectionEventKind::Disconnected
            }
        }
    }
}

/// Registry entry for one live control-channel connection.
///
/// Mutated only from the owning session's task (and the datagram task for
/// endpoint/activity refreshes); guards are dropped before any await.
pub(crate) struct SessionEntry {
    pub name: String,
    pub authenticated: bool,
    pub room_id: Option<RoomId>,
    pub last_activity: Instant,
    /// Learned from the first datagram this session sends.
    pub udp_addr: Option<SocketAddr>,
    /// Set on authentication, never unset: the broadcast path reads it
    /// without coordination.
    pub cipher: Option<Arc<DatagramCipher>>,
    pub sender: mpsc::Sender<Arc<ServerReply>>,
    pub cancel: CancellationToken,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

/// The racing relay core: listeners, session registry, room registry,
/// password table, and the security subsystem.
pub struct RaceServer {
    config: ServerConfig,
    sessions: DashMap<SessionId, SessionEntry>,
    rooms: DashMap<RoomId, Room>,
    /// Display name -> base64(SHA-256(password)); trust-on-first-use.
    passwords: DashMap<String, String>,
    security: Arc<SecurityManager>,
    sink: Arc<dyn EventSink>,
    shutdown: CancellationToken,
}

impl RaceServer {
    #[must_use]
    pub fn new(config: ServerConfig, sink: Arc<dyn EventSink>) -> Arc<Self> {
        let security = Arc::new(SecurityManager::new(config.security.clone(), sink.clone()));
        Arc::new(Self {
            config,
            sessions: DashMap::new(),
            rooms: DashMap::new(),
            passwords: DashMap::new(),
            security,
            sink,
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown; `run` unwinds listeners and drains sessions.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Bind both listeners and serve until `stop` is called.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let tls = security::server_tls_config(
            &self.config.certificate,
            &self.config.hostname,
            self.config.public_ip,
        )?;
        let acceptor = TlsAcceptor::from(tls);

        let bind = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind control listener on {bind}"))?;
        let udp = Arc::new(
            UdpSocket::bind(bind)
                .await
                .with_context(|| format!("failed to bind datagram socket on {bind}"))?,
        );

        tracing::info!(%bind, "Racing relay server listening (TCP control + UDP datagrams)");

        let mut background = tokio::task::JoinSet::new();
        background.spawn(datagram::run_datagram_loop(self.clone(), udp));
        background.spawn(heartbeat::run_heartbeat(self.clone()));
        background.spawn(self.security.clone().run_sweeper(self.shutdown.clone()));

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    session::run_session(server, tls_stream, peer).await;
                                }
                                Err(err) => {
                                    tracing::debug!(%peer, error = %err, "TLS handshake failed");
                                }
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to accept control connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        while background.join_next().await.is_some() {}
        self.drain_sessions().await;
        tracing::info!("Server stopped");
        Ok(())
    }

    async fn drain_sessions(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.remove_session(&id, DisconnectReason::ServerShutdown).await;
        }
    }

    /// Create a registry entry for a freshly accepted connection.
    pub async fn register_session(
        &self,
        sender: mpsc::Sender<Arc<ServerReply>>,
        remote_addr: SocketAddr,
    ) -> SessionId {
        let id = SessionId::generate();
        let entry = SessionEntry {
            name: DEFAULT_PLAYER_NAME.to_owned(),
            authenticated: false,
            room_id: None,
            last_activity: Instant::now(),
            udp_addr: None,
            cipher: None,
            sender,
            cancel: self.shutdown.child_token(),
            remote_addr,
            connected_at: Utc::now(),
        };
        self.sessions.insert(id.clone(), entry);

        tracing::info!(session_id = %id, %remote_addr, "Session connected");
        self.sink
            .log_connection(
                ConnectionEvent::new(
                    id.clone(),
                    ConnectionEventKind::Connected,
                    "control channel connected",
                )
                .with_addr(remote_addr),
            )
            .await;
        id
    }

    /// Remove a session, detaching it from its room and purging security
    /// state. Safe to call twice; the second call is a no-op.
    pub async fn remove_session(&self, id: &SessionId, reason: DisconnectReason) {
        let Some((_, entry)) = self.sessions.remove(id) else {
            return;
        };
        entry.cancel.cancel();

        if let Some(room_id) = entry.room_id {
            self.detach_from_room(id, &room_id).await;
        }
        self.security.forget(id);

        let uptime = Utc::now().signed_duration_since(entry.connected_at);
        tracing::info!(
            session_id = %id,
            ?reason,
            uptime_secs = uptime.num_seconds(),
            "Session removed"
        );
        self.sink
            .log_connection(
                ConnectionEvent::new(id.clone(), reason.event_kind(), format!("{reason:?}"))
                    .with_addr(entry.remote_addr),
            )
            .await;
    }

    /// Forcibly disconnect a session (security kick).
    pub async fn kick_session(&self, id: &SessionId) {
        self.remove_session(id, DisconnectReason::Kicked).await;
    }

    pub(crate) fn session_cancel(&self, id: &SessionId) -> Option<CancellationToken> {
        self.sessions.get(id).map(|entry| entry.cancel.clone())
    }

    pub(crate) fn touch_activity(&self, id: &SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.last_activity = Instant::now();
        }
    }

    #[must_use]
    pub fn is_connected(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    #[must_use]
    pub fn session_name(&self, id: &SessionId) -> Option<String> {
        self.sessions.get(id).map(|entry| entry.name.clone())
    }

    #[must_use]
    pub fn session_room(&self, id: &SessionId) -> Option<RoomId> {
        self.sessions.get(id).and_then(|entry| entry.room_id.clone())
    }

    #[must_use]
    pub fn session_cipher(&self, id: &SessionId) -> Option<Arc<DatagramCipher>> {
        self.sessions.get(id).and_then(|entry| entry.cipher.clone())
    }

    #[must_use]
    pub fn is_authenticated(&self, id: &SessionId) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|entry| entry.authenticated)
    }

    #[must_use]
    pub fn room_summaries(&self) -> Vec<crate::protocol::RoomSummary> {
        self.rooms.iter().map(|room| room.summary()).collect()
    }

    /// Queue a reply/broadcast on a session's control channel. Best-effort:
    /// a full or closed queue loses the message for that recipient only.
    pub async fn send_to_session(&self, id: &SessionId, reply: Arc<ServerReply>) -> bool {
        let Some(sender) = self.sessions.get(id).map(|entry| entry.sender.clone()) else {
            return false;
        };
        if sender.try_send(reply).is_err() {
            tracing::warn!(session_id = %id, "Failed to queue control message");
            return false;
        }
        true
    }

    /// Best-effort broadcast to every member of a room's control channel.
    pub async fn broadcast_to_room(
        &self,
        room_id: &RoomId,
        reply: Arc<ServerReply>,
        except: Option<&SessionId>,
    ) {
        let recipients: SmallVec<[SessionId; 8]> = {
            let Some(room) = self.rooms.get(room_id) else {
                return;
            };
            room.members()
                .map(|member| member.id.clone())
                .filter(|id| except != Some(id))
                .collect()
        };

        for id in recipients {
            if !self.send_to_session(&id, Arc::clone(&reply)).await {
                tracing::debug!(session_id = %id, %room_id, "Broadcast recipient unreachable");
            }
        }
    }

    /// Remove a member from a room, transferring host duty or deleting the
    /// room per lifecycle rules. The caller has already cleared the
    /// session's own `room_id`.
    pub(crate) async fn detach_from_room(&self, id: &SessionId, room_id: &RoomId) {
        let (outcome, delete_room) = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                return;
            };
            let Some(outcome) = room.try_remove(id) else {
                return;
            };
            let delete_room = outcome.room_now_empty && !room.is_active;
            (outcome, delete_room)
        };

        self.sink
            .log_room_activity(
                RoomEvent::new(room_id.clone(), RoomEventKind::Left, "player left")
                    .with_session(id.clone()),
            )
            .await;

        if let Some(new_host) = outcome.new_host {
            tracing::info!(%room_id, host_id = %new_host, "Host transferred");
            self.sink
                .log_room_activity(
                    RoomEvent::new(
                        room_id.clone(),
                        RoomEventKind::HostTransferred,
                        "host departed",
                    )
                    .with_session(new_host),
                )
                .await;
        }

        if delete_room {
            self.rooms.remove(room_id);
            tracing::info!(%room_id, "Deleted empty room");
            self.sink
                .log_room_activity(RoomEvent::new(
                    room_id.clone(),
                    RoomEventKind::Deleted,
                    "last player left lobby",
                ))
                .await;
        }
    }
}

/// Hash a password the way the account table stores it.
pub(crate) fn password_hash(password: &str) -> String {
    BASE64.encode(Sha256::digest(password.as_bytes()))
}
