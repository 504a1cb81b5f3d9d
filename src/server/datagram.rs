use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use smallvec::SmallVec;
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant};

use crate::protocol::{InputPacket, SessionId, UpdatePacket};
use crate::security::{DatagramCipher, DatagramVerdict, ValidatedPacket};

use super::RaceServer;

/// Receive loop for the shared datagram socket. One packet is processed to
/// completion before the next is read, preserving per-sender ordering.
pub(crate) async fn run_datagram_loop(server: Arc<RaceServer>, socket: Arc<UdpSocket>) {
    let cancel = server.shutdown_token();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    server.handle_datagram(&socket, &buf[..len], peer).await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Datagram receive failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

/// A decoded inbound datagram attributed to a session.
struct InboundDatagram {
    origin: SessionId,
    payload: Value,
    encrypted: bool,
}

impl RaceServer {
    /// Full ingest pipeline for one datagram: decode (trial decryption or
    /// legacy plaintext), attribute, screen, and dispatch. Failures are
    /// dropped silently on the wire and surface only as security events.
    pub async fn handle_datagram(&self, socket: &UdpSocket, data: &[u8], peer: SocketAddr) {
        let Some(inbound) = self.decode_datagram(data) else {
            tracing::trace!(%peer, bytes = data.len(), "Undecodable datagram dropped");
            return;
        };

        if inbound.encrypted {
            // The embedded claim must agree with the cipher that decoded it.
            let claimed = inbound
                .payload
                .get("sessionId")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if claimed != inbound.origin.as_str() {
                self.security()
                    .record_spoof(
                        &inbound.origin,
                        format!("datagram claims sessionId {claimed:?}"),
                    )
                    .await;
                return;
            }
        }

        self.note_datagram_endpoint(&inbound.origin, peer);

        match self
            .security()
            .screen_datagram(&inbound.origin, &inbound.payload)
            .await
        {
            DatagramVerdict::Reject { kick: true } => {
                tracing::warn!(session_id = %inbound.origin, "Kicking session after repeated violations");
                self.kick_session(&inbound.origin).await;
            }
            DatagramVerdict::Reject { kick: false } => {}
            DatagramVerdict::Accept(ValidatedPacket::Update(packet)) => {
                self.relay_update(socket, &inbound.origin, &packet, &inbound.payload, peer)
                    .await;
            }
            DatagramVerdict::Accept(ValidatedPacket::Input(packet)) => {
                self.relay_input(socket, &inbound.origin, &packet, &inbound.payload)
                    .await;
            }
        }
    }

    /// Identify the sender and recover the JSON payload.
    ///
    /// Length-prefixed packets are tried against every authenticated
    /// session's cipher; the first decryption yielding valid JSON wins.
    /// Everything else takes the legacy plaintext path, keyed by the
    /// embedded `sessionId`.
    fn decode_datagram(&self, data: &[u8]) -> Option<InboundDatagram> {
        if DatagramCipher::looks_encrypted(data) {
            let candidates: SmallVec<[(SessionId, Arc<DatagramCipher>); 8]> = self
                .sessions
                .iter()
                .filter_map(|entry| {
                    entry
                        .value()
                        .cipher
                        .clone()
                        .map(|cipher| (entry.key().clone(), cipher))
                })
                .collect();

            for (session_id, cipher) in candidates {
                if let Ok(payload) = cipher.decrypt_value(data) {
                    return Some(InboundDatagram {
                        origin: session_id,
                        payload,
                        encrypted: true,
                    });
                }
            }
        }

        // Legacy plaintext path (optionally LF-terminated).
        let text = std::str::from_utf8(data).ok()?;
        let payload: Value = serde_json::from_str(text.trim_end()).ok()?;
        let claimed = payload.get("sessionId").and_then(Value::as_str)?;
        let origin = SessionId::from(claimed);
        if !self.sessions.contains_key(&origin) {
            return None;
        }
        Some(InboundDatagram {
            origin,
            payload,
            encrypted: false,
        })
    }

    /// Record the sender's datagram endpoint and refresh its liveness.
    fn note_datagram_endpoint(&self, id: &SessionId, peer: SocketAddr) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.udp_addr = Some(peer);
            entry.last_activity = Instant::now();
        }
    }

    /// Apply a position update to the sender's room and fan it out to the
    /// other members.
    async fn relay_update(
        &self,
        socket: &UdpSocket,
        origin: &SessionId,
        packet: &UpdatePacket,
        payload: &Value,
        peer: SocketAddr,
    ) {
        let Some(room_id) = self.session_room(origin) else {
            tracing::trace!(session_id = %origin, "UPDATE from session outside any room");
            return;
        };

        let recipients = {
            let Some(mut room) = self.rooms.get_mut(&room_id) else {
                return;
            };
            if !room.update_position(origin, packet.position, packet.rotation, Some(peer)) {
                return;
            }
            collect_other_members(&room, origin)
        };

        self.fan_out(socket, &recipients, payload).await;
    }

    /// Forward an input packet to the other members of its target room.
    async fn relay_input(
        &self,
        socket: &UdpSocket,
        origin: &SessionId,
        packet: &InputPacket,
        payload: &Value,
    ) {
        let recipients = {
            let Some(room) = self.rooms.get(&packet.room_id) else {
                tracing::trace!(session_id = %origin, room_id = %packet.room_id, "INPUT for unknown room");
                return;
            };
            if !room.contains(origin) {
                tracing::trace!(session_id = %origin, room_id = %packet.room_id, "INPUT from non-member");
                return;
            }
            collect_other_members(&room, origin)
        };

        self.fan_out(socket, &recipients, payload).await;
    }

    /// Re-encrypt the payload per recipient and send it to each learned
    /// endpoint. Recipients without a known endpoint are skipped; sends are
    /// best-effort.
    async fn fan_out(&self, socket: &UdpSocket, recipients: &[SessionId], payload: &Value) {
        if recipients.is_empty() {
            return;
        }
        let plaintext = Bytes::from(payload.to_string());

        let targets: SmallVec<[(SocketAddr, Option<Arc<DatagramCipher>>); 8]> = recipients
            .iter()
            .filter_map(|id| {
                let entry = self.sessions.get(id)?;
                let addr = entry.udp_addr?;
                Some((addr, entry.cipher.clone()))
            })
            .collect();

        for (addr, cipher) in targets {
            let wire = match &cipher {
                Some(cipher) => cipher.encrypt(&plaintext),
                None => plaintext.to_vec(),
            };
            if let Err(err) = socket.send_to(&wire, addr).await {
                tracing::trace!(%addr, error = %err, "Datagram send failed");
            }
        }
    }
}

fn collect_other_members(
    room: &super::room::Room,
    origin: &SessionId,
) -> SmallVec<[SessionId; 8]> {
    room.members()
        .map(|member| member.id.clone())
        .filter(|id| id != origin)
        .collect()
}
