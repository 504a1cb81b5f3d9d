use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_rustls::server::TlsStream;

use crate::protocol::ServerReply;

use super::{DisconnectReason, RaceServer};

/// How long session teardown waits for the writer to flush queued replies.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Own one accepted control-channel connection: greeting, LF-framed JSON
/// reads, sequential dispatch, and an outbound writer task fed by the
/// session's registry channel.
pub(crate) async fn run_session(
    server: Arc<RaceServer>,
    stream: TlsStream<TcpStream>,
    peer: SocketAddr,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (sender, mut outbound) =
        mpsc::channel::<Arc<ServerReply>>(server.config().session_buffer);

    let session_id = server.register_session(sender, peer).await;
    let Some(cancel) = server.session_cancel(&session_id) else {
        return;
    };

    // The greeting is the one non-JSON line of the protocol.
    let greeting = format!("CONNECTED|{session_id}\n");
    if write_half.write_all(greeting.as_bytes()).await.is_err() {
        server
            .remove_session(&session_id, DisconnectReason::SocketError)
            .await;
        return;
    }

    // Writer: drains the outbound queue until every sender is dropped, which
    // happens when the session leaves the registry. A write failure cancels
    // the whole session.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        while let Some(reply) = outbound.recv().await {
            let mut line = match serde_json::to_vec(reply.as_ref()) {
                Ok(line) => line,
                Err(err) => {
                    tracing::error!(error = %err, "Failed to encode control reply");
                    continue;
                }
            };
            line.push(b'\n');
            if write_half.write_all(&line).await.is_err() {
                writer_cancel.cancel();
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut reader = BufReader::new(read_half);
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let max_line = server.config().max_line_length;

    let reason = loop {
        buf.clear();
        let read = tokio::select! {
            () = cancel.cancelled() => break DisconnectReason::ClientClosed,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break DisconnectReason::ClientClosed,
            Ok(_) => {
                if buf.len() > max_line {
                    tracing::warn!(session_id = %session_id, bytes = buf.len(), "Oversized control line");
                    break DisconnectReason::SocketError;
                }
                let Ok(text) = std::str::from_utf8(&buf) else {
                    let _ = server
                        .send_to_session(
                            &session_id,
                            Arc::new(ServerReply::error("Invalid JSON format")),
                        )
                        .await;
                    continue;
                };
                // Lone CRs are ignored; blank lines are not commands.
                let line = text.trim_matches(&['\r', '\n', ' ', '\t'][..]);
                if line.is_empty() {
                    continue;
                }

                let outcome = server.handle_line(&session_id, line).await;
                if let Some(reply) = outcome.reply {
                    server.send_to_session(&session_id, Arc::new(reply)).await;
                }
                if outcome.close {
                    break DisconnectReason::ClientClosed;
                }
            }
            Err(err) => {
                tracing::debug!(session_id = %session_id, error = %err, "Control read failed");
                break DisconnectReason::SocketError;
            }
        }
    };

    // Dropping the registry entry drops the last queue sender, letting the
    // writer flush whatever is already queued (BYE_OK included) and exit.
    server.remove_session(&session_id, reason).await;
    let mut writer = writer;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        tracing::debug!(session_id = %session_id, "Writer did not drain in time");
        writer.abort();
    }
}
