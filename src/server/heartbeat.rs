use std::sync::Arc;

use tokio::time::Instant;

use crate::protocol::SessionId;

use super::{DisconnectReason, RaceServer};

/// Periodically reap sessions whose last activity is older than the idle
/// timeout. Runs until the server shuts down.
pub(crate) async fn run_heartbeat(server: Arc<RaceServer>) {
    let cancel = server.shutdown_token();
    let mut interval = tokio::time::interval(server.config().heartbeat_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                for id in server.collect_idle_sessions() {
                    tracing::info!(session_id = %id, "Disconnecting idle session");
                    server.remove_session(&id, DisconnectReason::IdleTimeout).await;
                }
            }
        }
    }
}

impl RaceServer {
    /// Sessions whose last activity exceeds the idle timeout. Collected
    /// before acting so no map guard is held across the removals.
    pub(crate) fn collect_idle_sessions(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let timeout = self.config.idle_timeout;
        self.sessions
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_activity) > timeout)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use tokio::time::Duration;

    use crate::events::NullEventSink;
    use crate::server::{RaceServer, ServerConfig};

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_collected_after_timeout() {
        let server = RaceServer::new(ServerConfig::default(), Arc::new(NullEventSink));
        let (sender, _inbox) = mpsc::channel(4);
        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let id = server.register_session(sender, addr).await;

        assert!(server.collect_idle_sessions().is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(server.collect_idle_sessions(), vec![id.clone()]);

        // Activity resets the clock.
        server.touch_activity(&id);
        assert!(server.collect_idle_sessions().is_empty());
    }
}
