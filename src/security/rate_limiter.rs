use std::collections::VecDeque;

use dashmap::DashMap;
use tokio::time::{Duration, Instant};

use crate::protocol::SessionId;

/// Which traffic class a rate check applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficChannel {
    /// Control-channel JSON lines.
    Control,
    /// UDP datagrams.
    Datagram,
}

/// Sliding-window rate limiting configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Control messages allowed per window.
    pub control_per_window: u32,
    /// Datagrams allowed per window.
    pub datagrams_per_window: u32,
    /// Extra headroom on top of either limit.
    pub burst_allowance: u32,
    /// Window width.
    pub window: Duration,
    /// Clients idle longer than this are dropped by the sweeper.
    pub idle_eviction: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            control_per_window: 10,
            datagrams_per_window: 120,
            burst_allowance: 10,
            window: Duration::from_secs(1),
            idle_eviction: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct ClientRateState {
    control: VecDeque<Instant>,
    datagram: VecDeque<Instant>,
    last_seen: Instant,
}

impl ClientRateState {
    fn new() -> Self {
        Self {
            control: VecDeque::new(),
            datagram: VecDeque::new(),
            last_seen: Instant::now(),
        }
    }

    fn window_mut(&mut self, channel: TrafficChannel) -> &mut VecDeque<Instant> {
        match channel {
            TrafficChannel::Control => &mut self.control,
            TrafficChannel::Datagram => &mut self.datagram,
        }
    }
}

/// Per-client sliding-window rate limiter for both channels.
///
/// Every call records a timestamp FIFO entry, expires entries older than the
/// window, and compares the live count against the channel limit plus burst.
pub struct SlidingRateLimiter {
    config: RateLimitConfig,
    clients: DashMap<SessionId, ClientRateState>,
}

impl SlidingRateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
        }
    }

    fn limit_for(&self, channel: TrafficChannel) -> usize {
        let base = match channel {
            TrafficChannel::Control => self.config.control_per_window,
            TrafficChannel::Datagram => self.config.datagrams_per_window,
        };
        (base + self.config.burst_allowance) as usize
    }

    /// Record one message/datagram and decide whether it is within limits.
    pub fn allow(&self, client: &SessionId, channel: TrafficChannel) -> bool {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window);
        let mut state = self
            .clients
            .entry(client.clone())
            .or_insert_with(ClientRateState::new);
        state.last_seen = now;

        let window = state.window_mut(channel);
        window.push_back(now);
        if let Some(cutoff) = cutoff {
            while window.front().is_some_and(|t| *t <= cutoff) {
                window.pop_front();
            }
        }
        window.len() <= self.limit_for(channel)
    }

    /// Live count of entries inside the window for one channel.
    #[must_use]
    pub fn current_rate(&self, client: &SessionId, channel: TrafficChannel) -> usize {
        let Some(mut state) = self.clients.get_mut(client) else {
            return 0;
        };
        let cutoff = Instant::now().checked_sub(self.config.window);
        let window = state.window_mut(channel);
        if let Some(cutoff) = cutoff {
            while window.front().is_some_and(|t| *t <= cutoff) {
                window.pop_front();
            }
        }
        window.len()
    }

    /// Drop all state for a departed client.
    pub fn forget(&self, client: &SessionId) {
        self.clients.remove(client);
    }

    /// Remove state for clients idle longer than the eviction threshold.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.clients
            .retain(|_, state| now.duration_since(state.last_seen) < self.config.idle_eviction);
    }

    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
