//! Heartbeat management for streaming channels.
//!
//! Both channels expect a text `"ping"` at a fixed interval and may answer
//! with a text `"pong"`. The transport's own close detection decides
//! connectivity; the heartbeat only keeps the socket warm and logs the
//! round trip.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// Liveness frame sent by the client.
pub const PING_FRAME: &str = "ping";
/// Liveness reply sent by the server.
pub const PONG_FRAME: &str = "pong";

/// Whether a text frame is a liveness reply.
#[must_use]
pub fn is_pong(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case(PONG_FRAME)
}

/// Heartbeat timing for one channel.
#[derive(Debug)]
pub struct HeartbeatManager {
    interval_ms: u64,
    last_ping: RwLock<Option<DateTime<Utc>>>,
}

impl HeartbeatManager {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_ping: RwLock::new(None),
        }
    }

    /// Reset heartbeat state (called on connection).
    pub fn reset(&self) {
        *self.last_ping.write() = None;
    }

    /// Ticker for one connection. The first tick fires one full interval
    /// after connect, not immediately.
    pub fn ticker(&self) -> Interval {
        let period = Duration::from_millis(self.interval_ms.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    pub fn record_ping(&self) {
        *self.last_ping.write() = Some(Utc::now());
    }

    /// Round trip in milliseconds since the last ping, if one was sent on
    /// this connection.
    pub fn record_pong(&self) -> Option<i64> {
        let ping_time = (*self.last_ping.read())?;
        let rtt_ms = (Utc::now() - ping_time).num_milliseconds();
        debug!(rtt_ms, "Received pong");
        Some(rtt_ms)
    }
}
