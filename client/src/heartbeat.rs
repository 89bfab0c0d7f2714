//! Heartbeat liveness tracking for one upstream session.

use std::time::Duration;

use ratelink_common::{as_millis_u64, RatelinkError, Result};
use tokio::time::Instant;

/// When the upstream was last heard from.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatState {
    last_seen: Instant,
    timeout: Duration,
}

impl HeartbeatState {
    /// Start tracking at connection establishment.
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: Instant::now(),
            timeout,
        }
    }

    /// Last time a heartbeat arrived, or the connection time.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Point after which the session is considered dead.
    pub fn deadline(&self) -> Instant {
        self.last_seen + self.timeout
    }

    /// Record a heartbeat arriving at `now`.
    ///
    /// The gap is measured from the previous heartbeat, so a heartbeat that
    /// arrives too late still fails the session instead of reviving it.
    pub fn observe(&mut self, now: Instant) -> Result<()> {
        let elapsed = now.saturating_duration_since(self.last_seen);
        if elapsed >= self.timeout {
            return Err(self.timeout_error(elapsed));
        }

        self.last_seen = now;
        Ok(())
    }

    /// Error for a deadline that passed with nothing received.
    pub fn expired(&self, now: Instant) -> RatelinkError {
        self.timeout_error(now.saturating_duration_since(self.last_seen))
    }

    fn timeout_error(&self, elapsed: Duration) -> RatelinkError {
        RatelinkError::HeartbeatTimeout {
            elapsed_ms: as_millis_u64(elapsed),
            timeout_ms: as_millis_u64(self.timeout),
        }
    }
}
