//! Metrics collection for client monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Client metrics.
pub struct Metrics {
    /// Sessions successfully opened.
    pub sessions_started: AtomicU64,
    /// Restarts after a failed cycle.
    pub reconnects: AtomicU64,
    /// Text frames received from upstream.
    pub frames_received: AtomicU64,
    /// Heartbeats answered.
    pub heartbeats_echoed: AtomicU64,
    /// Conversion requests dispatched to the handler.
    pub requests_handled: AtomicU64,
    /// Requests answered with an error or that ended the session.
    pub request_failures: AtomicU64,
    /// Conversion responses sent.
    pub responses_sent: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            heartbeats_echoed: AtomicU64::new(0),
            requests_handled: AtomicU64::new(0),
            request_failures: AtomicU64::new(0),
            responses_sent: AtomicU64::new(0),
        }
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_echoed(&self) {
        self.heartbeats_echoed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_handled(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.request_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_sent(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            heartbeats_echoed: self.heartbeats_echoed.load(Ordering::Relaxed),
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            request_failures: self.request_failures.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub reconnects: u64,
    pub frames_received: u64,
    pub heartbeats_echoed: u64,
    pub requests_handled: u64,
    pub request_failures: u64,
    pub responses_sent: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.frame_received();
        metrics.frame_received();
        metrics.heartbeat_echoed();
        metrics.request_handled();
        metrics.response_sent();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_received, 2);
        assert_eq!(snapshot.heartbeats_echoed, 1);
        assert_eq!(snapshot.requests_handled, 1);
        assert_eq!(snapshot.responses_sent, 1);
        assert_eq!(snapshot.reconnects, 0);
    }
}
