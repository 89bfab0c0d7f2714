//! Timing defaults for Ratelink.

use std::time::Duration;

/// Protocol timing constants.
pub mod constants {
    use super::Duration;

    /// Pause after echoing a heartbeat (1 second).
    pub fn heartbeat_interval() -> Duration {
        Duration::from_secs(1)
    }

    /// Silence after which the upstream is considered dead (2 seconds).
    pub fn heartbeat_timeout() -> Duration {
        Duration::from_secs(2)
    }

    /// How long a fetched rate stays valid (60 seconds).
    pub fn cache_ttl() -> Duration {
        Duration::from_secs(60)
    }

    /// How often expired rates are swept (10 seconds).
    pub fn cache_sweep_interval() -> Duration {
        Duration::from_secs(10)
    }

    /// Upper bound on a single external rate lookup (500 milliseconds).
    ///
    /// Together with the heartbeat interval this stays below the heartbeat
    /// timeout, so one stalled lookup cannot starve the heartbeat.
    pub fn fetch_timeout() -> Duration {
        Duration::from_millis(500)
    }

    /// Upper bound on opening the upstream connection (5 seconds).
    pub fn connect_timeout() -> Duration {
        Duration::from_secs(5)
    }

    /// Initial delay before reconnecting (1 second).
    pub fn reconnect_delay() -> Duration {
        Duration::from_secs(1)
    }

    /// Cap on the reconnect delay (30 seconds).
    pub fn max_reconnect_delay() -> Duration {
        Duration::from_secs(30)
    }
}

/// Delay before the next connection attempt.
///
/// `consecutive_failures` counts connection attempts that failed in a row;
/// zero means the previous session was established, which waits `base`.
pub fn reconnect_backoff(base: Duration, max: Duration, consecutive_failures: u32) -> Duration {
    let factor = 1u32.checked_shl(consecutive_failures.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Milliseconds in a duration, saturating at `u64::MAX`.
pub fn as_millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);

        assert_eq!(reconnect_backoff(base, max, 0), Duration::from_secs(1));
        assert_eq!(reconnect_backoff(base, max, 1), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(base, max, 3), Duration::from_secs(8));
        assert_eq!(reconnect_backoff(base, max, 5), max);
        assert_eq!(reconnect_backoff(base, max, 40), max);
    }

    #[test]
    fn test_backoff_with_zero_base() {
        let max = Duration::from_secs(30);
        assert_eq!(reconnect_backoff(Duration::ZERO, max, 7), Duration::ZERO);
    }

    #[test]
    fn test_defaults_are_consistent() {
        assert!(constants::heartbeat_interval() < constants::heartbeat_timeout());
        assert!(constants::reconnect_delay() <= constants::max_reconnect_delay());
    }
}
