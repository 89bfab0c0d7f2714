//! Supervision of the upstream session and the cache sweep.

use std::time::Duration;

use parking_lot::RwLock;
use ratelink_common::{as_millis_u64, reconnect_backoff, RatelinkError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ClientConfig;
use crate::connection::Connector;
use crate::session::{ConnectionSession, SessionContext, SessionSettings};

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Session and cache sweep are active.
    Running,
    /// The last cycle failed; waiting to start a new one.
    Recovering,
}

/// How one supervision cycle ended.
#[derive(Debug)]
enum CycleEnd {
    /// The connection could not be established.
    ConnectFailed(RatelinkError),
    /// An established session failed.
    SessionEnded(RatelinkError),
}

/// Keeps one upstream session and the cache sweep running.
///
/// Each cycle opens a session and races it against the sweep loop. When
/// the session fails the sweep is dropped with it, and after a delay both
/// start again. The cache itself is shared across cycles. Only the shutdown
/// token ends [`run`](Self::run).
pub struct Supervisor<C> {
    connector: C,
    settings: SessionSettings,
    context: SessionContext,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    state: RwLock<SupervisorState>,
    shutdown: CancellationToken,
}

impl<C: Connector> Supervisor<C> {
    /// Create a new supervisor.
    pub fn new(connector: C, config: &ClientConfig, context: SessionContext) -> Self {
        Self {
            connector,
            settings: SessionSettings::from(config),
            context,
            reconnect_delay: config.reconnect_delay,
            max_reconnect_delay: config.max_reconnect_delay,
            state: RwLock::new(SupervisorState::Recovering),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the current state.
    pub fn state(&self) -> SupervisorState {
        *self.state.read()
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run cycles until shutdown.
    pub async fn run(&self) {
        let mut consecutive_failures: u32 = 0;

        loop {
            self.set_state(SupervisorState::Running);

            let end = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                end = self.run_cycle() => end,
            };

            self.set_state(SupervisorState::Recovering);
            self.context.metrics.reconnect();

            let error = match end {
                CycleEnd::ConnectFailed(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    e
                }
                CycleEnd::SessionEnded(e) => {
                    consecutive_failures = 0;
                    e
                }
            };
            log_failure(&error, consecutive_failures);

            // Errors a reconnect cannot fix wait the longest delay.
            let delay = if error.is_retryable() {
                reconnect_backoff(
                    self.reconnect_delay,
                    self.max_reconnect_delay,
                    consecutive_failures,
                )
            } else {
                self.max_reconnect_delay
            };
            info!(
                delay_ms = as_millis_u64(delay),
                cached_rates = self.context.cache.len(),
                "Reconnecting after delay"
            );

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Supervisor stopped");
    }

    async fn run_cycle(&self) -> CycleEnd {
        let session = async {
            let opened =
                ConnectionSession::open(&self.connector, &self.settings, self.context.clone()).await;
            match opened {
                Err(e) => CycleEnd::ConnectFailed(e),
                Ok(session) => match session.run().await {
                    Ok(never) => match never {},
                    Err(e) => CycleEnd::SessionEnded(e),
                },
            }
        };

        tokio::select! {
            end = session => end,
            never = self.context.cache.run_sweep_loop() => match never {},
        }
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            info!(from = ?previous, to = ?state, "Supervisor state changed");
        }
    }
}

fn log_failure(error: &RatelinkError, consecutive_failures: u32) {
    match error {
        RatelinkError::HeartbeatTimeout {
            elapsed_ms,
            timeout_ms,
        } => warn!(elapsed_ms, timeout_ms, "Upstream went silent"),
        RatelinkError::ConnectionClosed => info!("Upstream closed the connection"),
        RatelinkError::ConnectionError(reason) => {
            warn!(reason = %reason, consecutive_failures, "Connection failed")
        }
        RatelinkError::FetchError(reason) => {
            warn!(reason = %reason, "Rate fetch ended the session")
        }
        RatelinkError::ProtocolError(reason) => {
            warn!(reason = %reason, "Protocol error ended the session")
        }
        RatelinkError::ConfigurationError(reason) => {
            error!(reason = %reason, "Configuration error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnector;
    use crate::handler::{ConversionHandler, RequestFailurePolicy};
    use crate::metrics::Metrics;
    use chrono::NaiveDate;
    use ratelink_common::{Currency, CurrencyPair, RateKey};
    use ratelink_fx::{MockRateFetcher, RateCache, RateCacheConfig};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn supervisor(connector: ChannelConnector) -> Arc<Supervisor<ChannelConnector>> {
        let context = SessionContext::new(
            Arc::new(ConversionHandler::new(Currency::eur(), RequestFailurePolicy::Reply)),
            Arc::new(RateCache::new(
                Arc::new(MockRateFetcher::new("test")),
                RateCacheConfig::default(),
            )),
            Arc::new(Metrics::new()),
        );
        Arc::new(Supervisor::new(connector, &ClientConfig::default(), context))
    }

    fn spawn(supervisor: &Arc<Supervisor<ChannelConnector>>) -> tokio::task::JoinHandle<()> {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run().await })
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_once_after_heartbeat_timeout() {
        let connector = ChannelConnector::new();
        let _first = connector.accept();
        let _second = connector.accept();
        let supervisor = supervisor(connector);
        let handle = spawn(&supervisor);

        // Timeout at 2s, reconnect after the 1s delay.
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(supervisor.connector.attempts(), 2);
        assert_eq!(supervisor.state(), SupervisorState::Running);
        let snapshot = supervisor.context.metrics.snapshot();
        assert_eq!(snapshot.sessions_started, 2);
        assert_eq!(snapshot.reconnects, 1);

        supervisor.shutdown_token().cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_restarts_and_keeps_cache() {
        let connector = ChannelConnector::new();
        let first = connector.accept();
        let _second = connector.accept();
        let supervisor = supervisor(connector);
        let key = RateKey::new(
            CurrencyPair::new(Currency::usd(), Currency::eur()),
            NaiveDate::from_ymd_opt(2022, 3, 18).unwrap(),
        );
        supervisor.context.cache.insert(key.clone(), dec!(0.90));
        let handle = spawn(&supervisor);

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.state(), SupervisorState::Recovering);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(supervisor.state(), SupervisorState::Running);
        assert_eq!(supervisor.connector.attempts(), 2);
        assert_eq!(supervisor.context.cache.peek(&key), Some(dec!(0.90)));

        supervisor.shutdown_token().cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_back_off() {
        let supervisor = supervisor(ChannelConnector::new());
        let handle = spawn(&supervisor);

        // Attempts at 0s, 2s, 6s and 14s.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(supervisor.connector.attempts(), 3);
        assert_eq!(supervisor.state(), SupervisorState::Recovering);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(supervisor.connector.attempts(), 4);

        supervisor.shutdown_token().cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_error_waits_longest_delay() {
        let connector = ChannelConnector::new();
        connector.refuse(RatelinkError::ConfigurationError("bad endpoint".to_string()));
        let _peer = connector.accept();
        let supervisor = supervisor(connector);
        let handle = spawn(&supervisor);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(supervisor.connector.attempts(), 1);
        assert_eq!(supervisor.state(), SupervisorState::Recovering);

        // Default maximum delay is 30s.
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(supervisor.connector.attempts(), 2);
        assert_eq!(supervisor.state(), SupervisorState::Running);

        supervisor.shutdown_token().cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_running_cycle() {
        let connector = ChannelConnector::new();
        let peer = connector.accept();
        let supervisor = supervisor(connector);
        let handle = spawn(&supervisor);

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.shutdown_token().cancel();
        handle.await.unwrap();

        // The session was dropped with the cycle.
        assert!(peer.to_client.is_closed());
    }
}
