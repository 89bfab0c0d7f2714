//! One live upstream connection and its receive loop.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use ratelink_common::{constants, RatelinkError, Result, SessionId};
use ratelink_fx::SharedRateCache;
use ratelink_protocol::{ConversionRequest, ConversionResponse, Frame, ProtocolError};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::connection::{Connector, FrameTransport};
use crate::handler::MessageHandler;
use crate::heartbeat::HeartbeatState;
use crate::metrics::SharedMetrics;

/// How long a session waits for its close frame to go out.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Heartbeat timing for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Pause after echoing a heartbeat.
    pub heartbeat_interval: Duration,
    /// Silence after which the session fails.
    pub heartbeat_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: constants::heartbeat_interval(),
            heartbeat_timeout: constants::heartbeat_timeout(),
        }
    }
}

impl From<&ClientConfig> for SessionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }
}

/// Collaborators shared by every session of one process.
#[derive(Clone)]
pub struct SessionContext {
    pub handler: Arc<dyn MessageHandler>,
    pub cache: SharedRateCache,
    pub metrics: SharedMetrics,
}

impl SessionContext {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        cache: SharedRateCache,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            handler,
            cache,
            metrics,
        }
    }
}

/// A live upstream connection.
///
/// Frames are handled one at a time in arrival order. The session never
/// recovers from a failure; [`run`](Self::run) returns the error that ended
/// it and the caller decides whether to reconnect.
pub struct ConnectionSession<T> {
    id: SessionId,
    transport: T,
    heartbeat: HeartbeatState,
    heartbeat_interval: Duration,
    context: SessionContext,
}

impl<T: FrameTransport> ConnectionSession<T> {
    /// Connect through `connector` and start the liveness clock.
    #[instrument(skip_all, fields(endpoint = connector.endpoint()))]
    pub async fn open<C>(
        connector: &C,
        settings: &SessionSettings,
        context: SessionContext,
    ) -> Result<Self>
    where
        C: Connector<Transport = T>,
    {
        let transport = connector.connect().await?;
        let session = Self::new(transport, settings, context);

        info!(session_id = %session.id, "Session started");
        Ok(session)
    }

    /// Wrap an already connected transport.
    pub fn new(transport: T, settings: &SessionSettings, context: SessionContext) -> Self {
        context.metrics.session_started();

        Self {
            id: SessionId::new(),
            transport,
            heartbeat: HeartbeatState::new(settings.heartbeat_timeout),
            heartbeat_interval: settings.heartbeat_interval,
            context,
        }
    }

    /// Get the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Receive and answer frames until the connection fails.
    pub async fn run(mut self) -> Result<Infallible> {
        let error = match self.receive_loop().await {
            Ok(never) => match never {},
            Err(e) => e,
        };

        info!(
            session_id = %self.id,
            code = error.error_code(),
            error = %error,
            "Session ended"
        );

        if !matches!(
            error,
            RatelinkError::ConnectionClosed | RatelinkError::ConnectionError(_)
        ) {
            match tokio::time::timeout(CLOSE_GRACE, self.transport.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session_id = %self.id, error = %e, "Close failed"),
                Err(_) => debug!(session_id = %self.id, "Close timed out"),
            }
        }

        Err(error)
    }

    async fn receive_loop(&mut self) -> Result<Infallible> {
        loop {
            let deadline = self.heartbeat.deadline();
            let text = match tokio::time::timeout_at(deadline, self.transport.recv_text()).await {
                Err(_) => return Err(self.heartbeat.expired(Instant::now())),
                Ok(received) => received?.ok_or(RatelinkError::ConnectionClosed)?,
            };

            self.context.metrics.frame_received();
            self.process(&text).await?;
        }
    }

    async fn process(&mut self, text: &str) -> Result<()> {
        match Frame::parse(text) {
            Ok(Frame::Heartbeat) => self.on_heartbeat().await,
            Ok(Frame::ConversionRequest(request)) => self.on_request(request).await,
            Ok(frame @ Frame::ConversionResponse(_)) => {
                warn!(
                    session_id = %self.id,
                    message_type = frame.message_type(),
                    "Ignoring response frame from upstream"
                );
                Ok(())
            }
            Err(e @ ProtocolError::InvalidRequest { .. }) => {
                self.context.metrics.request_failed();
                match self.context.handler.reject(&e)? {
                    Some(response) => self.send_response(response).await,
                    None => Ok(()),
                }
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Skipping unreadable frame");
                Ok(())
            }
        }
    }

    async fn on_heartbeat(&mut self) -> Result<()> {
        // Every heartbeat is answered, even one that arrives too late.
        let observed = self.heartbeat.observe(Instant::now());

        self.transport.send_text(Frame::Heartbeat.to_text()?).await?;
        self.context.metrics.heartbeat_echoed();
        debug!(session_id = %self.id, "Heartbeat echoed");

        observed?;
        tokio::time::sleep(self.heartbeat_interval).await;
        Ok(())
    }

    async fn on_request(&mut self, request: ConversionRequest) -> Result<()> {
        self.context.metrics.request_handled();
        info!(
            session_id = %self.id,
            request_id = %request.id,
            message_type = %request.message_type,
            "Dispatching request"
        );

        match self.context.handler.handle(request, &self.context.cache).await {
            Ok(Some(response)) => {
                if response.is_error() {
                    self.context.metrics.request_failed();
                }
                self.send_response(response).await
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.context.metrics.request_failed();
                Err(e)
            }
        }
    }

    async fn send_response(&mut self, response: ConversionResponse) -> Result<()> {
        let text = Frame::from(response).to_text()?;
        self.transport.send_text(text).await?;
        self.context.metrics.response_sent();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ChannelConnector, ChannelPeer};
    use crate::handler::{ConversionHandler, RequestFailurePolicy};
    use crate::metrics::Metrics;
    use ratelink_common::{Currency, CurrencyPair};
    use ratelink_fx::{MockRateFetcher, RateCache, RateCacheConfig};
    use rust_decimal_macros::dec;
    use tokio::task::JoinHandle;

    const HEARTBEAT: &str = r#"{"type":"heartbeat"}"#;
    const REQUEST: &str = r#"{"type":"message","id":456,"payload":{"marketId":123,"selectionId":456,"odds":2.2,"stake":253.67,"currency":"USD","date":"2022-03-18T12:00:00Z"}}"#;

    fn context(fetcher: Arc<MockRateFetcher>, policy: RequestFailurePolicy) -> SessionContext {
        SessionContext::new(
            Arc::new(ConversionHandler::new(Currency::eur(), policy)),
            Arc::new(RateCache::new(fetcher, RateCacheConfig::default())),
            Arc::new(Metrics::new()),
        )
    }

    fn usd_eur_fetcher() -> Arc<MockRateFetcher> {
        let fetcher = Arc::new(MockRateFetcher::new("test"));
        fetcher.set_rate(CurrencyPair::new(Currency::usd(), Currency::eur()), dec!(0.9));
        fetcher
    }

    async fn start(context: SessionContext) -> (JoinHandle<Result<Infallible>>, ChannelPeer) {
        let connector = ChannelConnector::new();
        let peer = connector.accept();
        let session = ConnectionSession::open(&connector, &SessionSettings::default(), context)
            .await
            .unwrap();

        (tokio::spawn(session.run()), peer)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_session_alive() {
        let ctx = context(usd_eur_fetcher(), RequestFailurePolicy::Reply);
        let metrics = ctx.metrics.clone();
        let (handle, mut peer) = start(ctx).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        for _ in 0..5 {
            peer.send(HEARTBEAT);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        assert!(!handle.is_finished());
        assert_eq!(peer.drain(), vec![HEARTBEAT.to_string(); 5]);
        assert_eq!(metrics.snapshot().heartbeats_echoed, 5);

        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(RatelinkError::HeartbeatTimeout {
                timeout_ms: 2000,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let ctx = context(usd_eur_fetcher(), RequestFailurePolicy::Reply);
        let (handle, _peer) = start(ctx).await;

        let result = handle.await.unwrap();

        assert_eq!(
            result.unwrap_err(),
            RatelinkError::HeartbeatTimeout {
                elapsed_ms: 2000,
                timeout_ms: 2000
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_slow_request_is_late() {
        let fetcher = Arc::new(
            MockRateFetcher::new("test").with_delay(Duration::from_secs(3)),
        );
        fetcher.set_rate(CurrencyPair::new(Currency::usd(), Currency::eur()), dec!(0.9));
        let unbounded = RateCacheConfig {
            fetch_timeout: None,
            ..Default::default()
        };
        let ctx = SessionContext::new(
            Arc::new(ConversionHandler::new(Currency::eur(), RequestFailurePolicy::Reply)),
            Arc::new(RateCache::new(fetcher, unbounded)),
            Arc::new(Metrics::new()),
        );
        let (handle, mut peer) = start(ctx).await;

        peer.send(REQUEST);
        peer.send(HEARTBEAT);

        let result = handle.await.unwrap();

        assert!(matches!(
            result,
            Err(RatelinkError::HeartbeatTimeout {
                elapsed_ms: 3000,
                ..
            })
        ));
        let sent = peer.drain();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("\"type\":\"message\""));
        assert_eq!(sent[1], HEARTBEAT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_ends_session() {
        let ctx = context(usd_eur_fetcher(), RequestFailurePolicy::Reply);
        let (handle, peer) = start(ctx).await;

        drop(peer);

        assert_eq!(
            handle.await.unwrap().unwrap_err(),
            RatelinkError::ConnectionClosed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_is_converted() {
        let ctx = context(usd_eur_fetcher(), RequestFailurePolicy::Reply);
        let metrics = ctx.metrics.clone();
        let (_handle, mut peer) = start(ctx).await;

        peer.send(REQUEST);
        settle().await;

        let sent = peer.drain();
        assert_eq!(sent.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["id"], 456);
        assert_eq!(value["payload"]["stake"], 228.3);
        assert_eq!(value["payload"]["currency"], "EUR");
        assert_eq!(value["payload"]["selectionId"], 456);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_handled, 1);
        assert_eq!(snapshot.responses_sent, 1);
        assert_eq!(snapshot.request_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_replies_and_continues() {
        let fetcher = usd_eur_fetcher();
        fetcher.set_failing(true);
        let (handle, mut peer) = start(context(fetcher, RequestFailurePolicy::Reply)).await;

        peer.send(REQUEST);
        peer.send(HEARTBEAT);
        settle().await;

        let sent = peer.drain();
        assert_eq!(sent.len(), 2);
        let error: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["id"], 456);
        assert_eq!(sent[1], HEARTBEAT);
        assert!(!handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflowing_stake_replies_and_continues() {
        let fetcher = Arc::new(MockRateFetcher::new("test"));
        fetcher.set_rate(CurrencyPair::new(Currency::usd(), Currency::jpy()), dec!(118.6));
        let ctx = SessionContext::new(
            Arc::new(ConversionHandler::new(Currency::jpy(), RequestFailurePolicy::Reply)),
            Arc::new(RateCache::new(fetcher, RateCacheConfig::default())),
            Arc::new(Metrics::new()),
        );
        let (handle, mut peer) = start(ctx).await;

        peer.send(r#"{"type":"message","id":1,"payload":{"stake":7e28,"currency":"USD","date":"2022-03-18T12:00:00Z"}}"#);
        peer.send(HEARTBEAT);
        settle().await;

        let sent = peer.drain();
        assert_eq!(sent.len(), 2);
        let error: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["id"], 1);
        assert_eq!(sent[1], HEARTBEAT);
        assert!(!handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_does_not_starve_heartbeat() {
        let fetcher = Arc::new(
            MockRateFetcher::new("test").with_delay(Duration::from_secs(600)),
        );
        fetcher.set_rate(CurrencyPair::new(Currency::usd(), Currency::eur()), dec!(0.9));
        let (handle, mut peer) = start(context(fetcher, RequestFailurePolicy::Reply)).await;

        peer.send(HEARTBEAT);
        peer.send(REQUEST);
        peer.send(HEARTBEAT);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let sent = peer.drain();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], HEARTBEAT);
        let error: serde_json::Value = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(error["type"], "error");
        assert!(error["message"].as_str().unwrap().contains("timed out after 500ms"));
        assert_eq!(sent[2], HEARTBEAT);
        assert!(!handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_under_reconnect_policy_ends_session() {
        let fetcher = usd_eur_fetcher();
        fetcher.set_failing(true);
        let (handle, mut peer) = start(context(fetcher, RequestFailurePolicy::Reconnect)).await;

        peer.send(REQUEST);

        assert!(matches!(
            handle.await.unwrap(),
            Err(RatelinkError::FetchError(_))
        ));
        assert!(peer.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_frames_are_skipped() {
        let ctx = context(usd_eur_fetcher(), RequestFailurePolicy::Reply);
        let (handle, mut peer) = start(ctx).await;

        peer.send("not json");
        peer.send(r#"{"id":1}"#);
        peer.send(r#"{"type":"message","id":9,"payload":{"stake":"abc"}}"#);
        peer.send(HEARTBEAT);
        settle().await;

        let sent = peer.drain();
        assert_eq!(sent.len(), 2);
        let rejected: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(rejected["type"], "error");
        assert_eq!(rejected["id"], 9);
        assert_eq!(sent[1], HEARTBEAT);
        assert!(!handle.is_finished());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn request(id: usize) -> String {
            format!(
                r#"{{"type":"message","id":{},"payload":{{"stake":10.5,"currency":"EUR","date":"2022-03-18T12:00:00Z"}}}}"#,
                id
            )
        }

        proptest! {
            #[test]
            fn each_heartbeat_gets_one_reply_in_order(
                heartbeats in prop::collection::vec(any::<bool>(), 1..20)
            ) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()
                    .unwrap();

                let (result, sent) = runtime.block_on(async {
                    let connector = ChannelConnector::new();
                    let ChannelPeer { to_client, mut from_client } = connector.accept();
                    for (i, is_heartbeat) in heartbeats.iter().enumerate() {
                        let text = if *is_heartbeat { HEARTBEAT.to_string() } else { request(i) };
                        to_client.send(text).unwrap();
                    }
                    drop(to_client);

                    let ctx = context(Arc::new(MockRateFetcher::new("test")), RequestFailurePolicy::Reply);
                    let session = ConnectionSession::open(&connector, &SessionSettings::default(), ctx)
                        .await
                        .unwrap();
                    let result = session.run().await;

                    let mut sent = Vec::new();
                    while let Ok(text) = from_client.try_recv() {
                        sent.push(text);
                    }
                    (result, sent)
                });

                prop_assert_eq!(result.unwrap_err(), RatelinkError::ConnectionClosed);
                prop_assert_eq!(sent.len(), heartbeats.len());
                for (i, (is_heartbeat, reply)) in heartbeats.iter().zip(&sent).enumerate() {
                    if *is_heartbeat {
                        prop_assert_eq!(reply.as_str(), HEARTBEAT);
                    } else {
                        let value: serde_json::Value = serde_json::from_str(reply).unwrap();
                        prop_assert_eq!(value["type"].as_str(), Some("message"));
                        prop_assert_eq!(value["id"].as_u64(), Some(i as u64));
                    }
                }
            }
        }
    }
}
