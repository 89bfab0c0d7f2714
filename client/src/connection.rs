//! Connection to the upstream server.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use ratelink_common::{as_millis_u64, constants, RatelinkError, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, trace};
use url::Url;

/// A bidirectional stream of text frames.
#[async_trait]
pub trait FrameTransport: Send {
    /// Wait for the next text frame. `None` means the peer closed the connection.
    async fn recv_text(&mut self) -> Result<Option<String>>;

    /// Send one text frame.
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Close the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports to the upstream endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: FrameTransport + 'static;

    /// Endpoint this connector dials, for logs.
    fn endpoint(&self) -> &str;

    /// Establish a new connection.
    async fn connect(&self) -> Result<Self::Transport>;
}

/// Connector for websocket endpoints (`ws://` and `wss://`).
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Create a new websocket connector.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            connect_timeout: constants::connect_timeout(),
        }
    }

    /// Bound the TCP, TLS and upgrade handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    #[instrument(skip(self), fields(endpoint = %self.url))]
    async fn connect(&self) -> Result<WsTransport> {
        let connecting = connect_async(self.url.as_str());
        let (stream, response) = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(tungstenite::Error::Url(e))) => {
                return Err(RatelinkError::ConfigurationError(format!(
                    "Unusable websocket endpoint {}: {}",
                    self.url, e
                )))
            }
            Ok(Err(e)) => return Err(RatelinkError::ConnectionError(e.to_string())),
            Err(_) => {
                return Err(RatelinkError::ConnectionError(format!(
                    "Connect timed out after {}ms",
                    as_millis_u64(self.connect_timeout)
                )))
            }
        };

        info!(status = %response.status(), "Websocket connected");

        Ok(WsTransport { stream })
    }
}

/// Live websocket connection.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn recv_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Close frame received");
                    return Ok(None);
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!(len = data.len(), "Ignoring binary frame");
                }
                // Pongs to pings are queued by tungstenite and flushed on the next read.
                Some(Ok(other)) => {
                    trace!(message = ?other, "Control frame");
                }
                Some(Err(e)) => return Err(RatelinkError::ConnectionError(e.to_string())),
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| RatelinkError::ConnectionError(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| RatelinkError::ConnectionError(e.to_string()))
    }
}

/// In-memory transport for tests.
///
/// Frames pushed through the paired [`ChannelPeer`] arrive as inbound text;
/// dropping the peer's sender looks like the upstream closing the socket.
#[cfg(any(test, feature = "test-utils"))]
pub struct ChannelTransport {
    inbound: tokio::sync::mpsc::UnboundedReceiver<String>,
    outbound: tokio::sync::mpsc::UnboundedSender<String>,
}

/// Upstream side of a [`ChannelTransport`].
#[cfg(any(test, feature = "test-utils"))]
pub struct ChannelPeer {
    /// Frames to deliver to the client.
    pub to_client: tokio::sync::mpsc::UnboundedSender<String>,
    /// Frames the client sent.
    pub from_client: tokio::sync::mpsc::UnboundedReceiver<String>,
}

#[cfg(any(test, feature = "test-utils"))]
impl ChannelTransport {
    /// Create a connected transport and peer.
    pub fn pair() -> (Self, ChannelPeer) {
        let (to_client, inbound) = tokio::sync::mpsc::unbounded_channel();
        let (outbound, from_client) = tokio::sync::mpsc::unbounded_channel();

        (
            Self { inbound, outbound },
            ChannelPeer {
                to_client,
                from_client,
            },
        )
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl ChannelPeer {
    /// Deliver a frame to the client.
    pub fn send(&self, text: impl Into<String>) {
        // The client side may already be gone; tests observe that separately.
        let _ = self.to_client.send(text.into());
    }

    /// Everything the client has sent so far.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl FrameTransport for ChannelTransport {
    async fn recv_text(&mut self) -> Result<Option<String>> {
        Ok(self.inbound.recv().await)
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| RatelinkError::ConnectionError("peer receiver dropped".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.inbound.close();
        Ok(())
    }
}

/// Connector handing out prepared [`ChannelTransport`]s and refusals in order.
///
/// Once the prepared outcomes run out every attempt fails with
/// `ConnectionError`, like an unreachable endpoint.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct ChannelConnector {
    pending: parking_lot::Mutex<std::collections::VecDeque<Result<ChannelTransport>>>,
    attempts: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-utils"))]
impl ChannelConnector {
    /// Create a connector with no prepared connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare the next connection and return its upstream side.
    pub fn accept(&self) -> ChannelPeer {
        let (transport, peer) = ChannelTransport::pair();
        self.pending.lock().push_back(Ok(transport));
        peer
    }

    /// Make the next connection attempt fail with `error`.
    pub fn refuse(&self, error: RatelinkError) {
        self.pending.lock().push_back(Err(error));
    }

    /// Number of connection attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl Connector for ChannelConnector {
    type Transport = ChannelTransport;

    fn endpoint(&self) -> &str {
        "channel://test"
    }

    async fn connect(&self) -> Result<ChannelTransport> {
        self.attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        self.pending.lock().pop_front().unwrap_or_else(|| {
            Err(RatelinkError::ConnectionError(
                "no prepared connection".to_string(),
            ))
        })
    }
}
