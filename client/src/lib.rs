//! Ratelink Client Library
//!
//! Keeps one websocket connection to the upstream server alive, answers
//! its heartbeats and converts the stakes of incoming requests into the
//! target currency using cached exchange rates.

pub mod config;
pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod metrics;
pub mod session;
pub mod supervisor;

pub use config::ClientConfig;
pub use connection::{Connector, FrameTransport, WsConnector, WsTransport};
#[cfg(any(test, feature = "test-utils"))]
pub use connection::{ChannelConnector, ChannelPeer, ChannelTransport};
pub use handler::{ConversionHandler, MessageHandler, RequestFailurePolicy};
pub use heartbeat::HeartbeatState;
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use session::{ConnectionSession, SessionContext, SessionSettings};
pub use supervisor::{Supervisor, SupervisorState};
