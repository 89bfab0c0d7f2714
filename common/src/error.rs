//! Error types for Ratelink.

use thiserror::Error;

/// Main error type for Ratelink operations.
///
/// Every variant ends the current upstream session; the supervisor decides
/// how long to wait before reconnecting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RatelinkError {
    /// Transport could not be established or broke while in use.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// No heartbeat observed within the configured window.
    #[error("No heartbeat for {elapsed_ms}ms (timeout {timeout_ms}ms)")]
    HeartbeatTimeout { elapsed_ms: u64, timeout_ms: u64 },

    /// External rate lookup failed.
    #[error("Rate fetch failed: {0}")]
    FetchError(String),

    /// Frame could not be decoded or encoded.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl RatelinkError {
    /// Check if reconnecting can be expected to help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RatelinkError::ConfigurationError(_))
    }

    /// Get a stable error code for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            RatelinkError::ConnectionError(_) => "CONNECTION_ERROR",
            RatelinkError::ConnectionClosed => "CONNECTION_CLOSED",
            RatelinkError::HeartbeatTimeout { .. } => "HEARTBEAT_TIMEOUT",
            RatelinkError::FetchError(_) => "FETCH_ERROR",
            RatelinkError::ProtocolError(_) => "PROTOCOL_ERROR",
            RatelinkError::ConfigurationError(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result type alias for Ratelink operations.
pub type Result<T> = std::result::Result<T, RatelinkError>;
