//! Protocol message types.
//!
//! These types represent the frames exchanged between Ratelink and the
//! upstream server over the websocket connection.

use chrono::{DateTime, Utc};
use ratelink_common::{Currency, Money, RatelinkError, RequestId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// `type` value of a heartbeat frame.
pub const HEARTBEAT_TYPE: &str = "heartbeat";

/// `type` value of a successful conversion response.
pub const MESSAGE_TYPE: &str = "message";

/// A single upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Liveness check; answered with another heartbeat.
    Heartbeat,
    /// Anything that is not a heartbeat.
    ConversionRequest(ConversionRequest),
    /// Outbound answer to a conversion request.
    ConversionResponse(ConversionResponse),
}

impl Frame {
    /// Decode an inbound text frame.
    ///
    /// Inbound frames are either heartbeats or conversion requests; a
    /// response is never produced by parsing.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;

        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if message_type == HEARTBEAT_TYPE {
            return Ok(Frame::Heartbeat);
        }

        let id = value.get("id").cloned().map(RequestId::new);

        serde_json::from_value::<ConversionRequest>(value)
            .map(Frame::ConversionRequest)
            .map_err(|e| ProtocolError::InvalidRequest {
                id,
                message_type,
                reason: e.to_string(),
            })
    }

    /// Encode the frame as JSON text.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        let encoded = match self {
            Frame::Heartbeat => serde_json::to_string(&HeartbeatWire {
                message_type: HEARTBEAT_TYPE,
            }),
            Frame::ConversionRequest(request) => serde_json::to_string(request),
            Frame::ConversionResponse(response) => serde_json::to_string(response),
        };

        encoded.map_err(ProtocolError::Encode)
    }

    /// Check if this is a heartbeat frame.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Heartbeat)
    }

    /// The wire `type` of this frame.
    pub fn message_type(&self) -> &str {
        match self {
            Frame::Heartbeat => HEARTBEAT_TYPE,
            Frame::ConversionRequest(request) => &request.message_type,
            Frame::ConversionResponse(ConversionResponse::Message { .. }) => MESSAGE_TYPE,
            Frame::ConversionResponse(ConversionResponse::Error { .. }) => "error",
        }
    }
}

#[derive(Serialize)]
struct HeartbeatWire {
    #[serde(rename = "type")]
    message_type: &'static str,
}

/// Conversion request received from upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    /// Message type identifier (anything but `heartbeat`).
    #[serde(rename = "type")]
    pub message_type: String,
    /// Request id, echoed in the response.
    pub id: RequestId,
    /// What to convert.
    pub payload: ConversionPayload,
}

impl ConversionRequest {
    /// Create a new conversion request of type `message`.
    pub fn new(id: impl Into<RequestId>, payload: ConversionPayload) -> Self {
        Self {
            message_type: MESSAGE_TYPE.to_string(),
            id: id.into(),
            payload,
        }
    }
}

/// Body of a conversion request or response.
///
/// Only `stake`, `currency` and `date` are interpreted; every other field is
/// carried through to the response untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionPayload {
    /// Amount to convert.
    #[serde(with = "rust_decimal::serde::float")]
    pub stake: Decimal,
    /// Currency of `stake`.
    pub currency: Currency,
    /// Value date; selects which day's rate applies.
    pub date: DateTime<Utc>,
    /// Opaque fields passed through verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConversionPayload {
    /// Create a payload without pass-through fields.
    pub fn new(stake: Decimal, currency: Currency, date: DateTime<Utc>) -> Self {
        Self {
            stake,
            currency,
            date,
            extra: Map::new(),
        }
    }

    /// Add a pass-through field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// The stake as money.
    pub fn money(&self) -> Money {
        Money::new(self.stake, self.currency.clone())
    }

    /// Same payload with the stake replaced by `converted`.
    pub fn with_money(&self, converted: Money) -> Self {
        Self {
            stake: converted.value,
            currency: converted.currency,
            date: self.date,
            extra: self.extra.clone(),
        }
    }
}

/// Response sent back for a conversion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConversionResponse {
    /// Converted payload.
    Message { id: RequestId, payload: ConversionPayload },
    /// The request could not be served.
    Error { id: RequestId, message: String },
}

impl ConversionResponse {
    /// Successful conversion.
    pub fn converted(id: RequestId, payload: ConversionPayload) -> Self {
        ConversionResponse::Message { id, payload }
    }

    /// Failed conversion, formatted the way upstream expects.
    pub fn error(id: RequestId, reason: impl std::fmt::Display) -> Self {
        ConversionResponse::Error {
            id,
            message: format!("Unable to convert stake. Error: {}", reason),
        }
    }

    /// Request id this response answers.
    pub fn id(&self) -> &RequestId {
        match self {
            ConversionResponse::Message { id, .. } => id,
            ConversionResponse::Error { id, .. } => id,
        }
    }

    /// Check if this is an error response.
    pub fn is_error(&self) -> bool {
        matches!(self, ConversionResponse::Error { .. })
    }
}

impl From<ConversionResponse> for Frame {
    fn from(response: ConversionResponse) -> Self {
        Frame::ConversionResponse(response)
    }
}

/// Errors decoding or encoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Text is not JSON.
    #[error("Frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    /// JSON object without a string `type`.
    #[error("Frame has no string `type` field")]
    MissingType,

    /// A non-heartbeat frame that does not decode as a conversion request.
    #[error("Invalid {message_type} request: {reason}")]
    InvalidRequest {
        id: Option<RequestId>,
        message_type: String,
        reason: String,
    },

    /// Serialization failed.
    #[error("Failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// Id of the offending request, when one could be read.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            ProtocolError::InvalidRequest { id, .. } => id.as_ref(),
            _ => None,
        }
    }
}

impl From<ProtocolError> for RatelinkError {
    fn from(e: ProtocolError) -> Self {
        RatelinkError::ProtocolError(e.to_string())
    }
}
