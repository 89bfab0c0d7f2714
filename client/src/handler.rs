//! Handling of conversion requests from upstream.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use ratelink_common::{Currency, RatelinkError, Result};
use ratelink_fx::{Conversion, RateCache};
use ratelink_protocol::{ConversionRequest, ConversionResponse, ProtocolError};
use tracing::{info, warn};

/// What a request that cannot be served does to the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestFailurePolicy {
    /// Answer with an `error` frame and keep the connection.
    #[default]
    Reply,
    /// Fail the session so the supervisor reconnects.
    Reconnect,
}

impl FromStr for RequestFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reply" => Ok(RequestFailurePolicy::Reply),
            "reconnect" => Ok(RequestFailurePolicy::Reconnect),
            other => Err(format!("unknown request failure policy: {}", other)),
        }
    }
}

impl fmt::Display for RequestFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestFailurePolicy::Reply => write!(f, "reply"),
            RequestFailurePolicy::Reconnect => write!(f, "reconnect"),
        }
    }
}

/// Trait for answering non-heartbeat frames.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a decoded request. `Ok(None)` sends nothing back; an error
    /// ends the session.
    async fn handle(
        &self,
        request: ConversionRequest,
        cache: &RateCache,
    ) -> Result<Option<ConversionResponse>>;

    /// Handle a request that failed to decode.
    fn reject(&self, error: &ProtocolError) -> Result<Option<ConversionResponse>> {
        Ok(error
            .request_id()
            .map(|id| ConversionResponse::error(id.clone(), error)))
    }
}

/// Converts the stake of each request into the target currency.
pub struct ConversionHandler {
    target: Currency,
    policy: RequestFailurePolicy,
}

impl ConversionHandler {
    /// Create a new conversion handler.
    pub fn new(target: Currency, policy: RequestFailurePolicy) -> Self {
        Self { target, policy }
    }

    fn fail(
        &self,
        request: &ConversionRequest,
        error: RatelinkError,
        reason: String,
    ) -> Result<Option<ConversionResponse>> {
        match self.policy {
            RequestFailurePolicy::Reply => {
                warn!(request_id = %request.id, error = %reason, "Conversion failed");
                Ok(Some(ConversionResponse::error(request.id.clone(), reason)))
            }
            RequestFailurePolicy::Reconnect => Err(error),
        }
    }
}

#[async_trait]
impl MessageHandler for ConversionHandler {
    async fn handle(
        &self,
        request: ConversionRequest,
        cache: &RateCache,
    ) -> Result<Option<ConversionResponse>> {
        let stake = request.payload.money();
        if !stake.currency.is_valid() {
            let reason = format!("Invalid currency {}", stake.currency);
            return self.fail(&request, RatelinkError::ProtocolError(reason.clone()), reason);
        }

        let date = request.payload.date.date_naive();
        match Conversion::execute(cache, stake, self.target.clone(), date).await {
            Ok(conversion) => {
                info!(
                    request_id = %request.id,
                    input = %conversion.input,
                    output = %conversion.output,
                    rate = %conversion.rate,
                    "Stake converted"
                );
                let payload = request.payload.with_money(conversion.output);
                Ok(Some(ConversionResponse::converted(request.id, payload)))
            }
            Err(e) => {
                let reason = e.to_string();
                self.fail(&request, e.into(), reason)
            }
        }
    }

    fn reject(&self, error: &ProtocolError) -> Result<Option<ConversionResponse>> {
        match (self.policy, error.request_id()) {
            (RequestFailurePolicy::Reply, Some(id)) => {
                warn!(request_id = %id, error = %error, "Rejecting undecodable request");
                Ok(Some(ConversionResponse::error(id.clone(), error)))
            }
            (RequestFailurePolicy::Reply, None) => Ok(None),
            (RequestFailurePolicy::Reconnect, _) => Err(RatelinkError::ProtocolError(error.to_string())),
        }
    }
}
