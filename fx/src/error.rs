//! FX error types.

use ratelink_common::{Currency, Money, MoneyError, RateKey, RatelinkError};
use thiserror::Error;

/// Errors that can occur while looking up or applying a rate.
#[derive(Debug, Error)]
pub enum FxError {
    /// The source has no rate for the requested key.
    #[error("Rate not available for {0}")]
    RateNotAvailable(RateKey),

    /// The source answered with a failure.
    #[error("Rate fetch for {key} failed: {reason}")]
    FetchFailed { key: RateKey, reason: String },

    /// The source did not answer in time.
    #[error("Rate fetch for {key} timed out after {timeout_ms}ms")]
    FetchTimeout { key: RateKey, timeout_ms: u64 },

    /// The source answered with an unusable rate.
    #[error("Invalid rate {rate} for {key}")]
    InvalidRate {
        key: RateKey,
        rate: rust_decimal::Decimal,
    },

    /// HTTP transport or decoding failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Currency mismatch in conversion.
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    /// The converted amount does not fit a `Decimal`.
    #[error("Converting {amount} at rate {rate} overflows")]
    Overflow {
        amount: Money,
        rate: rust_decimal::Decimal,
    },
}

impl From<MoneyError> for FxError {
    fn from(e: MoneyError) -> Self {
        match e {
            MoneyError::CurrencyMismatch { expected, actual } => {
                FxError::CurrencyMismatch { expected, actual }
            }
            MoneyError::Overflow { amount, rate } => FxError::Overflow { amount, rate },
        }
    }
}

impl From<FxError> for RatelinkError {
    fn from(e: FxError) -> Self {
        RatelinkError::FetchError(e.to_string())
    }
}

/// Result type for FX operations.
pub type FxResult<T> = Result<T, FxError>;
