//! Rate fetcher trait and implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use ratelink_common::RateKey;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{FxError, FxResult};

/// Source of exchange rates consulted on a cache miss.
#[async_trait]
pub trait RateFetcher: Send + Sync {
    /// Get the fetcher name.
    fn name(&self) -> &str;

    /// Get the rate converting one unit of `key.pair.base` into `key.pair.quote`
    /// on `key.date`.
    async fn fetch_rate(&self, key: &RateKey) -> FxResult<Decimal>;
}

/// Fetches historical rates from an exchangerate.host style HTTP API.
///
/// Issues `GET {base_url}/{date}?base={BASE}&symbols={QUOTE}` and reads
/// `rates.{QUOTE}` from the JSON body.
pub struct HttpRateFetcher {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    rates: HashMap<String, Decimal>,
    #[serde(default)]
    error: Option<ApiError>,
}

// Error bodies differ between API versions.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiError {
    Text(String),
    Detailed {
        info: Option<String>,
        code: Option<i64>,
    },
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Text(text) => write!(f, "{}", text),
            ApiError::Detailed { info: Some(info), .. } => write!(f, "{}", info),
            ApiError::Detailed { code: Some(code), .. } => write!(f, "error code {}", code),
            ApiError::Detailed { .. } => write!(f, "unspecified error"),
        }
    }
}

impl HttpRateFetcher {
    /// Create a new fetcher for the API rooted at `base_url`.
    pub fn new(base_url: Url) -> FxResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ratelink/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key: None,
        })
    }

    /// Send `access_key` with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn request_url(&self, key: &RateKey) -> FxResult<Url> {
        let mut url = self.base_url.clone();

        url.path_segments_mut()
            .map_err(|_| FxError::FetchFailed {
                key: key.clone(),
                reason: format!("rate API URL {} cannot be a base", self.base_url),
            })?
            .pop_if_empty()
            .push(&key.date.format("%Y-%m-%d").to_string());

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("base", key.pair.base.code())
                .append_pair("symbols", key.pair.quote.code());
            if let Some(api_key) = &self.api_key {
                query.append_pair("access_key", api_key);
            }
        }

        Ok(url)
    }
}

#[async_trait]
impl RateFetcher for HttpRateFetcher {
    fn name(&self) -> &str {
        "HTTP"
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn fetch_rate(&self, key: &RateKey) -> FxResult<Decimal> {
        let url = self.request_url(key)?;
        debug!(host = url.host_str().unwrap_or_default(), "Requesting rate");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FxError::FetchFailed {
                key: key.clone(),
                reason: format!("HTTP status {}", status),
            });
        }

        let body: RatesResponse = response.json().await?;
        if body.success == Some(false) {
            return Err(FxError::FetchFailed {
                key: key.clone(),
                reason: body
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "API reported failure".to_string()),
            });
        }

        let rate = body
            .rates
            .get(key.pair.quote.code())
            .copied()
            .ok_or_else(|| FxError::RateNotAvailable(key.clone()))?;

        if rate <= Decimal::ZERO {
            return Err(FxError::InvalidRate {
                key: key.clone(),
                rate,
            });
        }

        debug!(rate = %rate, "Got rate");
        Ok(rate)
    }
}

/// Mock rate fetcher for testing.
#[cfg(any(test, feature = "test-utils"))]
pub struct MockRateFetcher {
    name: String,
    rates: dashmap::DashMap<ratelink_common::CurrencyPair, Decimal>,
    calls: std::sync::atomic::AtomicUsize,
    failing: std::sync::atomic::AtomicBool,
    delay: std::time::Duration,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockRateFetcher {
    /// Create a new mock fetcher.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rates: dashmap::DashMap::new(),
            calls: std::sync::atomic::AtomicUsize::new(0),
            failing: std::sync::atomic::AtomicBool::new(false),
            delay: std::time::Duration::ZERO,
        }
    }

    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the rate for a currency pair, regardless of date.
    pub fn set_rate(&self, pair: ratelink_common::CurrencyPair, rate: Decimal) {
        self.rates.insert(pair, rate);
    }

    /// Make every subsequent fetch fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of fetches started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl RateFetcher for MockRateFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_rate(&self, key: &RateKey) -> FxResult<Decimal> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(FxError::FetchFailed {
                key: key.clone(),
                reason: "mock failure".to_string(),
            });
        }

        self.rates
            .get(&key.pair)
            .map(|r| *r)
            .ok_or_else(|| FxError::RateNotAvailable(key.clone()))
    }
}
