//! Client configuration.

use std::str::FromStr;
use std::time::Duration;

use ratelink_common::{constants, Currency};
use ratelink_fx::RateCacheConfig;
use tracing::warn;
use url::Url;

use crate::handler::RequestFailurePolicy;

/// Configuration for the Ratelink client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Websocket URL of the upstream server.
    pub endpoint_url: String,
    /// Upper bound on opening the websocket.
    pub connect_timeout: Duration,
    /// Pause after echoing a heartbeat.
    pub heartbeat_interval: Duration,
    /// Silence after which the upstream is considered dead.
    pub heartbeat_timeout: Duration,
    /// How long a fetched rate is reused.
    pub cache_ttl: Duration,
    /// Period of the cache sweep.
    pub sweep_interval: Duration,
    /// Upper bound on a single rate fetch.
    pub fetch_timeout: Duration,
    /// Root URL of the exchange rate API.
    pub rate_api_url: String,
    /// Access key for the exchange rate API.
    pub rate_api_key: Option<String>,
    /// Currency every stake is converted into.
    pub target_currency: Currency,
    /// Initial reconnection delay.
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay.
    pub max_reconnect_delay: Duration,
    /// What a failed conversion does to the connection.
    pub request_failure_policy: RequestFailurePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "ws://127.0.0.1:8080/ws".to_string(),
            connect_timeout: constants::connect_timeout(),
            heartbeat_interval: constants::heartbeat_interval(),
            heartbeat_timeout: constants::heartbeat_timeout(),
            cache_ttl: constants::cache_ttl(),
            sweep_interval: constants::cache_sweep_interval(),
            fetch_timeout: constants::fetch_timeout(),
            rate_api_url: "https://api.exchangerate.host".to_string(),
            rate_api_key: None,
            target_currency: Currency::eur(),
            reconnect_delay: constants::reconnect_delay(),
            max_reconnect_delay: constants::max_reconnect_delay(),
            request_failure_policy: RequestFailurePolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("WEBSOCKET_ENDPOINT") {
            config.endpoint_url = url;
        }

        if let Some(ms) = env_parse::<u64>("CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("HEARTBEAT_TIMEOUT_MS") {
            config.heartbeat_timeout = Duration::from_millis(ms);
        }

        if let Some(secs) = env_parse::<u64>("CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse::<u64>("CACHE_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }

        if let Some(ms) = env_parse::<u64>("FETCH_TIMEOUT_MS") {
            config.fetch_timeout = Duration::from_millis(ms);
        }

        if let Ok(url) = std::env::var("RATE_API_URL") {
            config.rate_api_url = url;
        }

        if let Ok(key) = std::env::var("RATE_API_KEY") {
            if !key.is_empty() {
                config.rate_api_key = Some(key);
            }
        }

        if let Ok(currency) = std::env::var("TARGET_CURRENCY") {
            config.target_currency = Currency::new(currency);
        }

        if let Some(ms) = env_parse::<u64>("RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("MAX_RECONNECT_DELAY_MS") {
            config.max_reconnect_delay = Duration::from_millis(ms);
        }

        if let Some(policy) = env_parse::<RequestFailurePolicy>("REQUEST_FAILURE_POLICY") {
            config.request_failure_policy = policy;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        let endpoint = Url::parse(&self.endpoint_url)
            .map_err(|e| format!("Invalid websocket endpoint {}: {}", self.endpoint_url, e))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(format!(
                "Websocket endpoint must use ws or wss, got {}",
                endpoint.scheme()
            ));
        }

        let rate_api = Url::parse(&self.rate_api_url)
            .map_err(|e| format!("Invalid rate API URL {}: {}", self.rate_api_url, e))?;
        if !matches!(rate_api.scheme(), "http" | "https") {
            return Err(format!(
                "Rate API URL must use http or https, got {}",
                rate_api.scheme()
            ));
        }

        if self.heartbeat_interval.is_zero() {
            return Err("Heartbeat interval cannot be zero".to_string());
        }

        if self.heartbeat_interval >= self.heartbeat_timeout {
            return Err("Heartbeat interval must be shorter than the heartbeat timeout".to_string());
        }

        if self.cache_ttl.is_zero() {
            return Err("Cache TTL cannot be zero".to_string());
        }

        if self.sweep_interval.is_zero() {
            return Err("Cache sweep interval cannot be zero".to_string());
        }

        if self.fetch_timeout.is_zero() {
            return Err("Fetch timeout cannot be zero".to_string());
        }

        // A stalled fetch runs between two heartbeats.
        if self.heartbeat_interval.saturating_add(self.fetch_timeout) >= self.heartbeat_timeout {
            return Err(
                "Heartbeat interval plus fetch timeout must be shorter than the heartbeat timeout"
                    .to_string(),
            );
        }

        if self.connect_timeout.is_zero() {
            return Err("Connect timeout cannot be zero".to_string());
        }

        if !self.target_currency.is_valid() {
            return Err(format!("Invalid target currency {}", self.target_currency));
        }

        if self.reconnect_delay > self.max_reconnect_delay {
            return Err("Reconnect delay cannot exceed the maximum reconnect delay".to_string());
        }

        Ok(())
    }

    /// Rate cache settings derived from this configuration.
    pub fn cache_config(&self) -> RateCacheConfig {
        RateCacheConfig {
            ttl: self.cache_ttl,
            sweep_interval: self.sweep_interval,
            fetch_timeout: Some(self.fetch_timeout),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparseable environment value");
            None
        }
    }
}
