//! Ratelink FX
//!
//! Exchange rate lookup for currency conversion.
//!
//! # Features
//!
//! - Pluggable rate fetchers (`RateFetcher`), with an HTTP implementation
//! - Rate caching with a TTL, background sweep and per-key single-flight
//! - Timeout around every external fetch
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ratelink_fx::{HttpRateFetcher, RateCache, RateCacheConfig};
//!
//! let fetcher = Arc::new(HttpRateFetcher::new(url)?);
//! let cache = Arc::new(RateCache::new(fetcher, RateCacheConfig::default()));
//!
//! let rate = cache.get(&key).await?;
//! ```

pub mod provider;
pub mod cache;
pub mod conversion;
pub mod error;

pub use provider::{HttpRateFetcher, RateFetcher};
#[cfg(any(test, feature = "test-utils"))]
pub use provider::MockRateFetcher;
pub use cache::{CacheStats, RateCache, RateCacheConfig, SharedRateCache};
pub use conversion::Conversion;
pub use error::{FxError, FxResult};
