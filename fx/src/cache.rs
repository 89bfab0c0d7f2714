//! Exchange rate caching with TTL support.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ratelink_common::{as_millis_u64, constants, RateKey};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{FxError, FxResult};
use crate::provider::RateFetcher;

/// Cached rate entry.
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    rate: Decimal,
    fetched_at: Instant,
}

impl CacheEntry {
    fn new(rate: Decimal) -> Self {
        Self {
            rate,
            fetched_at: Instant::now(),
        }
    }

    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.fetched_at) < ttl
    }
}

/// Configuration for rate cache.
#[derive(Debug, Clone)]
pub struct RateCacheConfig {
    /// How long a fetched rate is served without refetching.
    pub ttl: Duration,
    /// Period of the background sweep.
    pub sweep_interval: Duration,
    /// Upper bound on a single fetch; `None` waits indefinitely.
    pub fetch_timeout: Option<Duration>,
}

impl Default for RateCacheConfig {
    fn default() -> Self {
        Self {
            ttl: constants::cache_ttl(),
            sweep_interval: constants::cache_sweep_interval(),
            fetch_timeout: Some(constants::fetch_timeout()),
        }
    }
}

/// Thread-safe rate cache with TTL.
///
/// A miss calls the configured [`RateFetcher`]. Concurrent misses for the
/// same key wait on a per-key gate so only one fetch is in flight; the
/// waiters pick up the stored value once the gate opens.
pub struct RateCache {
    entries: DashMap<RateKey, CacheEntry>,
    in_flight: DashMap<RateKey, Arc<Mutex<()>>>,
    fetcher: Arc<dyn RateFetcher>,
    config: RateCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    evictions: AtomicU64,
}

impl RateCache {
    /// Create a new rate cache backed by `fetcher`.
    pub fn new(fetcher: Arc<dyn RateFetcher>, config: RateCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            fetcher,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a rate, fetching it when absent or older than the TTL.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn get(&self, key: &RateKey) -> FxResult<Decimal> {
        if let Some(rate) = self.peek(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(rate = %rate, "Cache hit");
            return Ok(rate);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss");

        let gate = self.in_flight.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = gate.lock().await;
            match self.peek(key) {
                Some(rate) => {
                    debug!(rate = %rate, "Rate stored by concurrent fetch");
                    Ok(rate)
                }
                None => self.fetch_and_store(key).await,
            }
        };

        drop(gate);
        self.in_flight
            .remove_if(key, |_, gate| Arc::strong_count(gate) == 1);

        result
    }

    /// Get a fresh rate without fetching.
    pub fn peek(&self, key: &RateKey) -> Option<Decimal> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh(now, self.config.ttl))
            .map(|entry| entry.rate)
    }

    /// Insert a rate stamped with the current time.
    pub fn insert(&self, key: RateKey, rate: Decimal) {
        self.entries.insert(key, CacheEntry::new(rate));
    }

    /// Remove a rate from cache.
    pub fn remove(&self, key: &RateKey) -> Option<Decimal> {
        self.entries.remove(key).map(|(_, entry)| entry.rate)
    }

    /// Clear all cached rates.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Get the number of entries in cache, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry at or past the TTL, returning how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            let fresh = entry.is_fresh(now, ttl);
            if !fresh {
                removed += 1;
            }
            fresh
        });

        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Run the sweep every `sweep_interval` until the future is dropped.
    pub async fn run_sweep_loop(&self) -> Infallible {
        loop {
            tokio::time::sleep(self.config.sweep_interval).await;

            let removed = self.sweep_expired();
            if removed > 0 {
                info!(removed, remaining = self.entries.len(), "Swept expired rates");
            } else {
                debug!("Sweep found nothing to evict");
            }
        }
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    async fn fetch_and_store(&self, key: &RateKey) -> FxResult<Decimal> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(fetcher = self.fetcher.name(), "Fetching rate");

        let fetch = self.fetcher.fetch_rate(key);
        let result = match self.config.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(result) => result,
                Err(_) => Err(FxError::FetchTimeout {
                    key: key.clone(),
                    timeout_ms: as_millis_u64(limit),
                }),
            },
            None => fetch.await,
        };

        match result {
            Ok(rate) => {
                self.entries.insert(key.clone(), CacheEntry::new(rate));
                debug!(rate = %rate, "Rate cached");
                Ok(rate)
            }
            Err(e) => {
                self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Rate fetch failed");
                Err(e)
            }
        }
    }

    #[cfg(test)]
    fn gates_in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub evictions: u64,
}

/// Shared rate cache.
pub type SharedRateCache = Arc<RateCache>;
