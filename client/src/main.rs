//! Ratelink Binary
//!
//! Connects to the upstream websocket, answers heartbeats and converts
//! request stakes into the target currency until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use ratelink_client::{
    ClientConfig, ConversionHandler, Metrics, SessionContext, Supervisor, WsConnector,
};
use ratelink_common::RatelinkError;
use ratelink_fx::{HttpRateFetcher, RateCache};

/// Install the JSON subscriber on stdout, plus a copy in `LOG_FILE` when set.
///
/// The returned guard flushes the file writer when dropped.
fn init_tracing() -> anyhow::Result<Option<WorkerGuard>> {
    let log_file = std::env::var_os("LOG_FILE")
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("LOG_FILE has no file name: {}", path.display()))?;
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing()?;

    info!("Starting Ratelink");

    // Load configuration
    let config = ClientConfig::from_env();
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(RatelinkError::ConfigurationError(e).into());
    }

    let mut fetcher = HttpRateFetcher::new(Url::parse(&config.rate_api_url)?)?;
    if let Some(key) = &config.rate_api_key {
        fetcher = fetcher.with_api_key(key.clone());
    }

    let cache = Arc::new(RateCache::new(Arc::new(fetcher), config.cache_config()));
    let metrics = Arc::new(Metrics::new());
    let handler = Arc::new(ConversionHandler::new(
        config.target_currency.clone(),
        config.request_failure_policy,
    ));

    let connector = WsConnector::new(Url::parse(&config.endpoint_url)?)
        .with_connect_timeout(config.connect_timeout);
    let supervisor = Supervisor::new(
        connector,
        &config,
        SessionContext::new(handler, cache.clone(), metrics.clone()),
    );

    // Set up graceful shutdown
    let shutdown = supervisor.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    info!(
        endpoint = %config.endpoint_url,
        target_currency = %config.target_currency,
        failure_policy = %config.request_failure_policy,
        "Ratelink running"
    );

    supervisor.run().await;

    let snapshot = metrics.snapshot();
    let cache_stats = cache.stats();
    info!(
        sessions_started = snapshot.sessions_started,
        requests_handled = snapshot.requests_handled,
        request_failures = snapshot.request_failures,
        cache_hits = cache_stats.hits,
        cache_fetches = cache_stats.fetches,
        "Ratelink shutdown complete"
    );
    Ok(())
}
