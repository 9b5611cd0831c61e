//! tscache HTTP server
//!
//! Speaks the KairosDB HTTP API, answering from cache where possible and
//! proxying to KairosDB otherwise.
//!
//! # Endpoints
//!
//! ## Query
//! - `POST /api/v1/datapoints/query` - Cached datapoint query
//!
//! ## Metadata
//! - `GET /api/v1/metricnames`, `GET /api/v1/tagnames`, `GET /api/v1/tagvalues`
//! - `POST /api/v1/datapoints/query/tags`
//!
//! ## Admin
//! - `GET /api/maintenance/flushall?orly=yarly` - Drop the whole cache
//! - `GET /version` - Crate version
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics
//!
//! # Configuration
//!
//! The server reads configuration from:
//! 1. `TSCACHE_CONFIG` environment variable (path to TOML file)
//! 2. `./tscache.toml` in current directory
//! 3. Default configuration
//!
//! # Example
//!
//! ```bash
//! TSCACHE_CONFIG=/etc/tscache.toml ./server
//!
//! curl -X POST http://localhost:8008/api/v1/datapoints/query \
//!   -H "Content-Type: application/json" \
//!   -d '{"start_relative": {"value": 1, "unit": "hours"}, "metrics": [{"name": "cpu"}]}'
//! ```

#[path = "server/handlers.rs"]
mod handlers;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use tokio::{signal, sync::broadcast};
use tracing::{error, info};

use handlers::AppState;
use tscache::{
    backend::KairosClient,
    config::Config,
    engine::CacheEngineBuilder,
    observability::{CacheMetrics, PrometheusConfig, PrometheusExporter},
    readahead::{service, ReadaheadService},
    store::RedisStore,
};

/// Build the router with all endpoints
fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health and metrics
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/version", get(handlers::version))
        // KairosDB API
        .route("/api/v1/datapoints/query", post(handlers::query_datapoints))
        .route("/api/v1/datapoints/query/tags", post(handlers::query_tags))
        .route("/api/v1/metricnames", get(handlers::metric_names))
        .route("/api/v1/tagnames", get(handlers::tag_names))
        .route("/api/v1/tagvalues", get(handlers::tag_values))
        // Maintenance
        .route("/api/maintenance/flushall", get(handlers::flushall))
        .with_state(state)
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tscache=info".parse()?)
                .add_directive("server=info".parse()?),
        )
        .init();

    info!("tscache server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load();
    info!("KairosDB: {}", config.kairosdb.base_url());
    info!("Listen address: {}", config.server.listen_addr);

    let metrics = Arc::new(CacheMetrics::new());
    let engine = CacheEngineBuilder::new()
        .with_store(RedisStore::new(&config.redis)?)
        .with_backend(KairosClient::new(&config.kairosdb)?)
        .with_metrics(metrics.clone())
        .with_config(config.clone())
        .build()
        .await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let readahead = if config.shadow.run_in_server {
        info!(interval_secs = config.shadow.interval_secs, "Running readahead in process");
        let service = Arc::new(ReadaheadService::new(engine.clone()));
        Some(service::spawn(service, shutdown_tx.subscribe()))
    } else {
        None
    };

    let state = Arc::new(AppState {
        engine,
        exporter: PrometheusExporter::new(PrometheusConfig::default(), metrics),
    });
    let app = build_router(state);

    let addr: SocketAddr = config.server.listen_addr.parse()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(());
    if let Some(handle) = readahead {
        if let Err(e) = handle.await {
            error!(error = %e, "Readahead service task failed");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
