//! API gateway binary.
//!
//! Embeds a [`repo::DefaultRepoEngine`] (RocksDB-backed unless
//! `--in-memory` is given), serves the HTTP API, and runs a Prometheus
//! metrics exporter on `/metrics`.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use api_gateway::config::ApiConfig;
use api_gateway::state::{AppState, SharedState};
use repo::{MetricsRegistry, StorageConfig, run_prometheus_http_server};

const DEFAULT_LOG_FILTER: &str = "api_gateway=info,repo=info";

#[tokio::main]
async fn main() {
    let api_cfg = ApiConfig::parse();
    init_tracing(api_cfg.json_logs);

    if let Err(e) = run(api_cfg).await {
        eprintln!("fatal error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(api_cfg: ApiConfig) -> Result<(), String> {
    let repo_cfg = api_cfg.repo_config();

    // ---------------------------
    // Metrics
    // ---------------------------

    let metrics = Arc::new(
        MetricsRegistry::new()
            .map_err(|e| format!("failed to initialise metrics registry: {e}"))?,
    );

    if repo_cfg.metrics.enabled {
        let metrics_clone = metrics.clone();
        let addr = repo_cfg.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(metrics_clone, addr).await {
                tracing::error!("metrics HTTP server error: {e}");
            }
        });
        tracing::info!("metrics exporter listening on http://{}/metrics", addr);
    }

    // ---------------------------
    // Storage + engine
    // ---------------------------

    let engine = repo::open_engine(&repo_cfg)
        .map_err(|e| format!("failed to open repository: {e}"))?
        .with_metrics(metrics.repo.clone());

    match &repo_cfg.storage {
        StorageConfig::Memory => tracing::warn!("using in-memory storage; data is lost on exit"),
        StorageConfig::RocksDb(db) => tracing::info!(path = %db.path, "using RocksDB storage"),
    }
    tracing::info!(did = %engine.server_did(), "server identity");

    let app_state: SharedState = Arc::new(AppState { engine });
    let app = api_gateway::router(app_state);

    // ---------------------------
    // axum 0.8 server
    // ---------------------------

    tracing::info!("API gateway listening on http://{}", api_cfg.listen_addr);

    let listener = tokio::net::TcpListener::bind(api_cfg.listen_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", api_cfg.listen_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("API server error: {e}"))?;

    Ok(())
}

/// Waits for Ctrl-C (or SIGTERM on Unix) and returns, used for graceful
/// shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
