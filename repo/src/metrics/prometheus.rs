//! Prometheus-backed metrics and HTTP exporter.
//!
//! This module defines a [`MetricsRegistry`] that owns a Prometheus
//! registry and a set of strongly-typed protocol metrics, and an async
//! HTTP exporter that serves `/metrics` using `hyper`.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, header::{self, HeaderValue},
    server::conn::http1, service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

/// Update-protocol Prometheus metrics.
///
/// Registered into a [`Registry`] and updated by
/// [`RepoEngine`](crate::protocol::RepoEngine).
#[derive(Clone)]
pub struct RepoMetrics {
    /// Wall time of an update request, accepted or not, in seconds.
    pub update_seconds: Histogram,
    /// Updates that advanced an account root.
    pub updates_committed: IntCounter,
    /// Rejected updates, labelled by the stage-independent `reason`.
    pub updates_rejected: IntCounterVec,
    /// Blocks read from update archives into staging.
    pub blocks_ingested: IntCounter,
    /// Archives written by export.
    pub exports_served: IntCounter,
}

impl RepoMetrics {
    /// Registers protocol metrics into the given `Registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let update_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "update_seconds",
                "Time to authenticate, ingest, verify and commit an update in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
        )?;
        registry.register(Box::new(update_seconds.clone()))?;

        let updates_committed = IntCounter::with_opts(Opts::new(
            "updates_committed",
            "Total number of updates that advanced an account root",
        ))?;
        registry.register(Box::new(updates_committed.clone()))?;

        let updates_rejected = IntCounterVec::new(
            Opts::new("updates_rejected", "Total number of rejected updates by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(updates_rejected.clone()))?;

        let blocks_ingested = IntCounter::with_opts(Opts::new(
            "blocks_ingested",
            "Total number of blocks read from update archives",
        ))?;
        registry.register(Box::new(blocks_ingested.clone()))?;

        let exports_served = IntCounter::with_opts(Opts::new(
            "exports_served",
            "Total number of account archives exported",
        ))?;
        registry.register(Box::new(exports_served.clone()))?;

        Ok(Self {
            update_seconds,
            updates_committed,
            updates_rejected,
            blocks_ingested,
            exports_served,
        })
    }
}

/// Wrapper around a Prometheus registry and the protocol metrics.
///
/// This is the main handle you pass around in the server. It can be wrapped
/// in an [`Arc`] and shared across threads/tasks.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub repo: RepoMetrics,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with a fresh underlying `Registry`
    /// (namespace `repo`) and registers the protocol metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("repo".to_string()), None)?;
        let repo = RepoMetrics::register(&registry)?;
        Ok(Self { registry, repo })
    }

    /// Encodes all metrics in this registry into the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "failed to encode Prometheus metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Runs an HTTP server that exposes Prometheus metrics.
///
/// The server listens on `addr` and serves `GET /metrics` with the
/// Prometheus text exposition format. All other paths return 404.
pub async fn run_prometheus_http_server(
    metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    serve_metrics(metrics, listener).await
}

/// Like [`run_prometheus_http_server`], on an already bound listener.
pub async fn serve_metrics(
    metrics: Arc<MetricsRegistry>,
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "metrics scrape connection");
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let metrics = metrics.clone();
                handle_request(req, metrics)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                warn!(error = %err, "prometheus HTTP server error");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &metrics))
}

fn route(method: &Method, path: &str, metrics: &MetricsRegistry) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => {
            let mut response = Response::new(Full::new(Bytes::from(metrics.gather_text())));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        _ => {
            let mut response = Response::new(Full::new(Bytes::from_static(b"not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}
