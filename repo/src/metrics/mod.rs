//! Metrics and instrumentation for the repository host.
//!
//! This module defines Prometheus-compatible metrics for the update
//! protocol and exposes a small HTTP exporter that serves `/metrics` in
//! Prometheus text format.
//!
//! Typical usage:
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use repo::metrics::{MetricsRegistry, run_prometheus_http_server};
//!
//! let registry = Arc::new(MetricsRegistry::new()?);
//! let addr: SocketAddr = "127.0.0.1:9898".parse()?;
//!
//! // Spawn the HTTP exporter in the background:
//! tokio::spawn(run_prometheus_http_server(registry.clone(), addr));
//!
//! // Hand the protocol metrics to the engine:
//! let engine = engine.with_metrics(registry.repo.clone());
//! ```

pub mod prometheus;

pub use self::prometheus::{MetricsRegistry, RepoMetrics, run_prometheus_http_server, serve_metrics};
