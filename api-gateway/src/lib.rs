//! HTTP surface of the repository host.
//!
//! - `POST /register`
//! - `POST /update`
//! - `GET /user/{id}`
//! - `GET /.well-known/did.json`
//! - `GET /health`
//!
//! Every route answers cross-origin requests from any origin, so browser
//! clients can register, push and fetch directly. Prometheus metrics are
//! served on a separate listener by the binary.

pub mod config;
pub mod routes;
pub mod state;

use std::time::Instant;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::Method,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use routes::{accounts, health, update};
use state::SharedState;

/// Builds the application router.
pub fn router(state: SharedState) -> Router {
    let max_archive_bytes = state.engine.limits().max_archive_bytes;

    Router::new()
        .route("/health", get(health::health))
        .route("/register", post(accounts::register))
        .route(
            "/update",
            post(update::update).layer(DefaultBodyLimit::max(max_archive_bytes)),
        )
        .route("/user/{id}", get(accounts::export))
        .route("/.well-known/did.json", get(accounts::did_document))
        .layer(cors())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any)
}

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    info!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}
