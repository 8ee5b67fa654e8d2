//! Shared application state.

use std::sync::Arc;

use repo::DefaultRepoEngine;

/// State held by the request handlers.
///
/// This is wrapped in an [`Arc`] and passed to request handlers via Axum's
/// `State` extractor; handlers clone the `Arc` into blocking tasks.
pub struct AppState {
    /// Embedded repository engine (block store + registry + verifier).
    pub engine: DefaultRepoEngine,
}

/// Thread-safe alias for `AppState`.
pub type SharedState = Arc<AppState>;
