//! HTTP route handlers.

pub mod accounts;
pub mod error;
pub mod health;
pub mod update;

use axum::http::{HeaderMap, header::AUTHORIZATION};

use repo::RepoError;

use error::ApiError;

/// The `Authorization` header, if present and valid ASCII.
pub(crate) fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Runs engine work on the blocking pool.
///
/// Async engine calls are driven there with `Handle::block_on`, so their
/// storage I/O never stalls a runtime worker.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RepoError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
        .map_err(ApiError::from)
}
