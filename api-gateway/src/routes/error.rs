use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use repo::RepoError;

/// Error returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    Repo(RepoError),
    BadRequest(String),
    Internal(String),
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        ApiError::Repo(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Repo(e) => repo_error_response(e),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn repo_error_response(e: RepoError) -> (StatusCode, serde_json::Value) {
    match e {
        RepoError::Auth(reason) => {
            // Clients only learn that they were refused.
            warn!(%reason, "request not authorized");
            (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "not authorized" }),
            )
        }
        RepoError::Protocol(p) if p.exceeds_limit() => (
            StatusCode::PAYLOAD_TOO_LARGE,
            json!({ "error": p.to_string() }),
        ),
        RepoError::Protocol(p) => (StatusCode::BAD_REQUEST, json!({ "error": p.to_string() })),
        e @ RepoError::NotFound(_) => (StatusCode::NOT_FOUND, json!({ "error": e.to_string() })),
        RepoError::Integrity { missing } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({
                "error": "graph incomplete",
                "missing": missing.to_string(),
            }),
        ),
        RepoError::Conflict { account, current } => (
            StatusCode::CONFLICT,
            json!({
                "error": format!("root of {account} changed; retry against the current root"),
                "current": current.map(|c| c.to_string()),
            }),
        ),
        RepoError::Cancelled => (
            StatusCode::REQUEST_TIMEOUT,
            json!({ "error": "request timed out" }),
        ),
        e @ (RepoError::Storage(_) | RepoError::Io(_)) => {
            error!(error = %e, "storage failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "internal error" }),
            )
        }
    }
}
