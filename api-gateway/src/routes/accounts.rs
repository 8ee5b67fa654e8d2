use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use repo::Deadline;
use tokio::runtime::Handle;

use super::error::ApiError;
use super::{authorization, blocking};
use crate::state::SharedState;

/// Request body for `POST /register`.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
}

/// Response body for `POST /register`.
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub name: String,
    pub did: String,
    pub root: String,
}

/// `POST /register`
///
/// Binds the requested name to the token issuer. The token only needs to
/// be addressed to this server; no attenuation is required.
pub async fn register(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RegisterResponse>, ApiError> {
    let request: RegisterRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid register body: {e}")))?;
    let authorization = authorization(&headers);

    let outcome =
        blocking(move || state.engine.register(authorization.as_deref(), &request.name)).await?;

    Ok(Json(RegisterResponse {
        name: outcome.name,
        did: outcome.did.to_string(),
        root: outcome.root.to_string(),
    }))
}

/// `GET /user/{id}`
///
/// Streams the account's current graph as an archive.
pub async fn export(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let (deadline, guard) =
        Deadline::after(state.engine.limits().update_timeout).cancel_on_drop();

    let archive = blocking(move || {
        let mut out = Vec::new();
        Handle::current().block_on(state.engine.export(&name, &mut out, &deadline))?;
        Ok(out)
    })
    .await?;
    guard.disarm();

    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], archive).into_response())
}

/// Response body for `GET /.well-known/did.json`.
#[derive(Debug, Serialize)]
pub struct DidDocument {
    pub id: String,
}

/// `GET /.well-known/did.json`
pub async fn did_document(State(state): State<SharedState>) -> Json<DidDocument> {
    Json(DidDocument {
        id: state.engine.server_did().to_string(),
    })
}
