use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};

use repo::{Cid, Deadline, UpdateRequest};
use tokio::runtime::Handle;

use super::error::ApiError;
use super::{authorization, blocking};
use crate::state::SharedState;

/// Optional header naming the root the client built its update on.
pub const EXPECTED_ROOT_HEADER: &str = "x-expected-root";

/// `POST /update`
///
/// The body is an archive whose single root is the account record. The
/// account is taken from the record; the token must grant `post/update` on
/// it and be issued by the account's owner.
///
/// If the client disconnects, the guard is dropped with the request future
/// and the blocking work stops at its next deadline check.
pub async fn update(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let expected_root = expected_root(&headers)?;
    let authorization = authorization(&headers);
    let (deadline, guard) =
        Deadline::after(state.engine.limits().update_timeout).cancel_on_drop();

    blocking(move || {
        Handle::current().block_on(state.engine.update(
            UpdateRequest {
                authorization: authorization.as_deref(),
                archive: &body[..],
                expected_root,
            },
            &deadline,
        ))
    })
    .await?;
    guard.disarm();

    Ok(StatusCode::OK)
}

fn expected_root(headers: &HeaderMap) -> Result<Option<Cid>, ApiError> {
    let Some(value) = headers.get(EXPECTED_ROOT_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<Cid>().ok())
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest(format!("{EXPECTED_ROOT_HEADER} is not a valid CID")))
}
