//! Chunk ingestion: `PUT /uploads/{id}?offset=N[&final=true]`.
//!
//! The body is buffered whole by the `Bytes` extractor before anything is
//! applied, so a client that disconnects mid-body never touches coverage.

use super::parse_session_id;
use crate::{AppState, errors::AppError, models::session::SessionView};
use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
};
use bytes::Bytes;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub offset: Option<i64>,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

/// Write one chunk into an open session and return the updated coverage.
pub async fn put_chunk(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<ChunkQuery>, QueryRejection>,
    body: Bytes,
) -> Result<Json<SessionView>, AppError> {
    let id = parse_session_id(&id)?;
    let Query(query) =
        query.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;

    let offset = match query.offset {
        Some(offset) if offset >= 0 => offset as u64,
        Some(offset) => {
            return Err(AppError::bad_request(format!(
                "offset must be non-negative, got {offset}"
            )));
        }
        None => return Err(AppError::bad_request("missing `offset` query parameter")),
    };
    if body.is_empty() && !query.is_final {
        return Err(AppError::bad_request(format!(
            "empty chunk at offset {offset} for session `{id}`"
        )));
    }

    let view = state
        .sessions
        .append_chunk(id, offset, body, query.is_final)
        .await?;
    Ok(Json(view))
}
