//! HTTP handlers, grouped by the capability they serve.
//!
//! - `session_handlers`, `video_handlers`, `health_handlers`: control plane under `/api`
//! - `ingest_handlers`: chunk writes under `/uploads`
//! - `retrieve_handlers`: streaming reads under `/uploads`

pub mod health_handlers;
pub mod ingest_handlers;
pub mod retrieve_handlers;
pub mod session_handlers;
pub mod video_handlers;

use crate::{errors::AppError, models::object::StoredObject};
use axum::http::StatusCode;
use serde::Serialize;
use uuid::Uuid;

/// Parse a session id from a path segment. Anything that is not a UUID can
/// never name a session, so it is reported as an unknown session.
pub(crate) fn parse_session_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| {
        AppError::new(
            StatusCode::NOT_FOUND,
            "SessionNotFound",
            format!("upload session `{raw}` not found"),
        )
    })
}

/// Parse a completed object id from a path segment.
pub(crate) fn parse_object_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::not_found(format!("object `{raw}` not found")))
}

/// JSON view of a completed object.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResponse {
    pub id: Uuid,
    pub filename: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub checksum: String,
    pub upload_time: String,
    pub url: String,
}

impl From<&StoredObject> for ObjectResponse {
    fn from(object: &StoredObject) -> Self {
        Self {
            id: object.id,
            filename: object.filename.clone(),
            content_type: object.content_type.clone(),
            size: object.len(),
            checksum: object.checksum.clone(),
            upload_time: object.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            url: format!("/uploads/{}", object.id),
        }
    }
}
