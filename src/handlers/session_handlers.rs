//! Session control endpoints under `/api/sessions`.
//!
//! Opening, inspecting, finalizing and aborting uploads. Chunk bytes never
//! pass through here; they go to `PUT /uploads/{id}`.

use super::{ObjectResponse, parse_session_id};
use crate::{
    AppState,
    errors::AppError,
    models::session::{OpenRequest, SessionView},
};
use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};

/// POST `/api/sessions`: open a session.
///
/// The body is optional; an empty body opens a session of unknown size.
pub async fn open_session(
    State(state): State<AppState>,
    payload: Result<Json<OpenRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => OpenRequest::default(),
        Err(rejection) => {
            return Err(AppError::bad_request(format!(
                "invalid session request: {}",
                rejection.body_text()
            )));
        }
    };

    let view = state.sessions.open(request).await?;

    let mut response = (StatusCode::CREATED, Json(&view)).into_response();
    if let Ok(location) = HeaderValue::from_str(&format!("/uploads/{}", view.id)) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    Ok(response)
}

/// GET `/api/sessions/{id}`: received ranges and status.
pub async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let id = parse_session_id(&id)?;
    Ok(Json(state.sessions.status(id)?))
}

/// POST `/api/sessions/{id}/finalize`: complete a fully received upload.
///
/// An optional `Content-MD5` header (base64, RFC 1864) supplies the expected
/// payload digest and takes precedence over one given at open.
pub async fn finalize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ObjectResponse>, AppError> {
    let id = parse_session_id(&id)?;
    let expected = content_md5(&headers)?;
    let object = state.sessions.finalize_verified(id, expected).await?;
    Ok(Json(ObjectResponse::from(object.as_ref())))
}

/// DELETE `/api/sessions/{id}`: abort and reclaim staged bytes.
pub async fn abort_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let id = parse_session_id(&id)?;
    Ok(Json(state.sessions.abort(id).await?))
}

/// Decode a `Content-MD5` header into lowercase hex.
fn content_md5(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get("content-md5") else {
        return Ok(None);
    };
    let digest = value
        .to_str()
        .ok()
        .and_then(|v| general_purpose::STANDARD.decode(v.trim()).ok())
        .filter(|bytes| bytes.len() == 16)
        .ok_or_else(|| AppError::bad_request("Content-MD5 must be a base64-encoded MD5 digest"))?;
    Ok(Some(
        digest.iter().map(|b| format!("{:02x}", b)).collect(),
    ))
}
