//! Video library endpoints: single-shot multipart upload, listing and delete.
//!
//! `POST /api/upload` does not write the file itself. It opens an upload
//! session of unknown size and feeds the multipart field through it chunk by
//! chunk, so it shares staging, checksumming and publishing with resumable
//! uploads.

use super::{ObjectResponse, parse_object_id};
use crate::{
    AppState,
    errors::AppError,
    models::session::OpenRequest,
    services::session_manager::{SessionManager, sanitize_filename},
};
use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::Field},
    http::StatusCode,
};
use bytes::BytesMut;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Multipart field carrying the upload.
pub const VIDEO_FIELD: &str = "video";

/// Extensions accepted by `POST /api/upload`, lowercase.
pub const ALLOWED_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "wmv"];

/// Bytes buffered from the multipart stream before each session append.
const APPEND_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: &'static str,
    #[serde(flatten)]
    pub object: ObjectResponse,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: &'static str,
    pub id: Uuid,
}

/// Lowercased extension of `filename` if it is one of the allowed ones.
pub fn allowed_extension(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "wmv" => "video/x-ms-wmv",
        _ => "application/octet-stream",
    }
}

/// POST `/api/upload`: upload a whole video in one multipart request.
pub async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {}", err.body_text())))?
    {
        if field.name() != Some(VIDEO_FIELD) {
            continue;
        }

        let raw_name = field.file_name().unwrap_or_default().to_string();
        if raw_name.trim().is_empty() {
            return Err(AppError::bad_request("No selected file"));
        }
        let filename = sanitize_filename(&raw_name)
            .ok_or_else(|| AppError::bad_request("Invalid file type"))?;
        let ext = allowed_extension(&filename)
            .ok_or_else(|| AppError::bad_request("Invalid file type"))?;
        let content_type = field
            .content_type()
            .filter(|ct| ct.starts_with("video/"))
            .unwrap_or(content_type_for(&ext))
            .to_string();

        let view = state
            .sessions
            .open(OpenRequest {
                size: None,
                filename: Some(filename),
                content_type: Some(content_type),
                checksum: None,
            })
            .await?;
        let id = view.id;

        let result = async {
            feed_session(&state.sessions, id, field).await?;
            Ok::<_, AppError>(state.sessions.finalize(id).await?)
        }
        .await;
        let object = match result {
            Ok(object) => object,
            Err(err) => {
                if let Err(abort_err) = state.sessions.abort(id).await {
                    warn!(session_id = %id, error = %abort_err, "failed to abort single-shot upload");
                }
                return Err(err);
            }
        };
        info!(object_id = %id, filename = %object.filename, size = object.len(), "video uploaded");
        return Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                message: "Video uploaded successfully",
                object: ObjectResponse::from(object.as_ref()),
            }),
        ));
    }

    Err(AppError::bad_request("No video file provided"))
}

/// Copy a multipart field into session `id`, ending with a final chunk.
async fn feed_session(
    sessions: &SessionManager,
    id: Uuid,
    mut field: Field<'_>,
) -> Result<(), AppError> {
    let mut offset = 0u64;
    let mut buffer = BytesMut::with_capacity(APPEND_THRESHOLD);
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| AppError::bad_request(format!("upload interrupted: {}", err.body_text())))?
    {
        buffer.extend_from_slice(&chunk);
        if buffer.len() >= APPEND_THRESHOLD {
            let data = buffer.split().freeze();
            let len = data.len() as u64;
            sessions.append_chunk(id, offset, data, false).await?;
            offset += len;
        }
    }
    sessions
        .append_chunk(id, offset, buffer.freeze(), true)
        .await?;
    Ok(())
}

/// GET `/api/videos`: completed uploads, newest first.
pub async fn list_videos(
    State(state): State<AppState>,
) -> Result<Json<Vec<ObjectResponse>>, AppError> {
    let objects = state.storage.list_objects().await?;
    Ok(Json(objects.iter().map(ObjectResponse::from).collect()))
}

/// DELETE `/api/videos/{id}`: remove a completed upload.
pub async fn delete_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let id = parse_object_id(&id)?;
    state.storage.delete(id).await?;
    info!(object_id = %id, "video deleted");
    Ok(Json(DeleteResponse {
        message: "Video deleted successfully",
        id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_check_is_case_insensitive() {
        assert_eq!(allowed_extension("clip.MP4").as_deref(), Some("mp4"));
        assert_eq!(allowed_extension("a.b.wmv").as_deref(), Some("wmv"));
        assert!(allowed_extension("notes.txt").is_none());
        assert!(allowed_extension("mp4").is_none());
    }

    #[test]
    fn known_extensions_map_to_video_types() {
        assert_eq!(content_type_for("mov"), "video/quicktime");
        assert_eq!(content_type_for("avi"), "video/x-msvideo");
    }
}
