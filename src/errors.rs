use crate::services::{session_manager::UploadError, storage_service::StorageError};
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// HTTP-facing error: a status, a stable machine-readable code, and a
/// message naming the session and offset involved where there is one.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    /// Object length echoed in `Content-Range` on 416 responses.
    pub range_size: Option<u64>,
}

impl AppError {
    /// Create a new AppError with a specific status, code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
            range_size: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal", msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NotFound", msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "InvalidInput", msg)
    }

    /// 416 with the object length attached.
    pub fn range_not_satisfiable(size: u64, msg: impl Into<String>) -> Self {
        let mut err = Self::new(StatusCode::RANGE_NOT_SATISFIABLE, "RangeNotSatisfiable", msg);
        err.range_size = Some(size);
        err
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, "{}", self.message);
        } else {
            tracing::debug!(code = self.code, status = self.status.as_u16(), "{}", self.message);
        }

        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        let mut response = (self.status, body).into_response();
        if let Some(size) = self.range_size {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let message = err.to_string();
        match err {
            StorageError::ObjectNotFound(_) => AppError::not_found(message),
            StorageError::ChecksumMismatch { .. } => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "ChecksumMismatch", message)
            }
            StorageError::RangeNotSatisfiable { size, .. } => {
                AppError::range_not_satisfiable(size, message)
            }
            StorageError::Io(_) => AppError::new(StatusCode::SERVICE_UNAVAILABLE, "IOError", message),
            StorageError::LengthMismatch { .. } | StorageError::Sqlx(_) => {
                AppError::internal(message)
            }
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let message = err.to_string();
        match err {
            UploadError::SessionNotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, "SessionNotFound", message)
            }
            UploadError::SessionClosed { .. } => {
                AppError::new(StatusCode::CONFLICT, "SessionClosed", message)
            }
            UploadError::RangeConflict { .. } => {
                AppError::new(StatusCode::CONFLICT, "RangeConflict", message)
            }
            UploadError::SizeExceeded { .. } => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "SizeExceeded", message)
            }
            UploadError::Incomplete { .. } => {
                AppError::new(StatusCode::CONFLICT, "Incomplete", message)
            }
            UploadError::InvalidInput { .. } => AppError::bad_request(message),
            UploadError::WriteFailed { .. } => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "IOError", message)
            }
            UploadError::Storage(inner) => AppError::from(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{coverage::ByteRange, session::SessionStatus};
    use uuid::Uuid;

    #[test]
    fn upload_errors_map_to_client_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (UploadError::SessionNotFound(id), StatusCode::NOT_FOUND, "SessionNotFound"),
            (
                UploadError::SessionClosed {
                    id,
                    status: SessionStatus::Completed,
                },
                StatusCode::CONFLICT,
                "SessionClosed",
            ),
            (
                UploadError::RangeConflict {
                    id,
                    offset: 3,
                    len: 5,
                },
                StatusCode::CONFLICT,
                "RangeConflict",
            ),
            (
                UploadError::SizeExceeded {
                    id,
                    offset: 8,
                    len: 4,
                    limit: 10,
                },
                StatusCode::PAYLOAD_TOO_LARGE,
                "SizeExceeded",
            ),
        ];
        for (err, status, code) in cases {
            let app: AppError = err.into();
            assert_eq!(app.status, status);
            assert_eq!(app.code, code);
            assert!(app.message.contains(&id.to_string()));
        }
    }

    #[test]
    fn checksum_mismatch_is_unprocessable() {
        let err = UploadError::Storage(StorageError::ChecksumMismatch {
            id: Uuid::nil(),
            expected: "a".repeat(32),
            actual: "b".repeat(32),
        });
        let app = AppError::from(err);
        assert_eq!(app.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(app.code, "ChecksumMismatch");
    }

    #[test]
    fn unsatisfiable_range_sets_content_range() {
        let err = StorageError::RangeNotSatisfiable {
            id: Uuid::nil(),
            range: ByteRange::new(20, 30),
            size: 10,
        };
        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");
    }

    #[test]
    fn io_failures_are_transient() {
        let err = UploadError::WriteFailed {
            id: Uuid::nil(),
            offset: 42,
            source: StorageError::Io(std::io::Error::other("disk gone")),
        };
        let app = AppError::from(err);
        assert_eq!(app.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(app.message.contains("offset 42"));
    }
}
