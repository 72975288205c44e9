//! Streaming retrieval of completed objects: `GET|HEAD /uploads/{id}`.
//!
//! Single byte ranges are honored (`bytes=a-b`, `bytes=a-`, `bytes=-n`).
//! Every request opens its own descriptor, so a broken download can resume
//! from any offset with a later range.

use super::parse_object_id;
use crate::{
    AppState,
    errors::AppError,
    models::{coverage::ByteRange, object::StoredObject},
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::debug;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Stream an object, or the requested slice of it.
pub async fn get_object(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let id = parse_object_id(&id)?;
    let object = state.storage.get_object(id).await?;
    let range = parse_range(headers.get(header::RANGE), object.len())?;

    let read = state.storage.read(id, range).await?;
    debug!(
        object_id = %id,
        start = read.range.start,
        end = read.range.end,
        "streaming object"
    );

    let mut response = Body::from_stream(read.stream).into_response();
    *response.status_mut() = status_for(range);
    apply_headers(response.headers_mut(), &read.object, read.range, range.is_some());
    Ok(response)
}

/// Same headers as `GET`, no body and no file access.
pub async fn head_object(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let id = parse_object_id(&id)?;
    let object = state.storage.get_object(id).await?;
    let range = parse_range(headers.get(header::RANGE), object.len())?;
    let span = range.unwrap_or(ByteRange::new(0, object.len()));

    let mut response = status_for(range).into_response();
    apply_headers(response.headers_mut(), &object, span, range.is_some());
    Ok(response)
}

fn status_for(range: Option<ByteRange>) -> StatusCode {
    if range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    }
}

fn apply_headers(headers: &mut HeaderMap, object: &StoredObject, span: ByteRange, partial: bool) {
    let content_type = object
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or(HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(span.len()));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );

    let etag = format!("\"{}\"", object.checksum);
    let last_modified = object
        .created_at
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    let disposition = format!("inline; filename=\"{}\"", object.filename);
    for (name, value) in [
        (header::ETAG, etag),
        (header::LAST_MODIFIED, last_modified),
        (header::CONTENT_DISPOSITION, disposition),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }

    if partial && !span.is_empty() {
        let content_range = format!("bytes {}-{}/{}", span.start, span.end - 1, object.len());
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
}

/// Parse a single-range `Range` header against an object of `size` bytes.
///
/// Returns `Ok(None)` when no range was requested. An end past the object is
/// clamped to its last byte; a start past it is unsatisfiable.
pub fn parse_range(
    value: Option<&HeaderValue>,
    size: u64,
) -> Result<Option<ByteRange>, AppError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let invalid = || AppError::bad_request("invalid Range header");
    let unsatisfiable = || {
        AppError::range_not_satisfiable(
            size,
            format!("requested range not satisfiable for object of {size} bytes"),
        )
    };

    let value = value.to_str().map_err(|_| invalid())?;
    let Some(set) = value.trim().strip_prefix("bytes=") else {
        return Err(invalid());
    };
    if set.contains(',') {
        return Err(AppError::bad_request("multiple ranges not supported"));
    }
    let (start_part, end_part) = set.split_once('-').ok_or_else(invalid)?;
    let (start_part, end_part) = (start_part.trim(), end_part.trim());

    if start_part.is_empty() {
        let suffix: u64 = end_part.parse().map_err(|_| invalid())?;
        if suffix == 0 || size == 0 {
            return Err(unsatisfiable());
        }
        return Ok(Some(ByteRange::new(size.saturating_sub(suffix), size)));
    }

    let start: u64 = start_part.parse().map_err(|_| invalid())?;
    let end = if end_part.is_empty() {
        size
    } else {
        let last: u64 = end_part.parse().map_err(|_| invalid())?;
        if last < start {
            return Err(invalid());
        }
        last.saturating_add(1).min(size)
    };
    if start >= size {
        return Err(unsatisfiable());
    }
    Ok(Some(ByteRange::new(start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(header: &str, size: u64) -> Result<Option<ByteRange>, AppError> {
        parse_range(Some(&HeaderValue::from_str(header).unwrap()), size)
    }

    #[test]
    fn absent_header_means_whole_object() {
        assert!(parse_range(None, 10).unwrap().is_none());
    }

    #[test]
    fn parses_closed_open_and_suffix_ranges() {
        assert_eq!(range("bytes=0-4", 10).unwrap(), Some(ByteRange::new(0, 5)));
        assert_eq!(range("bytes=6-", 10).unwrap(), Some(ByteRange::new(6, 10)));
        assert_eq!(range("bytes=-3", 10).unwrap(), Some(ByteRange::new(7, 10)));
        assert_eq!(range("bytes=-30", 10).unwrap(), Some(ByteRange::new(0, 10)));
        assert_eq!(range("bytes=8-99", 10).unwrap(), Some(ByteRange::new(8, 10)));
    }

    #[test]
    fn start_past_end_is_unsatisfiable() {
        let err = range("bytes=10-", 10).unwrap_err();
        assert_eq!(err.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(err.range_size, Some(10));
        let err = range("bytes=0-", 0).unwrap_err();
        assert_eq!(err.status, StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[test]
    fn malformed_ranges_are_bad_requests() {
        for header in ["items=0-1", "bytes=a-b", "bytes=0-1,4-5", "bytes=5-2", "bytes=7"] {
            assert_eq!(range(header, 10).unwrap_err().status, StatusCode::BAD_REQUEST);
        }
    }
}
