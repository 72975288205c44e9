//! Defines routes for the control, ingestion and retrieval surfaces.
//!
//! ## Structure
//! - **Control** (`/api`)
//!   - `POST   /api/sessions`: open an upload session
//!   - `GET    /api/sessions/{id}`: session status and received ranges
//!   - `POST   /api/sessions/{id}/finalize`: complete a session
//!   - `DELETE /api/sessions/{id}`: abort a session
//!   - `POST   /api/upload`: single-shot multipart upload
//!   - `GET    /api/videos`: list completed uploads
//!   - `DELETE /api/videos/{id}`: delete a completed upload
//!   - `GET    /api/healthz`, `/api/readyz`
//!
//! - **Ingest** (`PUT /uploads/{id}?offset=N[&final=true]`)
//! - **Retrieve** (`GET|HEAD /uploads/{id}`, `Range` aware)
//!
//! Anything else is a JSON 404.

use crate::{
    AppState,
    errors::AppError,
    handlers::{
        health_handlers::{healthz, readyz},
        ingest_handlers::put_chunk,
        retrieve_handlers::{get_object, head_object},
        session_handlers::{abort_session, finalize_session, open_session, session_status},
        video_handlers::{delete_video, list_videos, upload_video},
    },
};
use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::{Method, Uri},
    routing::{delete, get, post, put},
};
use std::fmt;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info_span};

/// Multipart framing allowance on top of the payload limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// The service surface a request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    Control,
    Ingest,
    Retrieve,
}

impl Capability {
    /// Resolve the capability serving `method` on `path`, if any.
    pub fn classify(method: &Method, path: &str) -> Option<Self> {
        let prefix = path.trim_start_matches('/').split('/').next().unwrap_or_default();
        match prefix {
            "api" => Some(Capability::Control),
            "uploads" if *method == Method::PUT => Some(Capability::Ingest),
            "uploads" if *method == Method::GET || *method == Method::HEAD => {
                Some(Capability::Retrieve)
            }
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Control => "control",
            Capability::Ingest => "ingest",
            Capability::Retrieve => "retrieve",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control-plane routes, mounted under `/api`.
fn control_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/sessions", post(open_session))
        .route("/sessions/{id}", get(session_status).delete(abort_session))
        .route("/sessions/{id}/finalize", post(finalize_session))
        .route(
            "/upload",
            post(upload_video)
                .layer(DefaultBodyLimit::max(max_upload_size.saturating_add(MULTIPART_OVERHEAD))),
        )
        .route("/videos", get(list_videos))
        .route("/videos/{id}", delete(delete_video))
}

/// Data-plane routes, mounted under `/uploads`.
fn upload_routes(max_chunk_size: usize) -> Router<AppState> {
    Router::new().route(
        "/{id}",
        put(put_chunk)
            .layer(DefaultBodyLimit::max(max_chunk_size))
            .get(get_object)
            .head(head_object),
    )
}

async fn not_found(method: Method, uri: Uri) -> AppError {
    AppError::not_found(format!("no route for {} {}", method, uri.path()))
}

/// Build the complete application router.
///
/// Body limits come from the state's configuration; the returned router
/// already carries the state, tracing and CORS layers.
pub fn routes(state: AppState) -> Router {
    let max_upload_size = usize::try_from(state.config.max_upload_size).unwrap_or(usize::MAX);
    let max_chunk_size = usize::try_from(state.config.max_chunk_size).unwrap_or(usize::MAX);

    Router::new()
        .nest("/api", control_routes(max_upload_size))
        .nest("/uploads", upload_routes(max_chunk_size))
        .fallback(not_found)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let capability = Capability::classify(request.method(), request.uri().path())
                        .map_or("none", Capability::as_str);
                    info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        capability
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_prefix_and_method() {
        assert_eq!(
            Capability::classify(&Method::POST, "/api/sessions"),
            Some(Capability::Control)
        );
        assert_eq!(
            Capability::classify(&Method::PUT, "/uploads/abc"),
            Some(Capability::Ingest)
        );
        assert_eq!(
            Capability::classify(&Method::HEAD, "/uploads/abc"),
            Some(Capability::Retrieve)
        );
        assert_eq!(Capability::classify(&Method::DELETE, "/uploads/abc"), None);
        assert_eq!(Capability::classify(&Method::GET, "/static/app.js"), None);
        assert_eq!(Capability::classify(&Method::GET, "/apix"), None);
    }
}
