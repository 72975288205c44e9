//! media-store - resumable media upload ingestion and streaming retrieval.
//!
//! The service sits behind a reverse proxy that forwards `/api/*` and
//! `/uploads/*` to it:
//! - chunked, out-of-order, resumable uploads tracked as sessions
//! - staged blob storage with MD5 verification on finalize
//! - a SQLite catalog of completed objects
//! - ranged, resumable streaming of completed objects

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use config::AppConfig;
use services::{session_manager::SessionManager, storage_service::StorageService};
use std::sync::Arc;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: StorageService,
    pub sessions: SessionManager,
}

impl AppState {
    pub fn new(config: AppConfig, storage: StorageService, sessions: SessionManager) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            sessions,
        }
    }
}
