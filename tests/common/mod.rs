#![allow(dead_code)]

use futures::StreamExt;
use media_store::{
    AppState,
    config::AppConfig,
    services::{
        session_manager::{SessionLimits, SessionManager},
        storage_service::{ObjectRead, StorageService},
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tempfile::TempDir;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_UPLOAD_SIZE: u64 = 64 * 1024 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// A storage root and catalog under a temporary directory.
pub struct TestEnv {
    pub dir: TempDir,
    pub state: AppState,
}

impl TestEnv {
    pub fn storage(&self) -> &StorageService {
        &self.state.storage
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.state.sessions
    }

    pub fn storage_root(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }

    /// Staging file of an open session.
    pub fn staging_path(&self, id: uuid::Uuid) -> PathBuf {
        self.storage_root().join(".staging").join(format!("{id}.part"))
    }

    /// Files currently left in the staging area.
    pub fn staged_files(&self) -> usize {
        std::fs::read_dir(self.storage_root().join(".staging"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub async fn test_env() -> TestEnv {
    test_env_with(MAX_UPLOAD_SIZE).await
}

pub async fn test_env_with(max_upload_size: u64) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let storage_root = dir.path().join("uploads");
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("catalog.db"))
        .create_if_missing(true);
    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .unwrap();

    let storage = StorageService::new(Arc::new(db), storage_root.clone());
    storage.migrate().await.unwrap();
    storage.prepare().await.unwrap();

    let sessions = SessionManager::new(
        storage.clone(),
        SessionLimits {
            idle_timeout: IDLE_TIMEOUT,
            max_upload_size,
        },
    );
    let config = AppConfig {
        host: "127.0.0.1".into(),
        port: 0,
        storage_dir: storage_root.display().to_string(),
        database_url: "sqlite::memory:".into(),
        idle_timeout_secs: IDLE_TIMEOUT.as_secs(),
        max_upload_size,
        max_chunk_size: MAX_CHUNK_SIZE,
    };

    TestEnv {
        dir,
        state: AppState::new(config, storage, sessions),
    }
}

/// Drain a ranged read into memory.
pub async fn collect(read: ObjectRead) -> Vec<u8> {
    let mut stream = read.stream;
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Deterministic, non-repeating-looking payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
