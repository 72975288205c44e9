//! Represents a resumable upload session and its public status view.

use super::coverage::{ByteRange, Coverage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of an upload session.
///
/// `Open` is the only state that accepts chunks. `Completed` and `Aborted`
/// are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Completed,
    Aborted,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Open => "open",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Parameters accepted when opening a session.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct OpenRequest {
    /// Total size in bytes. When omitted the client must mark its last
    /// chunk with `final=true`.
    #[serde(default)]
    pub size: Option<u64>,

    /// Original filename supplied by the client.
    #[serde(default)]
    pub filename: Option<String>,

    /// MIME type to serve the completed object with.
    #[serde(default)]
    pub content_type: Option<String>,

    /// Expected MD5 of the complete payload, lowercase hex.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Snapshot of a session returned by the control and ingestion endpoints.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionView {
    pub id: Uuid,
    pub status: SessionStatus,
    pub declared_size: Option<u64>,
    pub received_bytes: u64,
    pub received: Vec<ByteRange>,
    /// Gaps still to be sent; empty while the size is unknown.
    pub missing: Vec<ByteRange>,
    pub filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionView {
    pub(crate) fn new(
        id: Uuid,
        status: SessionStatus,
        declared_size: Option<u64>,
        coverage: &Coverage,
        filename: Option<String>,
        created_at: DateTime<Utc>,
        last_activity: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status,
            declared_size,
            received_bytes: coverage.covered_bytes(),
            received: coverage.ranges().to_vec(),
            missing: declared_size
                .map(|size| coverage.missing(size))
                .unwrap_or_default(),
            filename,
            created_at,
            last_activity,
        }
    }

    /// True once every declared byte has arrived.
    pub fn is_fully_received(&self) -> bool {
        self.declared_size
            .is_some_and(|size| size == self.received_bytes)
    }
}
