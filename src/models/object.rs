//! Represents a completed, immutable media object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A finalized upload recorded in the catalog.
///
/// The struct stores metadata only; payload bytes live on disk under the
/// storage root at `location`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// Identifier shared with the upload session that produced it.
    pub id: Uuid,

    /// Sanitized filename supplied by the client, or the id when none was given.
    pub filename: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Lowercase hex MD5 of the payload.
    pub checksum: String,

    /// Payload path relative to the storage root.
    pub location: String,

    /// When the session was finalized.
    pub created_at: DateTime<Utc>,
}

impl StoredObject {
    pub fn len(&self) -> u64 {
        self.size_bytes.max(0) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.size_bytes <= 0
    }
}
