//! src/services/session_manager.rs
//!
//! SessionManager: owns the in-memory table of upload sessions and drives
//! their `Open -> Completed | Aborted` lifecycle on top of `StorageService`.
//!
//! Locking: each session keeps its mutable state behind a `std::sync::Mutex`
//! that is only held for coverage and reservation bookkeeping, never across
//! an `.await`. Chunk writes reserve their range under the lock, write to
//! storage without it, then commit. Finalize and abort are serialized per
//! session by an async gate so only one of them touches storage at a time.

use crate::models::{
    coverage::{ByteRange, Coverage},
    object::StoredObject,
    session::{OpenRequest, SessionStatus, SessionView},
};
use crate::services::storage_service::{ObjectMeta, StorageError, StorageService, WriteHandle};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload session `{0}` not found")]
    SessionNotFound(Uuid),
    #[error("upload session `{id}` is {status} and accepts no further changes")]
    SessionClosed { id: Uuid, status: SessionStatus },
    #[error("chunk at offset {offset} ({len} bytes) overlaps data already received for session `{id}`")]
    RangeConflict { id: Uuid, offset: u64, len: u64 },
    #[error("chunk at offset {offset} ({len} bytes) exceeds the {limit}-byte limit of session `{id}`")]
    SizeExceeded {
        id: Uuid,
        offset: u64,
        len: u64,
        limit: u64,
    },
    #[error("session `{id}` is incomplete: {received} of {} bytes received", describe_size(.declared))]
    Incomplete {
        id: Uuid,
        received: u64,
        declared: Option<u64>,
    },
    #[error("invalid request for session `{id}`: {reason}")]
    InvalidInput { id: Uuid, reason: String },
    #[error("writing chunk at offset {offset} of session `{id}` failed: {source}")]
    WriteFailed {
        id: Uuid,
        offset: u64,
        source: StorageError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type UploadResult<T> = Result<T, UploadError>;

fn describe_size(declared: &Option<u64>) -> String {
    declared.map_or_else(|| "an undeclared number of".to_string(), |s| s.to_string())
}

/// Tunables enforced by the session manager.
#[derive(Clone, Copy, Debug)]
pub struct SessionLimits {
    /// Sessions with no activity for this long are evicted.
    pub idle_timeout: Duration,
    /// Largest payload a session may declare or grow to.
    pub max_upload_size: u64,
}

/// Shared handle to the session table. Cloning is cheap.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    storage: StorageService,
    limits: SessionLimits,
    sessions: RwLock<HashMap<Uuid, Arc<SessionEntry>>>,
}

struct SessionEntry {
    id: Uuid,
    created_at: DateTime<Utc>,
    filename: Option<String>,
    content_type: Option<String>,
    expected_checksum: Option<String>,
    handle: WriteHandle,
    state: Mutex<SessionState>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

enum Stage {
    Open,
    Completed(Arc<StoredObject>),
    Aborted,
}

struct SessionState {
    stage: Stage,
    declared_size: Option<u64>,
    coverage: Coverage,
    in_flight: Vec<ByteRange>,
    finalizing: bool,
    last_activity: DateTime<Utc>,
}

impl SessionState {
    fn status(&self) -> SessionStatus {
        match self.stage {
            Stage::Open => SessionStatus::Open,
            Stage::Completed(_) => SessionStatus::Completed,
            Stage::Aborted => SessionStatus::Aborted,
        }
    }

    fn accepts_writes(&self) -> bool {
        matches!(self.stage, Stage::Open) && !self.finalizing
    }

    fn is_busy(&self) -> bool {
        self.finalizing || !self.in_flight.is_empty()
    }

    fn release(&mut self, range: &ByteRange) {
        if let Some(pos) = self.in_flight.iter().position(|r| r == range) {
            self.in_flight.swap_remove(pos);
        }
    }
}

impl SessionEntry {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn view(&self, state: &SessionState) -> SessionView {
        SessionView::new(
            self.id,
            state.status(),
            state.declared_size,
            &state.coverage,
            self.filename.clone(),
            self.created_at,
            state.last_activity,
        )
    }

    fn closed(&self, state: &SessionState) -> UploadError {
        UploadError::SessionClosed {
            id: self.id,
            status: state.status(),
        }
    }
}

/// An in-flight chunk range. Dropping it without `commit` releases the
/// range, so a cancelled request leaves coverage untouched.
struct Reservation {
    entry: Arc<SessionEntry>,
    range: ByteRange,
    done: bool,
}

impl Reservation {
    fn commit(mut self) -> UploadResult<SessionView> {
        self.done = true;
        let mut state = self.entry.lock();
        state.release(&self.range);
        if !matches!(state.stage, Stage::Open) {
            return Err(self.entry.closed(&state));
        }
        state.coverage.insert(self.range);
        state.last_activity = Utc::now();
        Ok(self.entry.view(&state))
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.done {
            self.entry.lock().release(&self.range);
            debug!(
                session_id = %self.entry.id,
                offset = self.range.start,
                len = self.range.len(),
                "released uncommitted chunk reservation"
            );
        }
    }
}

impl SessionManager {
    /// Create an empty session table over `storage`.
    pub fn new(storage: StorageService, limits: SessionLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                limits,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.inner.limits
    }

    pub fn storage(&self) -> &StorageService {
        &self.inner.storage
    }

    /// Number of sessions currently tracked, including terminal tombstones.
    pub fn len(&self) -> usize {
        self.read_table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<SessionEntry>>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<SessionEntry>>> {
        self.inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, id: Uuid) -> UploadResult<Arc<SessionEntry>> {
        self.read_table()
            .get(&id)
            .cloned()
            .ok_or(UploadError::SessionNotFound(id))
    }

    /// Open a new session and allocate its staging storage.
    ///
    /// `size` may be omitted; the client then signals the end of the upload
    /// by flagging its last chunk as final.
    pub async fn open(&self, request: OpenRequest) -> UploadResult<SessionView> {
        let id = Uuid::new_v4();
        let limit = self.inner.limits.max_upload_size;
        if let Some(size) = request.size {
            if size > limit {
                return Err(UploadError::SizeExceeded {
                    id,
                    offset: 0,
                    len: size,
                    limit,
                });
            }
        }

        let expected_checksum = match request.checksum.as_deref().map(str::trim) {
            Some(value) if is_md5_hex(value) => Some(value.to_ascii_lowercase()),
            Some(value) => {
                return Err(UploadError::InvalidInput {
                    id,
                    reason: format!("checksum `{value}` is not a hex-encoded MD5 digest"),
                });
            }
            None => None,
        };

        let handle = self.inner.storage.allocate(id).await?;
        let now = Utc::now();
        let entry = Arc::new(SessionEntry {
            id,
            created_at: now,
            filename: request.filename.as_deref().and_then(sanitize_filename),
            content_type: request.content_type.filter(|ct| !ct.trim().is_empty()),
            expected_checksum,
            handle,
            state: Mutex::new(SessionState {
                stage: Stage::Open,
                declared_size: request.size,
                coverage: Coverage::new(),
                in_flight: Vec::new(),
                finalizing: false,
                last_activity: now,
            }),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        });

        let view = entry.view(&entry.lock());
        self.write_table().insert(id, entry);
        info!(session_id = %id, declared_size = ?request.size, "opened upload session");
        Ok(view)
    }

    /// Apply one chunk to a session.
    ///
    /// The chunk is all-or-nothing: it is either fully written and added to
    /// coverage, or coverage is left unchanged. `is_final` marks the last
    /// chunk of a session opened without a size and fixes its size to
    /// `offset + data.len()`.
    pub async fn append_chunk(
        &self,
        id: Uuid,
        offset: u64,
        data: Bytes,
        is_final: bool,
    ) -> UploadResult<SessionView> {
        let entry = self.entry(id)?;
        let len = data.len() as u64;
        let limit = self.inner.limits.max_upload_size;
        let range = ByteRange::at(offset, len).ok_or(UploadError::SizeExceeded {
            id,
            offset,
            len,
            limit,
        })?;

        let reservation = {
            let mut state = entry.lock();
            if !state.accepts_writes() {
                return Err(entry.closed(&state));
            }
            state.last_activity = Utc::now();

            let limit = state.declared_size.unwrap_or(limit);
            if range.end > limit {
                return Err(UploadError::SizeExceeded {
                    id,
                    offset,
                    len,
                    limit,
                });
            }
            if range.is_empty() && !is_final {
                return Err(UploadError::InvalidInput {
                    id,
                    reason: "chunk payload is empty".into(),
                });
            }
            if state.coverage.overlaps(&range) || state.in_flight.iter().any(|r| r.overlaps(&range))
            {
                return Err(UploadError::RangeConflict { id, offset, len });
            }
            if is_final {
                match state.declared_size {
                    Some(size) if size != range.end => {
                        return Err(UploadError::InvalidInput {
                            id,
                            reason: format!(
                                "final chunk ends at {} but the declared size is {size}",
                                range.end
                            ),
                        });
                    }
                    Some(_) => {}
                    None => {
                        let furthest = state
                            .in_flight
                            .iter()
                            .map(|r| r.end)
                            .fold(state.coverage.max_end(), u64::max);
                        if furthest > range.end {
                            return Err(UploadError::InvalidInput {
                                id,
                                reason: format!(
                                    "final chunk ends at {} but data up to {furthest} was already sent",
                                    range.end
                                ),
                            });
                        }
                        state.declared_size = Some(range.end);
                        debug!(session_id = %id, size = range.end, "session size fixed by final chunk");
                    }
                }
            }
            if range.is_empty() {
                return Ok(entry.view(&state));
            }
            state.in_flight.push(range);
            Reservation {
                entry: Arc::clone(&entry),
                range,
                done: false,
            }
        };

        self.inner
            .storage
            .write_at(&entry.handle, offset, &data)
            .await
            .map_err(|source| {
                let state = entry.lock();
                if !matches!(state.stage, Stage::Open) {
                    debug!(session_id = %id, offset, error = %source, "write raced a closing session");
                    return entry.closed(&state);
                }
                warn!(session_id = %id, offset, len, error = %source, "chunk write failed");
                UploadError::WriteFailed { id, offset, source }
            })?;

        let view = reservation.commit()?;
        debug!(
            session_id = %id,
            offset,
            len,
            received = view.received_bytes,
            "chunk accepted"
        );
        Ok(view)
    }

    /// Current coverage and status of a session. Counts as activity.
    pub fn status(&self, id: Uuid) -> UploadResult<SessionView> {
        let entry = self.entry(id)?;
        let mut state = entry.lock();
        state.last_activity = Utc::now();
        Ok(entry.view(&state))
    }

    /// Complete a session once every declared byte has arrived.
    ///
    /// Repeated calls after success return the same object without touching
    /// storage again, including after the session tombstone was evicted.
    /// Storage work runs on its own task so a caller that goes away cannot
    /// leave the session half-finalized.
    pub async fn finalize(&self, id: Uuid) -> UploadResult<Arc<StoredObject>> {
        self.finalize_verified(id, None).await
    }

    /// `finalize` with a checksum supplied at completion time.
    ///
    /// `expected` (hex MD5) replaces any checksum given when the session was
    /// opened. Against an already completed session it is compared with the
    /// stored digest without changing the object.
    pub async fn finalize_verified(
        &self,
        id: Uuid,
        expected: Option<String>,
    ) -> UploadResult<Arc<StoredObject>> {
        let expected = match expected.as_deref().map(str::trim) {
            Some(value) if is_md5_hex(value) => Some(value.to_ascii_lowercase()),
            Some(value) => {
                return Err(UploadError::InvalidInput {
                    id,
                    reason: format!("checksum `{value}` is not a hex-encoded MD5 digest"),
                });
            }
            None => None,
        };

        let entry = match self.entry(id) {
            Ok(entry) => entry,
            Err(err) => {
                return match self.inner.storage.find_object(id).await? {
                    Some(object) => verify_completed(Arc::new(object), expected.as_deref()),
                    None => Err(err),
                };
            }
        };

        let gate = Arc::clone(&entry.gate).lock_owned().await;
        let size = {
            let mut state = entry.lock();
            state.last_activity = Utc::now();
            match &state.stage {
                Stage::Completed(object) => {
                    return verify_completed(Arc::clone(object), expected.as_deref());
                }
                Stage::Aborted => return Err(entry.closed(&state)),
                Stage::Open => {}
            }
            let received = state.coverage.covered_bytes();
            let size = match state.declared_size {
                Some(size) if state.in_flight.is_empty() && state.coverage.is_complete(size) => {
                    size
                }
                declared => {
                    return Err(UploadError::Incomplete {
                        id,
                        received,
                        declared,
                    });
                }
            };
            state.finalizing = true;
            size
        };

        let storage = self.inner.storage.clone();
        let task = tokio::spawn(async move {
            let _gate = gate;
            let meta = ObjectMeta {
                filename: entry
                    .filename
                    .clone()
                    .unwrap_or_else(|| entry.id.to_string()),
                content_type: entry.content_type.clone(),
                size,
                expected_checksum: expected.or_else(|| entry.expected_checksum.clone()),
            };
            let result = storage.finalize(&entry.handle, meta).await;

            let mut state = entry.lock();
            state.finalizing = false;
            state.last_activity = Utc::now();
            match result {
                Ok(object) => {
                    let object = Arc::new(object);
                    state.stage = Stage::Completed(Arc::clone(&object));
                    info!(
                        session_id = %entry.id,
                        size,
                        checksum = %object.checksum,
                        "upload session completed"
                    );
                    Ok(object)
                }
                Err(err @ StorageError::ChecksumMismatch { .. }) => {
                    state.stage = Stage::Aborted;
                    state.coverage = Coverage::new();
                    warn!(session_id = %entry.id, error = %err, "upload session aborted");
                    Err(UploadError::Storage(err))
                }
                Err(err) => {
                    warn!(session_id = %entry.id, error = %err, "finalize failed, session stays open");
                    Err(UploadError::Storage(err))
                }
            }
        });

        match task.await {
            Ok(result) => result,
            Err(join_err) => Err(UploadError::Storage(StorageError::Io(io::Error::other(
                join_err,
            )))),
        }
    }

    /// Abort an open session and reclaim its staging storage.
    ///
    /// Aborting an already aborted session is a no-op.
    pub async fn abort(&self, id: Uuid) -> UploadResult<SessionView> {
        let entry = self.entry(id)?;
        let _gate = entry.gate.lock().await;
        let view = {
            let mut state = entry.lock();
            match state.stage {
                Stage::Completed(_) => return Err(entry.closed(&state)),
                Stage::Aborted => return Ok(entry.view(&state)),
                Stage::Open => {}
            }
            state.stage = Stage::Aborted;
            state.coverage = Coverage::new();
            state.last_activity = Utc::now();
            entry.view(&state)
        };

        self.inner.storage.discard(&entry.handle).await;
        info!(session_id = %id, "upload session aborted by client");
        Ok(view)
    }

    /// Evict every session idle for longer than the configured timeout.
    pub async fn evict_idle(&self) -> usize {
        self.evict_idle_at(Utc::now()).await
    }

    /// Eviction against an explicit clock, returning the number of sessions
    /// removed. Sessions with chunks in flight or a running finalize are
    /// skipped until their next pass.
    pub async fn evict_idle_at(&self, now: DateTime<Utc>) -> usize {
        let timeout = chrono::Duration::from_std(self.inner.limits.idle_timeout)
            .unwrap_or(chrono::Duration::MAX);

        let mut reclaim = Vec::new();
        let mut evicted = 0;
        {
            let mut table = self.write_table();
            table.retain(|id, entry| {
                let mut state = entry.lock();
                if state.is_busy() || now - state.last_activity < timeout {
                    return true;
                }
                if matches!(state.stage, Stage::Open) {
                    state.stage = Stage::Aborted;
                    state.coverage = Coverage::new();
                    reclaim.push(Arc::clone(entry));
                }
                debug!(session_id = %id, status = %state.status(), "evicting idle session");
                evicted += 1;
                false
            });
        }

        for entry in &reclaim {
            self.inner.storage.discard(&entry.handle).await;
        }
        if evicted > 0 {
            info!(evicted, reclaimed = reclaim.len(), "evicted idle upload sessions");
        }
        evicted
    }

    /// Run `evict_idle` periodically until the returned task is aborted.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = (self.inner.limits.idle_timeout / 4).max(MIN_REAP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.evict_idle().await;
            }
        })
    }

    /// Discard every session. Open sessions lose their staged bytes.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<SessionEntry>> = self.write_table().drain().map(|(_, e)| e).collect();
        let mut discarded = 0;
        for entry in entries {
            let was_open = {
                let mut state = entry.lock();
                let open = matches!(state.stage, Stage::Open);
                if open {
                    state.stage = Stage::Aborted;
                }
                open
            };
            if was_open {
                self.inner.storage.discard(&entry.handle).await;
                discarded += 1;
            }
        }
        info!(discarded, "session table torn down");
    }
}

fn verify_completed(
    object: Arc<StoredObject>,
    expected: Option<&str>,
) -> UploadResult<Arc<StoredObject>> {
    match expected {
        Some(expected) if expected != object.checksum => {
            Err(UploadError::Storage(StorageError::ChecksumMismatch {
                id: object.id,
                expected: expected.to_string(),
                actual: object.checksum.clone(),
            }))
        }
        _ => Ok(object),
    }
}

fn is_md5_hex(value: &str) -> bool {
    value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Reduce a client-supplied filename to a safe basename.
///
/// Directory components are dropped, whitespace becomes `_`, and anything
/// outside `[A-Za-z0-9._-]` is removed. Returns `None` if nothing usable
/// remains.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = base
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    let trimmed = cleaned.trim_start_matches(['.', '_']);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories_and_unsafe_characters() {
        assert_eq!(
            sanitize_filename("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_filename("C:\\videos\\my holiday.mp4").as_deref(),
            Some("my_holiday.mp4")
        );
        assert_eq!(sanitize_filename("..."), None);
        assert_eq!(sanitize_filename("视频.mov").as_deref(), Some("mov"));
    }

    #[test]
    fn md5_hex_detection() {
        assert!(is_md5_hex("d41d8cd98f00b204e9800998ecf8427e"));
        assert!(is_md5_hex("D41D8CD98F00B204E9800998ECF8427E"));
        assert!(!is_md5_hex("d41d8cd98f00b204"));
        assert!(!is_md5_hex("z41d8cd98f00b204e9800998ecf8427e"));
    }

    #[test]
    fn incomplete_error_mentions_unknown_size() {
        let err = UploadError::Incomplete {
            id: Uuid::nil(),
            received: 5,
            declared: None,
        };
        assert!(err.to_string().contains("5 of an undeclared number of bytes"));
    }
}
