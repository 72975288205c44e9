//! src/services/storage_service.rs
//!
//! StorageService: durable blob storage for uploads. Payload bytes are staged
//! under `base_path/.staging/{id}.part` while a session is open and published
//! to `base_path/objects/{shard}/{shard}/{id}` on finalize. Completed objects
//! are recorded in the SQLite `objects` catalog; nothing under `.staging` is
//! ever readable through [`StorageService::read`].

use crate::models::{coverage::ByteRange, object::StoredObject};
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, Take},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";
const OBJECTS_DIR: &str = "objects";
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    ObjectNotFound(Uuid),
    #[error("checksum mismatch for `{id}`: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        id: Uuid,
        expected: String,
        actual: String,
    },
    #[error("range {range} is not satisfiable for object `{id}` of {size} bytes")]
    RangeNotSatisfiable {
        id: Uuid,
        range: ByteRange,
        size: u64,
    },
    #[error("staged payload of `{id}` holds {actual} bytes, expected {expected}")]
    LengthMismatch { id: Uuid, expected: u64, actual: u64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Exclusive write target for one upload session.
///
/// Chunks may land in any order. The MD5 digest is advanced whenever a chunk
/// continues the already digested prefix; whatever remains is read back from
/// the staging file at finalize.
pub struct WriteHandle {
    id: Uuid,
    path: PathBuf,
    digest: Mutex<DigestState>,
}

struct DigestState {
    context: Context,
    digested: u64,
}

impl WriteHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of leading bytes already folded into the digest.
    pub fn digested(&self) -> u64 {
        self.digest_state().digested
    }

    fn digest_state(&self) -> std::sync::MutexGuard<'_, DigestState> {
        self.digest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn absorb(&self, offset: u64, data: &[u8]) {
        let mut state = self.digest_state();
        if state.digested == offset {
            state.context.consume(data);
            state.digested += data.len() as u64;
        }
    }
}

/// Descriptive fields recorded alongside a finalized payload.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    pub filename: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub expected_checksum: Option<String>,
}

/// A resolved ranged read: the catalog row, the byte span being served, and
/// a lazy stream over exactly those bytes.
pub struct ObjectRead {
    pub object: StoredObject,
    pub range: ByteRange,
    pub stream: ReaderStream<Take<File>>,
}

/// StorageService provides the blob operations behind upload sessions:
/// - allocate a staging file for a session
/// - positional chunk writes with incremental checksumming
/// - finalize (fsync, verify, publish, catalog insert)
/// - ranged reads and deletes of published objects
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for the object catalog.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where staged and published payloads live.
    pub base_path: PathBuf,
}

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the storage root.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Apply the embedded catalog schema. Statements are idempotent.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Create the storage layout and drop staging files left behind by a
    /// previous process. Sessions never survive a restart.
    pub async fn prepare(&self) -> StorageResult<()> {
        let staging = self.staging_root();
        match fs::remove_dir_all(&staging).await {
            Ok(_) => debug!("cleared stale staging area {}", staging.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }
        fs::create_dir_all(&staging).await?;
        fs::create_dir_all(self.objects_root()).await?;
        Ok(())
    }

    fn staging_root(&self) -> PathBuf {
        self.base_path.join(STAGING_DIR)
    }

    fn objects_root(&self) -> PathBuf {
        self.base_path.join(OBJECTS_DIR)
    }

    /// Generate two-level shard identifiers for an object id.
    ///
    /// Uses MD5(id) and returns the first two bytes as lowercase hex, which
    /// keeps the file count per directory small.
    fn object_shards(id: Uuid) -> (String, String) {
        let digest = md5::compute(id.as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Location of a published object relative to `base_path`.
    fn object_location(id: Uuid) -> String {
        let (shard_a, shard_b) = Self::object_shards(id);
        format!("{OBJECTS_DIR}/{shard_a}/{shard_b}/{id}")
    }

    /// Reserve an exclusive staging file for `id`.
    ///
    /// Fails with `AlreadyExists` if another session holds the same location.
    pub async fn allocate(&self, id: Uuid) -> StorageResult<WriteHandle> {
        let staging = self.staging_root();
        fs::create_dir_all(&staging).await?;
        let path = staging.join(format!("{id}.part"));
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        debug!(session_id = %id, path = %path.display(), "allocated staging file");
        Ok(WriteHandle {
            id,
            path,
            digest: Mutex::new(DigestState {
                context: Context::new(),
                digested: 0,
            }),
        })
    }

    /// Write `data` at `offset` within the staging file.
    ///
    /// Each call opens its own descriptor so writes to disjoint ranges of one
    /// session can proceed in parallel. Nothing is fsynced until finalize.
    pub async fn write_at(
        &self,
        handle: &WriteHandle,
        offset: u64,
        data: &[u8],
    ) -> StorageResult<()> {
        let mut file = OpenOptions::new().write(true).open(&handle.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        handle.absorb(offset, data);
        Ok(())
    }

    /// Verify and publish a fully written staging file.
    ///
    /// - fsyncs the staged bytes
    /// - completes the MD5 from the last digested offset
    /// - on checksum mismatch removes the staging file
    /// - renames into the sharded object location and inserts the catalog row
    ///
    /// Any other failure leaves the staged payload in place.
    pub async fn finalize(
        &self,
        handle: &WriteHandle,
        meta: ObjectMeta,
    ) -> StorageResult<StoredObject> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&handle.path)
            .await?;
        file.sync_all().await?;

        let staged_len = file.metadata().await?.len();
        if staged_len < meta.size {
            return Err(StorageError::LengthMismatch {
                id: handle.id,
                expected: meta.size,
                actual: staged_len,
            });
        }
        if staged_len > meta.size {
            // Bytes past the size can only come from a write that failed
            // after extending the file.
            debug!(
                session_id = %handle.id,
                from = staged_len,
                to = meta.size,
                "truncating staging file"
            );
            file.set_len(meta.size).await?;
            file.sync_all().await?;
        }

        let (mut context, digested) = {
            let state = handle.digest_state();
            if state.digested > meta.size {
                (Context::new(), 0)
            } else {
                (state.context.clone(), state.digested)
            }
        };
        if digested < meta.size {
            debug!(
                session_id = %handle.id,
                from = digested,
                to = meta.size,
                "digesting out-of-order tail from staging file"
            );
            file.seek(SeekFrom::Start(digested)).await?;
            let mut tail = ReaderStream::new(file.take(meta.size - digested));
            while let Some(chunk) = tail.next().await {
                context.consume(&chunk?);
            }
        } else {
            drop(file);
        }
        let checksum = format!("{:x}", context.compute());

        if let Some(expected) = meta.expected_checksum.as_deref() {
            if !expected.eq_ignore_ascii_case(&checksum) {
                self.discard(handle).await;
                return Err(StorageError::ChecksumMismatch {
                    id: handle.id,
                    expected: expected.to_ascii_lowercase(),
                    actual: checksum,
                });
            }
        }

        let location = Self::object_location(handle.id);
        let file_path = self.base_path.join(&location);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&handle.path, &file_path).await?;

        let insert_result = sqlx::query_as::<_, StoredObject>(
            r#"
            INSERT INTO objects (
                id, filename, content_type, size_bytes, checksum, location, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id, filename, content_type, size_bytes, checksum, location, created_at
            "#,
        )
        .bind(handle.id)
        .bind(&meta.filename)
        .bind(meta.content_type.clone())
        .bind(meta.size as i64)
        .bind(&checksum)
        .bind(&location)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(object) => Ok(object),
            Err(err) => {
                // Put the payload back so the session can retry finalize.
                if let Err(restore) = fs::rename(&file_path, &handle.path).await {
                    warn!(
                        session_id = %handle.id,
                        error = %restore,
                        "failed to restore staging file after catalog insert failed"
                    );
                }
                Err(StorageError::Sqlx(err))
            }
        }
    }

    /// Remove a staging file. Missing files are ignored.
    pub async fn discard(&self, handle: &WriteHandle) {
        match fs::remove_file(&handle.path).await {
            Ok(_) => debug!(session_id = %handle.id, "discarded staging file"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!(
                session_id = %handle.id,
                "failed to remove staging file {}: {}",
                handle.path.display(),
                err
            ),
        }
    }

    /// Fetch catalog metadata for a published object, if any.
    pub async fn find_object(&self, id: Uuid) -> StorageResult<Option<StoredObject>> {
        let object = sqlx::query_as::<_, StoredObject>(
            "SELECT id, filename, content_type, size_bytes, checksum, location, created_at
             FROM objects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(object)
    }

    /// Fetch catalog metadata, failing with ObjectNotFound when absent.
    pub async fn get_object(&self, id: Uuid) -> StorageResult<StoredObject> {
        self.find_object(id)
            .await?
            .ok_or(StorageError::ObjectNotFound(id))
    }

    /// List published objects, newest first.
    pub async fn list_objects(&self) -> StorageResult<Vec<StoredObject>> {
        let objects = sqlx::query_as::<_, StoredObject>(
            "SELECT id, filename, content_type, size_bytes, checksum, location, created_at
             FROM objects ORDER BY created_at DESC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(objects)
    }

    /// Open a published object for streaming.
    ///
    /// `range` defaults to the whole object. Each call opens a fresh
    /// descriptor, so reads are restartable and free of side effects.
    pub async fn read(&self, id: Uuid, range: Option<ByteRange>) -> StorageResult<ObjectRead> {
        let object = self.get_object(id).await?;
        let size = object.len();
        let range = range.unwrap_or(ByteRange::new(0, size));
        if range.start > range.end || range.end > size {
            return Err(StorageError::RangeNotSatisfiable { id, range, size });
        }

        let file_path = self.base_path.join(&object.location);
        let mut file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound(id)
            } else {
                StorageError::Io(err)
            }
        })?;
        if range.start > 0 {
            file.seek(SeekFrom::Start(range.start)).await?;
        }
        let stream = ReaderStream::new(file.take(range.len()));

        Ok(ObjectRead {
            object,
            range,
            stream,
        })
    }

    /// Delete a published object from the catalog and disk.
    ///
    /// - Removes the catalog row first so readers stop resolving it
    /// - Deletes the payload best-effort
    /// - Prunes empty shard directories
    pub async fn delete(&self, id: Uuid) -> StorageResult<StoredObject> {
        let object = self.get_object(id).await?;

        let result = sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ObjectNotFound(id));
        }

        let file_path = self.base_path.join(&object.location);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.objects_root()).await;
        }

        Ok(object)
    }

    /// Recursively remove empty directories up to `stop`.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}
