mod common;

use common::{collect, md5_hex, test_env};
use media_store::{
    models::coverage::ByteRange,
    services::storage_service::{ObjectMeta, StorageError},
};
use uuid::Uuid;

fn meta(size: u64) -> ObjectMeta {
    ObjectMeta {
        filename: "movie.mov".into(),
        content_type: Some("video/quicktime".into()),
        size,
        expected_checksum: None,
    }
}

#[tokio::test]
async fn allocate_write_finalize_publishes_object() {
    let env = test_env().await;
    let storage = env.storage();
    let id = Uuid::new_v4();

    let handle = storage.allocate(id).await.unwrap();
    assert!(handle.path().exists());
    storage.write_at(&handle, 0, b"hello ").await.unwrap();
    storage.write_at(&handle, 6, b"world").await.unwrap();
    assert_eq!(handle.digested(), 11);

    let object = storage.finalize(&handle, meta(11)).await.unwrap();
    assert_eq!(object.id, id);
    assert_eq!(object.checksum, md5_hex(b"hello world"));
    assert_eq!(object.content_type.as_deref(), Some("video/quicktime"));
    assert!(object.location.starts_with("objects/"));
    assert!(object.location.ends_with(&id.to_string()));
    assert!(!handle.path().exists());
    assert!(env.storage_root().join(&object.location).is_file());
}

#[tokio::test]
async fn out_of_order_tail_is_digested_at_finalize() {
    let env = test_env().await;
    let storage = env.storage();
    let handle = storage.allocate(Uuid::new_v4()).await.unwrap();

    storage.write_at(&handle, 5, b"56789").await.unwrap();
    assert_eq!(handle.digested(), 0);
    storage.write_at(&handle, 0, b"01234").await.unwrap();
    assert_eq!(handle.digested(), 5);

    let object = storage.finalize(&handle, meta(10)).await.unwrap();
    assert_eq!(object.checksum, md5_hex(b"0123456789"));
}

#[tokio::test]
async fn finalize_rejects_wrong_length() {
    let env = test_env().await;
    let storage = env.storage();
    let handle = storage.allocate(Uuid::new_v4()).await.unwrap();
    storage.write_at(&handle, 0, b"abc").await.unwrap();

    let err = storage.finalize(&handle, meta(5)).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::LengthMismatch {
            expected: 5,
            actual: 3,
            ..
        }
    ));
    assert!(handle.path().exists());
}

#[tokio::test]
async fn checksum_mismatch_removes_staging_file() {
    let env = test_env().await;
    let storage = env.storage();
    let handle = storage.allocate(Uuid::new_v4()).await.unwrap();
    storage.write_at(&handle, 0, b"abc").await.unwrap();

    let err = storage
        .finalize(
            &handle,
            ObjectMeta {
                expected_checksum: Some(md5_hex(b"abd")),
                ..meta(3)
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ChecksumMismatch { .. }));
    assert!(!handle.path().exists());
    assert!(storage.list_objects().await.unwrap().is_empty());
}

#[tokio::test]
async fn staged_bytes_are_not_readable() {
    let env = test_env().await;
    let storage = env.storage();
    let id = Uuid::new_v4();
    let handle = storage.allocate(id).await.unwrap();
    storage.write_at(&handle, 0, b"secret").await.unwrap();

    assert!(matches!(
        storage.read(id, None).await,
        Err(StorageError::ObjectNotFound(_))
    ));
}

#[tokio::test]
async fn ranged_reads_and_unsatisfiable_ranges() {
    let env = test_env().await;
    let storage = env.storage();
    let id = Uuid::new_v4();
    let handle = storage.allocate(id).await.unwrap();
    storage.write_at(&handle, 0, b"0123456789").await.unwrap();
    storage.finalize(&handle, meta(10)).await.unwrap();

    let read = storage.read(id, Some(ByteRange::new(3, 7))).await.unwrap();
    assert_eq!(read.range, ByteRange::new(3, 7));
    assert_eq!(collect(read).await, b"3456");

    let whole = storage.read(id, None).await.unwrap();
    assert_eq!(whole.range, ByteRange::new(0, 10));

    let err = storage
        .read(id, Some(ByteRange::new(5, 11)))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        StorageError::RangeNotSatisfiable { size: 10, .. }
    ));
}

#[tokio::test]
async fn delete_removes_row_and_file_and_prunes_shards() {
    let env = test_env().await;
    let storage = env.storage();
    let id = Uuid::new_v4();
    let handle = storage.allocate(id).await.unwrap();
    storage.write_at(&handle, 0, b"bye").await.unwrap();
    let object = storage.finalize(&handle, meta(3)).await.unwrap();
    let path = env.storage_root().join(&object.location);

    let deleted = storage.delete(id).await.unwrap();
    assert_eq!(deleted.id, id);
    assert!(!path.exists());
    assert!(!path.parent().unwrap().exists());
    assert!(env.storage_root().join("objects").is_dir());
    assert!(storage.find_object(id).await.unwrap().is_none());

    assert!(matches!(
        storage.delete(id).await,
        Err(StorageError::ObjectNotFound(_))
    ));
}

#[tokio::test]
async fn list_objects_returns_newest_first() {
    let env = test_env().await;
    let storage = env.storage();
    let mut ids = Vec::new();
    for body in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        let id = Uuid::new_v4();
        let handle = storage.allocate(id).await.unwrap();
        storage.write_at(&handle, 0, body).await.unwrap();
        storage
            .finalize(&handle, meta(body.len() as u64))
            .await
            .unwrap();
        ids.push(id);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let listed: Vec<Uuid> = storage
        .list_objects()
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.id)
        .collect();
    ids.reverse();
    assert_eq!(listed, ids);
}

#[tokio::test]
async fn prepare_clears_stale_staging() {
    let env = test_env().await;
    let storage = env.storage();
    let handle = storage.allocate(Uuid::new_v4()).await.unwrap();
    storage.write_at(&handle, 0, b"leftover").await.unwrap();
    assert_eq!(env.staged_files(), 1);

    storage.prepare().await.unwrap();
    assert_eq!(env.staged_files(), 0);
    assert!(env.storage_root().join(".staging").is_dir());
}

#[tokio::test]
async fn allocate_refuses_duplicate_location() {
    let env = test_env().await;
    let id = Uuid::new_v4();
    let _handle = env.storage().allocate(id).await.unwrap();
    assert!(matches!(
        env.storage().allocate(id).await,
        Err(StorageError::Io(_))
    ));
}

#[tokio::test]
async fn finalize_truncates_bytes_past_the_size() {
    let env = test_env().await;
    let storage = env.storage();
    let handle = storage.allocate(Uuid::new_v4()).await.unwrap();
    storage.write_at(&handle, 0, b"0123456789").await.unwrap();
    assert_eq!(handle.digested(), 10);

    let object = storage.finalize(&handle, meta(4)).await.unwrap();
    assert_eq!(object.checksum, md5_hex(b"0123"));
    let read = storage.read(object.id, None).await.unwrap();
    assert_eq!(collect(read).await, b"0123");
}

#[tokio::test]
async fn failed_catalog_insert_restores_staging_file() {
    let env = test_env().await;
    let storage = env.storage();
    let handle = storage.allocate(Uuid::new_v4()).await.unwrap();
    storage.write_at(&handle, 0, b"xyz").await.unwrap();
    sqlx::query(
        "INSERT INTO objects (id, filename, content_type, size_bytes, checksum, location, created_at)
         VALUES (?, 'taken', NULL, 0, '', 'elsewhere', '2024-01-01T00:00:00Z')",
    )
    .bind(handle.id())
    .execute(&*storage.db)
    .await
    .unwrap();

    let err = storage.finalize(&handle, meta(3)).await.unwrap_err();
    assert!(matches!(err, StorageError::Sqlx(_)));
    assert!(handle.path().is_file());
    assert_eq!(std::fs::read(handle.path()).unwrap(), b"xyz");
}
