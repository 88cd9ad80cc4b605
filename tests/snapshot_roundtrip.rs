//! Snapshot export/import: byte-wise round trips, leadership gating,
//! image validation and inventory corruption detection.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use absurder_sql::storage::{block_key, MemoryStore};
use absurder_sql::{BlockStore, ChangeType, Database, DatabaseError, SqlValue};

use common::{init_logging, test_options, unique_name, wipe_database, RecordEngine};

fn row(id: i64) -> Vec<SqlValue> {
    vec![
        SqlValue::Integer(id),
        SqlValue::Text(format!("payload-{}", id)),
        SqlValue::Real(id as f64 * 0.5),
    ]
}

#[tokio::test]
async fn snapshot_round_trip_preserves_rows_and_bytes() {
    init_logging();
    let name = unique_name("roundtrip");
    let mut options = test_options();
    // Batch the inserts into one sync so the test stays fast.
    options.auto_sync = false;
    let mut db = Database::open(&name, options.clone(), RecordEngine::new())
        .await
        .unwrap();
    db.execute("CREATE TABLE items", &[]).await.unwrap();
    for id in 0..1000 {
        db.execute("INSERT", &row(id)).await.unwrap();
    }
    db.sync().await.unwrap();
    let rows_before = db.query("SELECT *", &[]).await.unwrap();
    assert_eq!(rows_before.len(), 1000);

    let image = db.export_to_bytes().await.unwrap();
    assert!(!image.is_empty());
    db.close().await.unwrap();

    // Drop the database wholesale, then restore from the image.
    wipe_database(&name);
    let mut db = Database::open(&name, options, RecordEngine::new())
        .await
        .unwrap();
    assert_eq!(db.storage_info().file_size, 0);
    db.import_from_bytes(&image).await.unwrap();

    let rows_after = db.query("SELECT *", &[]).await.unwrap();
    assert_eq!(rows_after, rows_before);

    // Export of the restored database is byte-identical.
    let image_again = db.export_to_bytes().await.unwrap();
    assert_eq!(image_again, image);
    db.close().await.unwrap();
    wipe_database(&name);
}

#[tokio::test]
async fn export_requires_the_writer_lease() {
    init_logging();
    let name = unique_name("exportlease");
    let mut leader = Database::open(&name, test_options(), RecordEngine::new())
        .await
        .unwrap();
    leader.execute("CREATE TABLE items", &[]).await.unwrap();
    leader.execute("INSERT", &row(1)).await.unwrap();

    let mut reader = Database::open(&name, test_options(), RecordEngine::new())
        .await
        .unwrap();
    assert!(!reader.is_leader());
    match reader.export_to_bytes().await {
        Err(DatabaseError::Busy) => {}
        other => panic!("expected Busy, got {:?}", other.map(|v| v.len())),
    }
    match reader.import_from_bytes(&[1, 2, 3]).await {
        Err(DatabaseError::Busy) => {}
        other => panic!("expected Busy, got {:?}", other),
    }

    reader.close().await.unwrap();
    leader.close().await.unwrap();
    wipe_database(&name);
}

#[tokio::test]
async fn import_rejects_invalid_images() {
    init_logging();
    let name = unique_name("badimage");
    let mut db = Database::open(&name, test_options(), RecordEngine::new())
        .await
        .unwrap();
    match db.import_from_bytes(&[]).await {
        Err(DatabaseError::Invalid { .. }) => {}
        other => panic!("expected Invalid, got {:?}", other),
    }
    db.close().await.unwrap();
    wipe_database(&name);
}

#[tokio::test]
async fn import_bumps_generation_and_broadcasts_replacement() {
    init_logging();
    let name = unique_name("importgen");
    let mut db = Database::open(&name, test_options(), RecordEngine::new())
        .await
        .unwrap();
    db.execute("CREATE TABLE items", &[]).await.unwrap();
    db.execute("INSERT", &row(1)).await.unwrap();
    let image = db.export_to_bytes().await.unwrap();
    let generation_before = db.generation();

    let events: Arc<Mutex<Vec<(u64, ChangeType)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _watch = db.on_data_change(move |event| {
        sink.lock().unwrap().push((event.generation, event.change_type));
    });

    db.import_from_bytes(&image).await.unwrap();
    assert_eq!(db.generation(), generation_before + 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = events.lock().unwrap();
    assert_eq!(
        *seen,
        vec![(generation_before + 1, ChangeType::SnapshotReplaced)]
    );
    drop(seen);
    db.close().await.unwrap();
    wipe_database(&name);
}

#[tokio::test]
async fn export_detects_blocks_past_the_declared_size() {
    init_logging();
    let name = unique_name("inventory");
    let mut db = Database::open(&name, test_options(), RecordEngine::new())
        .await
        .unwrap();
    db.execute("CREATE TABLE items", &[]).await.unwrap();
    db.execute("INSERT", &row(1)).await.unwrap();

    // Plant a rogue block far past the recorded file size.
    let store = MemoryStore::open(&name);
    store
        .put_batch(vec![(block_key(50), Bytes::from(vec![0u8; 4096]))])
        .await
        .unwrap();

    match db.export_to_bytes().await {
        Err(DatabaseError::Corrupt { .. }) => {}
        other => panic!("expected Corrupt, got {:?}", other.map(|v| v.len())),
    }
    db.close().await.unwrap();
    wipe_database(&name);
}
