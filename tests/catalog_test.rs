// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Recording Catalog integration tests (§4.6, §8): durable insert/query,
//! tombstone-then-unlink idempotence, crash-safe backup/restore, and
//! automatic recovery from a corrupted live store.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use nvr::catalog::{Catalog, QueryParams, Segment, SortOrder, TimeRange};
use nvr::config::StreamDescriptor;
use nvr::packet::Codec;
use tempfile::TempDir;
use uuid::Uuid;

fn stream(id: &str) -> StreamDescriptor {
    StreamDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        url: format!("rtsp://host/{id}"),
        enabled: true,
        record: true,
        width: None,
        height: None,
        fps: None,
        priority: 5,
        max_reconnect_attempts: 0,
        detection_enabled: false,
    }
}

fn segment(stream_id: &str, start_us: i64, end_us: i64, path: PathBuf) -> Segment {
    Segment {
        id: Uuid::now_v7(),
        stream_id: stream_id.to_string(),
        path,
        start_us,
        end_us,
        bytes: 4096,
        frames: 30,
        codec: Codec::H264,
        complete: true,
        detection_event: None,
    }
}

async fn open_catalog(dir: &TempDir, name: &str) -> (Catalog, std::thread::JoinHandle<()>) {
    Catalog::open(&dir.path().join(name)).expect("open catalog")
}

#[tokio::test]
async fn insert_and_query_round_trips_a_segment() {
    let dir = TempDir::new().unwrap();
    let (catalog, _writer) = open_catalog(&dir, "catalog.db").await;
    catalog.register_streams(&[stream("cam1")]).await.unwrap();

    let seg = segment("cam1", 1_000_000, 2_000_000, dir.path().join("cam1.mp4"));
    catalog.insert_segment(&seg).await.unwrap();

    let page = catalog
        .query(QueryParams { stream_id: Some("cam1".into()), limit: 10, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 1);
    assert_eq!(page.rows[0].segment.id, seg.id);
    assert_eq!(page.rows[0].segment.start_us, 1_000_000);

    let fetched = catalog.get_segment(seg.id).await.unwrap().expect("segment present");
    assert_eq!(fetched.segment.bytes, seg.bytes);
    catalog.shutdown().await;
}

#[tokio::test]
async fn query_orders_newest_first_by_default_and_paginates() {
    let dir = TempDir::new().unwrap();
    let (catalog, _writer) = open_catalog(&dir, "catalog.db").await;
    catalog.register_streams(&[stream("cam1")]).await.unwrap();

    for i in 0..5i64 {
        let seg = segment("cam1", i * 1_000_000, (i + 1) * 1_000_000, dir.path().join(format!("{i}.mp4")));
        catalog.insert_segment(&seg).await.unwrap();
    }

    let page = catalog
        .query(QueryParams { stream_id: Some("cam1".into()), order: SortOrder::StartDesc, limit: 2, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 2);
    assert!(page.rows[0].segment.start_us > page.rows[1].segment.start_us);
    let next = page.next.expect("more pages remain");

    let page2 = catalog
        .query(QueryParams {
            stream_id: Some("cam1".into()),
            order: SortOrder::StartDesc,
            limit: 2,
            after: Some(next),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page2.rows.len(), 2);
    assert!(page2.rows[0].segment.start_us < page.rows[1].segment.start_us);
    catalog.shutdown().await;
}

#[tokio::test]
async fn query_range_is_half_open() {
    let dir = TempDir::new().unwrap();
    let (catalog, _writer) = open_catalog(&dir, "catalog.db").await;
    catalog.register_streams(&[stream("cam1")]).await.unwrap();

    let seg = segment("cam1", 1_000_000, 2_000_000, dir.path().join("a.mp4"));
    catalog.insert_segment(&seg).await.unwrap();

    // [start, end) of the segment is [1_000_000, 2_000_000); a query range
    // starting exactly at the segment's end must not match it.
    let page = catalog
        .query(QueryParams {
            stream_id: Some("cam1".into()),
            range: Some(TimeRange { from_us: 2_000_000, to_us: 3_000_000 }),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(page.rows.is_empty());

    let page = catalog
        .query(QueryParams {
            stream_id: Some("cam1".into()),
            range: Some(TimeRange { from_us: 1_500_000, to_us: 3_000_000 }),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 1);
    catalog.shutdown().await;
}

#[tokio::test]
async fn tombstone_then_collect_is_idempotent_and_unlinks_the_file() {
    let dir = TempDir::new().unwrap();
    let (catalog, _writer) = open_catalog(&dir, "catalog.db").await;
    catalog.register_streams(&[stream("cam1")]).await.unwrap();

    let path = dir.path().join("tombstoned.mp4");
    std::fs::write(&path, b"fake mp4 bytes").unwrap();
    let seg = segment("cam1", 0, 1_000_000, path.clone());
    catalog.insert_segment(&seg).await.unwrap();

    catalog.tombstone(seg.id, 5_000_000).await.unwrap();
    // Tombstoned rows drop out of query immediately, before the file is unlinked.
    let page = catalog.query(QueryParams { stream_id: Some("cam1".into()), limit: 10, ..Default::default() }).await.unwrap();
    assert!(page.rows.is_empty());
    assert!(path.exists(), "file must survive until collect_tombstones runs");

    let unlinked = catalog.collect_tombstones(10_000_000).await.unwrap();
    assert_eq!(unlinked, vec![path.clone()]);
    assert!(!path.exists());

    // Running it again with nothing left to collect must be a no-op (§8
    // retention idempotence).
    let unlinked_again = catalog.collect_tombstones(10_000_000).await.unwrap();
    assert!(unlinked_again.is_empty());
    catalog.shutdown().await;
}

#[tokio::test]
async fn export_backup_then_restore_yields_identical_query_results() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("catalog.db");
    let (catalog, _writer) = Catalog::open(&db_path).unwrap();
    catalog.register_streams(&[stream("cam1")]).await.unwrap();
    for i in 0..3i64 {
        let seg = segment("cam1", i * 1_000_000, (i + 1) * 1_000_000, dir.path().join(format!("{i}.mp4")));
        catalog.insert_segment(&seg).await.unwrap();
    }

    let before = catalog
        .query(QueryParams { stream_id: Some("cam1".into()), order: SortOrder::StartAsc, limit: 100, ..Default::default() })
        .await
        .unwrap();

    let backup_path = dir.path().join("catalog.db.snapshot");
    catalog.export_backup(&backup_path).await.unwrap();
    catalog.shutdown().await;

    let restored_db = dir.path().join("restored.sqlite3");
    let outcome = Catalog::restore_backup(&restored_db, &backup_path).unwrap();
    assert_eq!(outcome, nvr::catalog::RestoreOutcome::Restored);

    let (restored, _writer2) = Catalog::open(&restored_db).unwrap();
    let after = restored
        .query(QueryParams { stream_id: Some("cam1".into()), order: SortOrder::StartAsc, limit: 100, ..Default::default() })
        .await
        .unwrap();

    assert_eq!(before.rows.len(), after.rows.len());
    for (a, b) in before.rows.iter().zip(after.rows.iter()) {
        assert_eq!(a.segment.id, b.segment.id);
        assert_eq!(a.segment.start_us, b.segment.start_us);
        assert_eq!(a.segment.end_us, b.segment.end_us);
        assert_eq!(a.segment.bytes, b.segment.bytes);
    }
    restored.shutdown().await;
}

#[tokio::test]
async fn corrupt_live_store_is_restored_from_backup_on_open() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("catalog.db");
    let backup_path = PathBuf::from(format!("{}.bak", db_path.display()));

    let (catalog, writer) = Catalog::open(&db_path).unwrap();
    catalog.register_streams(&[stream("cam1")]).await.unwrap();
    let seg = segment("cam1", 0, 1_000_000, dir.path().join("pre-corruption.mp4"));
    catalog.insert_segment(&seg).await.unwrap();
    catalog.export_backup(&backup_path).await.unwrap();
    catalog.shutdown().await;
    drop(catalog);
    writer.join().expect("writer thread exits cleanly on shutdown");

    // Corrupt the live store: overwrite a chunk of bytes well past the
    // SQLite header so the file opens but fails PRAGMA integrity_check.
    {
        let mut f = std::fs::OpenOptions::new().write(true).open(&db_path).unwrap();
        f.seek(SeekFrom::Start(100)).unwrap();
        f.write_all(&[0xDEu8; 32]).unwrap();
    }

    let (recovered, _writer2) = Catalog::open(&db_path).expect("open must auto-restore, not fail");
    let page = recovered
        .query(QueryParams { stream_id: Some("cam1".into()), limit: 10, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 1);
    assert_eq!(page.rows[0].segment.id, seg.id);
    recovered.shutdown().await;
}

#[tokio::test]
async fn corrupt_store_with_no_valid_backup_starts_empty_and_quarantines() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("catalog.db");

    // A file that exists but is not a SQLite database at all.
    std::fs::write(&db_path, b"not a sqlite file, just garbage bytes").unwrap();

    let (catalog, _writer) = Catalog::open(&db_path).expect("open must fall back to a fresh store");
    let page = catalog.query(QueryParams::default()).await.unwrap();
    assert!(page.rows.is_empty());

    let quarantine = PathBuf::from(format!("{}.corrupt", db_path.display()));
    assert!(quarantine.exists(), "the unreadable original should be quarantined, not deleted");
    let mut content = Vec::new();
    std::fs::File::open(&quarantine).unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(content, b"not a sqlite file, just garbage bytes");
    catalog.shutdown().await;
}
