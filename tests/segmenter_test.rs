// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! MP4 Segmenter tests (§4.2, §8 "segment closure"): the state machine only
//! opens a file on a key frame, rotates on duration/size/discontinuity, and
//! every row it hands to the Catalog describes a file whose on-disk length
//! matches `bytes` exactly (the pre-sized file must be truncated back down,
//! not left with trailing padding from the bytes-per-second estimate).

use std::time::Duration;

use bytes::Bytes;
use nvr::catalog::Catalog;
use nvr::config::StreamDescriptor;
use nvr::packet::{Codec, Packet, PacketFlags};
use nvr::segmenter::{Segmenter, SegmenterState};
use tempfile::TempDir;

fn stream() -> StreamDescriptor {
    StreamDescriptor {
        id: "cam1".to_string(),
        name: "cam1".to_string(),
        url: "rtsp://host/cam1".to_string(),
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

fn packet(pts_us: i64, key_frame: bool, payload_len: usize) -> Packet {
    Packet {
        seq: 0,
        pts_us,
        dts_us: pts_us,
        flags: if key_frame { PacketFlags::KEY_FRAME } else { PacketFlags::NONE },
        codec: Codec::H264,
        payload: Bytes::from(vec![0xABu8; payload_len]),
    }
}

async fn open_catalog(dir: &TempDir) -> Catalog {
    let (catalog, _writer) = Catalog::open(&dir.path().join("catalog.db")).unwrap();
    catalog.register_streams(&[stream()]).await.unwrap();
    catalog
}

#[tokio::test]
async fn waits_for_a_keyframe_before_opening_a_file() {
    let dir = TempDir::new().unwrap();
    let catalog = open_catalog(&dir).await;
    let mut seg = Segmenter::new(stream(), dir.path().to_path_buf(), Duration::from_secs(60), u64::MAX);

    assert_eq!(seg.state(), SegmenterState::WaitingForKeyframe);
    let result = seg.on_packet(&catalog, &packet(0, false, 100)).await.unwrap();
    assert!(result.is_none(), "a non-keyframe must not open a segment");
    assert_eq!(seg.state(), SegmenterState::WaitingForKeyframe);

    let result = seg.on_packet(&catalog, &packet(0, true, 100)).await.unwrap();
    assert!(result.is_none(), "opening on a keyframe must not itself close anything");
    assert_eq!(seg.state(), SegmenterState::Writing);
    catalog.shutdown().await;
}

#[tokio::test]
async fn rotating_on_duration_produces_a_file_whose_length_matches_the_catalog_row() {
    let dir = TempDir::new().unwrap();
    let catalog = open_catalog(&dir).await;
    let segment_duration = Duration::from_secs(2);
    let mut seg = Segmenter::new(stream(), dir.path().to_path_buf(), segment_duration, u64::MAX);

    seg.on_packet(&catalog, &packet(0, true, 500)).await.unwrap();
    seg.on_packet(&catalog, &packet(500_000, false, 500)).await.unwrap();
    // This packet's pts is >= 2s past the first, so it must trigger a
    // duration rotation once it's written.
    let closed = seg
        .on_packet(&catalog, &packet(2_100_000, false, 500))
        .await
        .unwrap()
        .expect("duration rotation must close a segment");

    let on_disk = std::fs::metadata(&closed.path).expect("segment file must exist").len();
    assert_eq!(
        on_disk, closed.bytes,
        "the file on disk must not carry trailing padding from the bytes-per-second pre-sizing estimate"
    );
    assert!(on_disk > 0);
    assert_eq!(closed.frames, 3);
    assert_eq!(seg.state(), SegmenterState::WaitingForKeyframe);

    // The catalog must have the row durably, per the `finalize` contract.
    let row = catalog.get_segment(closed.id).await.unwrap().expect("row present after rotation");
    assert_eq!(row.segment.bytes, closed.bytes);
    catalog.shutdown().await;
}

#[tokio::test]
async fn discontinuity_forces_an_early_rotation_and_a_fresh_keyframe_wait() {
    let dir = TempDir::new().unwrap();
    let catalog = open_catalog(&dir).await;
    let mut seg = Segmenter::new(stream(), dir.path().to_path_buf(), Duration::from_secs(900), u64::MAX);

    seg.on_packet(&catalog, &packet(0, true, 200)).await.unwrap();
    seg.on_packet(&catalog, &packet(100_000, false, 200)).await.unwrap();

    let mut discontinuous = packet(200_000, false, 200);
    discontinuous.flags.insert(PacketFlags::DISCONTINUITY);
    let closed = seg
        .on_packet(&catalog, &discontinuous)
        .await
        .unwrap()
        .expect("a discontinuity must close the current segment early");
    assert_eq!(closed.frames, 2, "the packet carrying the discontinuity is not written into the closed segment");

    // The segmenter must require a fresh keyframe before writing resumes.
    assert_eq!(seg.state(), SegmenterState::WaitingForKeyframe);
    let result = seg.on_packet(&catalog, &packet(300_000, false, 200)).await.unwrap();
    assert!(result.is_none());
    assert_eq!(seg.state(), SegmenterState::WaitingForKeyframe);
    catalog.shutdown().await;
}

#[tokio::test]
async fn lifecycle_stop_closes_whatever_is_open() {
    let dir = TempDir::new().unwrap();
    let catalog = open_catalog(&dir).await;
    let mut seg = Segmenter::new(stream(), dir.path().to_path_buf(), Duration::from_secs(900), u64::MAX);

    seg.on_packet(&catalog, &packet(0, true, 300)).await.unwrap();
    let closed = seg.on_stop(&catalog).await.unwrap().expect("on_stop must close the open segment");
    let on_disk = std::fs::metadata(&closed.path).unwrap().len();
    assert_eq!(on_disk, closed.bytes);

    // Calling on_stop again with nothing open must be a no-op.
    assert!(seg.on_stop(&catalog).await.unwrap().is_none());
    catalog.shutdown().await;
}
