// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Packet Ring invariants (§4.1, §8 "ring order"): every non-lagged cursor
//! observes a strict prefix of the publish order, and a cursor that falls
//! behind resyncs instead of silently skipping or blocking the producer.

use bytes::Bytes;
use nvr::packet::{Codec, Packet, PacketFlags};
use nvr::ring::{PacketRing, RingEvent};
use tokio::time::{Duration, Instant};

fn packet(seq: u64) -> Packet {
    Packet {
        seq,
        pts_us: seq as i64 * 33_000,
        dts_us: seq as i64 * 33_000,
        flags: if seq == 0 { PacketFlags::KEY_FRAME } else { PacketFlags::NONE },
        codec: Codec::H264,
        payload: Bytes::from(seq.to_be_bytes().to_vec()),
    }
}

#[tokio::test]
async fn cursor_that_keeps_up_sees_strict_publish_order() {
    let ring = PacketRing::new(8);
    let mut cursor = ring.subscribe();
    for seq in 0..200u64 {
        ring.publish(packet(seq));
        let deadline = Instant::now() + Duration::from_millis(50);
        match cursor.next(deadline).await {
            RingEvent::Packet(p) => assert_eq!(p.seq, seq, "packets must arrive in publish order"),
            other => panic!("expected Packet({seq}), got {other:?}"),
        }
    }
}

#[tokio::test]
async fn slow_cursor_drops_oldest_and_resyncs_in_order() {
    let ring = PacketRing::new(4);
    let mut cursor = ring.subscribe();

    // Publish well beyond capacity before the consumer ever reads: the
    // producer must never block, so every publish here is drop-oldest.
    for seq in 0..10u64 {
        let outcome = ring.publish(packet(seq));
        if seq >= 4 {
            assert_eq!(outcome, nvr::ring::PublishOutcome::DroppedOldest);
        }
    }

    let deadline = Instant::now() + Duration::from_millis(50);
    let dropped = match cursor.next(deadline).await {
        RingEvent::Lagged { dropped } => dropped,
        other => panic!("expected Lagged, got {other:?}"),
    };
    assert!(dropped > 0, "a cursor that fell behind a full ring must report a lag");

    // After the resync, every further packet must still come back in a
    // strictly increasing sequence — no reordering, no repeats.
    let mut last_seen: Option<u64> = None;
    loop {
        let deadline = Instant::now() + Duration::from_millis(50);
        match cursor.next(deadline).await {
            RingEvent::Packet(p) => {
                if let Some(prev) = last_seen {
                    assert!(p.seq > prev, "resynced cursor must still observe strictly increasing order");
                }
                last_seen = Some(p.seq);
            }
            RingEvent::Timeout => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(last_seen, Some(9), "resynced cursor must eventually reach the last published packet");
}

#[tokio::test]
async fn end_of_stream_is_observed_only_after_the_backlog_drains() {
    let ring = PacketRing::new(16);
    let mut cursor = ring.subscribe();
    for seq in 0..3u64 {
        ring.publish(packet(seq));
    }
    ring.close();

    for seq in 0..3u64 {
        let deadline = Instant::now() + Duration::from_millis(50);
        match cursor.next(deadline).await {
            RingEvent::Packet(p) => assert_eq!(p.seq, seq),
            other => panic!("expected Packet({seq}), got {other:?}"),
        }
    }
    let deadline = Instant::now() + Duration::from_millis(50);
    match cursor.next(deadline).await {
        RingEvent::EndOfStream => {}
        other => panic!("expected EndOfStream once the backlog drained, got {other:?}"),
    }
}

#[tokio::test]
async fn new_cursor_on_an_empty_ring_times_out_without_a_packet() {
    let ring = PacketRing::new(4);
    let mut cursor = ring.subscribe();
    let deadline = Instant::now() + Duration::from_millis(30);
    match cursor.next(deadline).await {
        RingEvent::Timeout => {}
        other => panic!("expected Timeout on an empty ring, got {other:?}"),
    }
}
