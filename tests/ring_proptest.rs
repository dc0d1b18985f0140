// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Property test for the Packet Ring's ordering invariant (§8 "ring order"):
//! for any producer sequence, a cursor that reads between every publish
//! never lags and observes exactly the published prefix, in order.

use bytes::Bytes;
use nvr::packet::{Codec, Packet, PacketFlags};
use nvr::ring::{PacketRing, RingEvent};
use proptest::prelude::*;
use tokio::time::{Duration, Instant};

fn packet(seq: u64) -> Packet {
    Packet {
        seq,
        pts_us: seq as i64 * 1_000,
        dts_us: seq as i64 * 1_000,
        flags: PacketFlags::NONE,
        codec: Codec::H264,
        payload: Bytes::from(seq.to_be_bytes().to_vec()),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A cursor that consumes one packet per publish, for any capacity and
    /// any publish count, must see every sequence number exactly once and
    /// in order — never lagged, since it never falls behind.
    #[test]
    fn keeping_up_cursor_never_lags(capacity in 1usize..64, count in 0u64..300) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let ring = PacketRing::new(capacity);
            let mut cursor = ring.subscribe();
            for seq in 0..count {
                ring.publish(packet(seq));
                let deadline = Instant::now() + Duration::from_millis(20);
                match cursor.next(deadline).await {
                    RingEvent::Packet(p) => prop_assert_eq!(p.seq, seq),
                    other => prop_assert!(false, "unexpected event for seq {}: {:?}", seq, other),
                }
            }
            Ok(())
        })?;
    }

    /// Whatever the capacity and however far a cursor falls behind, once it
    /// resyncs it never observes a sequence number out of order or twice.
    #[test]
    fn lagging_cursor_still_resyncs_to_a_strictly_increasing_suffix(
        capacity in 1usize..16,
        burst in 1u64..200,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let ring = PacketRing::new(capacity);
            let mut cursor = ring.subscribe();
            for seq in 0..burst {
                ring.publish(packet(seq));
            }
            ring.close();

            let mut last_seen: Option<u64> = None;
            loop {
                let deadline = Instant::now() + Duration::from_millis(20);
                match cursor.next(deadline).await {
                    RingEvent::Packet(p) => {
                        if let Some(prev) = last_seen {
                            prop_assert!(p.seq > prev, "{} did not strictly increase past {}", p.seq, prev);
                        }
                        last_seen = Some(p.seq);
                    }
                    RingEvent::Lagged { dropped } => prop_assert!(dropped > 0),
                    RingEvent::EndOfStream | RingEvent::Timeout => break,
                }
            }
            if burst > 0 {
                prop_assert_eq!(last_seen, Some(burst - 1));
            }
            Ok(())
        })?;
    }
}
