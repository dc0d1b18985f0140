// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The Detection Tap (D, §4.4): a side-consumer of the Packet Ring that
//! offers key frames to an external detection collaborator, throttled so a
//! slow or wedged collaborator can never back up the ring or steal cycles
//! from the Segmenter or HLS Writer. Entirely new relative to the teacher,
//! which has no detection surface at all; the shape (a `Cursor` consumer
//! racing a deadline, same as [`crate::ring::Cursor::next`]) is still the
//! teacher's idiom.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::{BoundingBox, Catalog, DetectionEvent};
use crate::config::StreamDescriptor;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::packet::Packet;
use crate::ring::{PacketRing, RingEvent};

/// A single detection hit, as returned by a [`DetectionSink`]. Bounding box
/// coordinates are normalized to `[0, 1]` against frame width/height.
#[derive(Debug, Clone)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
}

/// The external detection collaborator's contract. Implementations talk to
/// whatever inference engine or remote service actually classifies frames;
/// this crate only calls it, on a budget, and never on the hot path.
#[async_trait::async_trait]
pub trait DetectionSink: Send + Sync {
    async fn detect(&self, stream_id: &str, frame: &Packet) -> Result<Vec<Detection>>;
}

/// A sink that never finds anything; used when detection is disabled for a
/// stream so the tap still runs its loop (and its cooldown bookkeeping)
/// without a real collaborator wired in.
pub struct NullSink;

#[async_trait::async_trait]
impl DetectionSink for NullSink {
    async fn detect(&self, _stream_id: &str, _frame: &Packet) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

/// Time budget for a single `detect` call. A collaborator that blows this
/// has its result discarded for that frame; the next eligible key frame
/// tries again.
const CALL_BUDGET: Duration = Duration::from_millis(2000);

/// Runs the detection tap for one stream until the ring reports end of
/// stream or `cancel` fires. Never holds up the ring: it reads through its
/// own [`crate::ring::Cursor`], same as the HLS writer would, so a slow
/// sink only ever falls behind its own cursor, never the producer.
pub async fn run(
    stream: StreamDescriptor,
    cooldown_ms: u64,
    ring: PacketRing,
    catalog: Catalog,
    sink: std::sync::Arc<dyn DetectionSink>,
    mut cancel: tokio::sync::watch::Receiver<bool>,
    metrics: std::sync::Arc<Metrics>,
) {
    if !stream.detection_enabled {
        return;
    }
    let cooldown_us = AtomicI64::new(0);
    let mut cursor = ring.subscribe();

    loop {
        if *cancel.borrow() {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        let event = tokio::select! {
            ev = cursor.next(deadline) => ev,
            _ = cancel.changed() => continue,
        };

        let packet = match event {
            RingEvent::Packet(p) => p,
            RingEvent::Lagged { dropped } => {
                debug!(stream = stream.id, dropped, "detection tap lagged, resynced");
                continue;
            }
            RingEvent::EndOfStream => return,
            RingEvent::Timeout => continue,
        };

        if !packet.is_key_frame() {
            continue;
        }
        let now_us = packet.pts_us;
        if now_us < cooldown_us.load(Ordering::Relaxed) {
            continue;
        }

        let result = tokio::time::timeout(CALL_BUDGET, sink.detect(&stream.id, &packet)).await;
        let detections = match result {
            Ok(Ok(d)) => d,
            Ok(Err(e)) => {
                warn!(stream = stream.id, error = %e, "detection call failed, discarding frame");
                continue;
            }
            Err(_) => {
                warn!(stream = stream.id, ?CALL_BUDGET, "detection call exceeded budget, discarding frame");
                continue;
            }
        };
        if detections.is_empty() {
            continue;
        }

        cooldown_us.store(now_us + (cooldown_ms * 1000) as i64, Ordering::Relaxed);

        for d in detections {
            let event = DetectionEvent {
                id: Uuid::now_v7(),
                stream_id: stream.id.clone(),
                // Reconciled against the covering segment once the
                // Segmenter catalogs it (catalog::insert_segment).
                segment_id: None,
                ts_us: now_us,
                label: d.label,
                confidence: d.confidence,
                bbox: d.bbox,
            };
            match catalog.insert_event(&event).await {
                Ok(()) => metrics.record_detection(),
                Err(e) => warn!(stream = stream.id, error = %e, "failed to record detection event"),
            }
        }
    }
}
