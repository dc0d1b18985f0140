// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! In-process counters exposed via `/api/status`. Not an external metrics
//! system (out of scope, §1 Non-goals name "metrics" only in the sense of a
//! scrape-able collector) — these are ambient bookkeeping the operator
//! endpoint reports, the same role the teacher's `StatusResponse` pool
//! counters played before there was a Catalog to ask instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    segments_closed: AtomicU64,
    bytes_recorded: AtomicU64,
    ring_lag_events: AtomicU64,
    reader_reconnects: AtomicU64,
    detections_recorded: AtomicU64,
    retention_tombstoned: AtomicU64,
    retention_unlinked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct MetricsSnapshot {
    pub segments_closed: u64,
    pub bytes_recorded: u64,
    pub ring_lag_events: u64,
    pub reader_reconnects: u64,
    pub detections_recorded: u64,
    pub retention_tombstoned: u64,
    pub retention_unlinked: u64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_segment_closed(&self, bytes: u64) {
        self.segments_closed.fetch_add(1, Ordering::Relaxed);
        self.bytes_recorded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_ring_lag(&self) {
        self.ring_lag_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reader_reconnect(&self) {
        self.reader_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detection(&self) {
        self.detections_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retention_pass(&self, tombstoned: u64, unlinked: u64) {
        self.retention_tombstoned.fetch_add(tombstoned, Ordering::Relaxed);
        self.retention_unlinked.fetch_add(unlinked, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            segments_closed: self.segments_closed.load(Ordering::Relaxed),
            bytes_recorded: self.bytes_recorded.load(Ordering::Relaxed),
            ring_lag_events: self.ring_lag_events.load(Ordering::Relaxed),
            reader_reconnects: self.reader_reconnects.load(Ordering::Relaxed),
            detections_recorded: self.detections_recorded.load(Ordering::Relaxed),
            retention_tombstoned: self.retention_tombstoned.load(Ordering::Relaxed),
            retention_unlinked: self.retention_unlinked.load(Ordering::Relaxed),
        }
    }
}
