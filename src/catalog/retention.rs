// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Background retention loop (§4.6): age- and size-based eviction, weighted
//! by per-stream priority so a low-priority stream's footage is reclaimed
//! before a high-priority one's, even if the high-priority stream is older.
//!
//! Eviction is tombstone-then-unlink-then-collect: a segment is tombstoned
//! (hidden from `query`, but its file left in place) immediately, and only
//! unlinked once it has aged past a grace window. That grace window is what
//! keeps an HLS player or an in-flight download from losing the file out
//! from under it the instant retention decides to reclaim it.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{events_for_segment, row_to_segment, Catalog, SegmentRow};
use crate::error::Result;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy)]
pub struct RetentionQuery {
    pub now_us: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    pub tombstoned: u64,
    pub unlinked: u64,
    pub bytes_reclaimed: u64,
}

/// All non-tombstoned, complete segments in priority-weighted eviction
/// order: lowest stream priority first, then oldest first within a
/// priority tier. The retention loop walks this list and decides, in Rust,
/// how far to go; keeping that decision out of SQL keeps the age/size
/// policy readable and testable without a database.
pub(super) fn select_candidates(conn: &Connection, _query: &RetentionQuery) -> Result<Vec<SegmentRow>> {
    let mut stmt = conn.prepare_cached(
        "select s.id, s.stream_id, s.path, s.start_us, s.end_us, s.bytes, s.frames, s.codec, s.complete
         from segments s
         join streams st on st.id = s.stream_id
         where s.tombstone_us is null and s.complete = 1
         order by st.priority asc, s.start_us asc",
    )?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let segment = row_to_segment(row)?;
        let events = events_for_segment(conn, segment.id)?;
        out.push(SegmentRow { segment, events });
    }
    Ok(out)
}

/// One retention pass: tombstone everything past `max_age` or beyond
/// `max_total_bytes` (walking the priority-weighted candidate order), then
/// unlink anything already tombstoned for longer than `grace`.
async fn run_once(
    catalog: &Catalog,
    now_us: i64,
    max_age_us: Option<i64>,
    max_total_bytes: Option<u64>,
    grace_us: i64,
) -> Result<RetentionReport> {
    let mut report = RetentionReport::default();
    let candidates = catalog.retention_candidates(RetentionQuery { now_us }).await?;

    let mut running_bytes: u64 = candidates.iter().map(|r| r.segment.bytes).sum();
    for row in &candidates {
        let too_old = max_age_us.is_some_and(|max| now_us - row.segment.end_us > max);
        let over_budget = max_total_bytes.is_some_and(|max| running_bytes > max);
        if !too_old && !over_budget {
            continue;
        }
        match catalog.tombstone(row.segment.id, now_us).await {
            Ok(()) => {
                report.tombstoned += 1;
                report.bytes_reclaimed += row.segment.bytes;
                running_bytes = running_bytes.saturating_sub(row.segment.bytes);
                info!(
                    stream = row.segment.stream_id,
                    segment_id = %row.segment.id,
                    too_old,
                    over_budget,
                    "segment tombstoned by retention"
                );
            }
            Err(e) => warn!(segment_id = %row.segment.id, error = %e, "failed to tombstone segment"),
        }
    }

    let unlinked: Vec<PathBuf> = catalog.collect_tombstones(now_us - grace_us).await?;
    report.unlinked = unlinked.len() as u64;
    Ok(report)
}

/// Spawn the periodic retention task. `now_us` is supplied by the caller on
/// each tick (via [`std::time::SystemTime`]) rather than computed inside
/// this module, so the eviction policy itself stays free of wall-clock
/// reads and is unit-testable against `run_once` directly.
pub fn spawn_retention_loop(
    catalog: Catalog,
    interval: Duration,
    max_age: Option<Duration>,
    max_total_bytes: Option<u64>,
    grace: Duration,
    metrics: std::sync::Arc<Metrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now_us = match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
                Ok(d) => d.as_micros() as i64,
                Err(_) => continue,
            };
            let max_age_us = max_age.map(|d| d.as_micros() as i64);
            let grace_us = grace.as_micros() as i64;
            match run_once(&catalog, now_us, max_age_us, max_total_bytes, grace_us).await {
                Ok(report) if report.tombstoned > 0 || report.unlinked > 0 => {
                    metrics.record_retention_pass(report.tombstoned, report.unlinked);
                    info!(
                        tombstoned = report.tombstoned,
                        unlinked = report.unlinked,
                        bytes_reclaimed = report.bytes_reclaimed,
                        "retention pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "retention pass failed"),
            }
        }
    })
}
