// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Schema DDL and structural integrity verification for the Recording
//! Catalog (§4.6). Mirrors the logical schema named in the design: a
//! `segments` table, an `events` table, and a `streams` mirror of the
//! authoritative config.

use rusqlite::Connection;

use crate::error::{NvrError, Result};

pub const SCHEMA_SQL: &str = r#"
create table if not exists streams (
    id              text primary key,
    name            text not null,
    url             text not null,
    enabled         integer not null default 1,
    priority        integer not null default 5
);

create table if not exists segments (
    id              text primary key,
    stream_id       text not null,
    path            text not null,
    start_us        integer not null,
    end_us          integer not null,
    bytes           integer not null,
    frames          integer not null,
    codec           text not null,
    complete        integer not null default 0,
    tombstone_us    integer
);

create index if not exists idx_segments_stream_start
    on segments(stream_id, start_us desc);

create index if not exists idx_segments_tombstone
    on segments(tombstone_us) where tombstone_us is not null;

create table if not exists events (
    id              text primary key,
    stream_id       text not null,
    -- Null until reconciled against the segment whose [start_us, end_us)
    -- window contains ts_us; the detection tap does not know the open
    -- segment's id at the moment it records a hit.
    segment_id      text,
    ts_us           integer not null,
    label           text not null,
    confidence      real not null,
    bbox_x          real,
    bbox_y          real,
    bbox_w          real,
    bbox_h          real
);

create index if not exists idx_events_segment
    on events(segment_id);
"#;

/// Every table the structural self-check expects to find (§4.6: "a
/// row-count probe on every known table").
pub const KNOWN_TABLES: &[&str] = &["streams", "segments", "events"];

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Structural self-check: SQLite's own integrity check, plus a row-count
/// probe on every known table (catches a structurally-valid-but-truncated
/// schema that `PRAGMA integrity_check` alone would not flag).
pub fn verify_integrity(conn: &Connection) -> Result<()> {
    let check: String = conn.query_row("pragma integrity_check", [], |r| r.get(0))?;
    if check != "ok" {
        return Err(NvrError::CatalogCorrupt(format!("integrity_check: {check}")));
    }
    for table in KNOWN_TABLES {
        let sql = format!("select count(*) from {table}");
        conn.query_row(&sql, [], |r| r.get::<_, i64>(0))
            .map_err(|e| NvrError::CatalogCorrupt(format!("probe table '{table}': {e}")))?;
    }
    Ok(())
}
