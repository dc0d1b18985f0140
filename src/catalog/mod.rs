// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The Recording Catalog (F, §4.6): the single source of truth for what
//! has been recorded and where it lives on disk.
//!
//! Grounded on moonfire-nvr's `db/raw.rs` discipline of named, prepared SQL
//! statements against a single `rusqlite::Connection` — but where moonfire
//! holds that connection behind a mutex shared with async callers, here it
//! is owned exclusively by one dedicated writer thread (the same shape as
//! the teacher's `storage::global_writer` loop: a channel in, a loop that
//! never shares its handle). Every public method is a request sent to that
//! thread and a reply awaited back; nothing outside this module ever touches
//! the `Connection` directly. Single-writer isn't an optimization here, it's
//! how SQLite's locking model is kept simple: one writer, never contended
//! against itself.

mod backup;
mod retention;
mod schema;

pub use backup::{BackupReport, RestoreOutcome};
pub use retention::{spawn_retention_loop, RetentionReport};

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use rusqlite::{named_params, Connection};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::StreamDescriptor;
use crate::error::{NvrError, Result};
use crate::packet::Codec;

/// A single recorded MP4 segment (§3, §4.6).
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: Uuid,
    pub stream_id: String,
    pub path: PathBuf,
    pub start_us: i64,
    pub end_us: i64,
    pub bytes: u64,
    pub frames: u64,
    pub codec: Codec,
    pub complete: bool,
    /// Detection event attached at close time, if the Detection Tap fired
    /// during this segment's window and this is the segment it landed in.
    pub detection_event: Option<DetectionEvent>,
}

/// A detection hit recorded against a segment (§4.4, Open Question ii:
/// bounding boxes are stored normalized to `[0, 1]` against frame width and
/// height, since the catalog never stores frame dimensions per segment).
#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub id: Uuid,
    pub stream_id: String,
    /// Filled in by [`insert_segment`]'s reconciliation pass once the
    /// covering segment is cataloged; `None` until then.
    pub segment_id: Option<Uuid>,
    pub ts_us: i64,
    pub label: String,
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// Half-open microsecond range `[from, to)` used to filter queries.
#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub from_us: i64,
    pub to_us: i64,
}

/// Sort order for [`Catalog::query`]. Default is `start_us desc` (newest
/// first), matching how an operator browses a recording list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    StartDesc,
    StartAsc,
}

/// Opaque pagination cursor: the `(start_us, id)` of the last row returned.
#[derive(Debug, Clone, Copy)]
pub struct PageCursor {
    pub start_us: i64,
    pub id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub range: Option<TimeRange>,
    pub stream_id: Option<String>,
    pub event_only: bool,
    pub order: SortOrder,
    pub after: Option<PageCursor>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct SegmentRow {
    pub segment: Segment,
    pub events: Vec<DetectionEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub rows: Vec<SegmentRow>,
    pub next: Option<PageCursor>,
}

#[derive(Debug, Clone, Default)]
pub struct VacuumReport {
    pub reclaimed_rows: u64,
    pub reclaimed_bytes_estimate: u64,
}

/// `db_path` plus the sibling file/directory names the Catalog manages.
fn backup_path(db_path: &Path) -> PathBuf {
    let mut p = db_path.as_os_str().to_owned();
    p.push(".bak");
    PathBuf::from(p)
}

fn quarantine_path(db_path: &Path) -> PathBuf {
    let mut p = db_path.as_os_str().to_owned();
    p.push(".corrupt");
    PathBuf::from(p)
}

enum Command {
    InsertSegment(Box<Segment>, oneshot::Sender<Result<()>>),
    MarkComplete(Uuid, oneshot::Sender<Result<()>>),
    InsertEvent(Box<DetectionEvent>, oneshot::Sender<Result<()>>),
    Query(Box<QueryParams>, oneshot::Sender<Result<QueryPage>>),
    GetSegment(Uuid, oneshot::Sender<Result<Option<SegmentRow>>>),
    Tombstone(Uuid, i64, oneshot::Sender<Result<()>>),
    CollectTombstones(i64, oneshot::Sender<Result<Vec<PathBuf>>>),
    Vacuum(oneshot::Sender<Result<VacuumReport>>),
    RegisterStreams(Vec<StreamDescriptor>, oneshot::Sender<Result<()>>),
    RetentionCandidates(retention::RetentionQuery, oneshot::Sender<Result<Vec<SegmentRow>>>),
    ExportBackup(PathBuf, oneshot::Sender<Result<BackupReport>>),
    Shutdown,
}

/// Handle to the Recording Catalog. Cheap to clone; every clone talks to the
/// same writer thread.
#[derive(Clone)]
pub struct Catalog {
    cmd_tx: mpsc::UnboundedSender<Command>,
    db_path: PathBuf,
}

impl Catalog {
    /// Open (or create) the catalog at `db_path`. Runs the startup integrity
    /// protocol from §4.6 before handing back a usable handle: verify, and
    /// on corruption, restore from the most recent backup, or quarantine the
    /// unreadable file and start fresh if no backup is valid either.
    pub fn open(db_path: &Path) -> Result<(Self, JoinHandle<()>)> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_verified(db_path)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let path = db_path.to_path_buf();
        let handle = std::thread::Builder::new()
            .name("catalog-writer".into())
            .spawn(move || writer_loop(conn, cmd_rx))
            .map_err(|e| NvrError::Storage(format!("cannot spawn catalog writer thread: {e}")))?;

        Ok((Self { cmd_tx, db_path: db_path.to_path_buf() }, handle))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| NvrError::Shutdown)?;
        rx.await.map_err(|_| NvrError::Shutdown)?
    }

    pub async fn register_streams(&self, streams: &[StreamDescriptor]) -> Result<()> {
        self.call(|tx| Command::RegisterStreams(streams.to_vec(), tx)).await
    }

    pub async fn insert_segment(&self, segment: &Segment) -> Result<()> {
        let segment = segment.clone();
        self.call(|tx| Command::InsertSegment(Box::new(segment), tx)).await
    }

    pub async fn mark_complete(&self, id: Uuid) -> Result<()> {
        self.call(|tx| Command::MarkComplete(id, tx)).await
    }

    pub async fn insert_event(&self, event: &DetectionEvent) -> Result<()> {
        let event = event.clone();
        self.call(|tx| Command::InsertEvent(Box::new(event), tx)).await
    }

    pub async fn query(&self, params: QueryParams) -> Result<QueryPage> {
        self.call(|tx| Command::Query(Box::new(params), tx)).await
    }

    /// Point lookup for a single segment by id, used by the playback and
    /// detail endpoints. Returns `None` for an unknown or tombstoned id.
    pub async fn get_segment(&self, id: Uuid) -> Result<Option<SegmentRow>> {
        self.call(|tx| Command::GetSegment(id, tx)).await
    }

    /// Tombstone a segment at `now_us`: it drops out of `query` results
    /// immediately but its file is not unlinked until
    /// [`Catalog::collect_tombstones`] runs (§4.6 tombstone-then-unlink).
    pub async fn tombstone(&self, id: Uuid, now_us: i64) -> Result<()> {
        self.call(|tx| Command::Tombstone(id, now_us, tx)).await
    }

    /// Unlink the files of every tombstone older than `grace_us` and delete
    /// their rows. Returns the paths that were unlinked so the caller can
    /// log them; unlink errors for individual files are logged and skipped,
    /// not propagated, so one bad path never stalls retention.
    pub async fn collect_tombstones(&self, older_than_us: i64) -> Result<Vec<PathBuf>> {
        let paths = self.call(|tx| Command::CollectTombstones(older_than_us, tx)).await?;
        Ok(paths)
    }

    pub async fn vacuum(&self) -> Result<VacuumReport> {
        self.call(Command::Vacuum).await
    }

    pub(crate) async fn retention_candidates(
        &self,
        query: retention::RetentionQuery,
    ) -> Result<Vec<SegmentRow>> {
        self.call(|tx| Command::RetentionCandidates(query, tx)).await
    }

    /// Export a crash-consistent snapshot to `dest` via SQLite's online
    /// backup API, so a backup taken mid-write is never torn (§4.6).
    pub async fn export_backup(&self, dest: &Path) -> Result<BackupReport> {
        let dest = dest.to_path_buf();
        self.call(|tx| Command::ExportBackup(dest, tx)).await
    }

    /// Restore `db_path` from `backup_path`, verifying the candidate before
    /// swapping it in. Does not require a running catalog: this is called
    /// from `open` before the writer thread exists, and is also exposed for
    /// operator-triggered recovery (`nvrd restore`).
    pub fn restore_backup(db_path: &Path, source: &Path) -> Result<RestoreOutcome> {
        backup::restore_backup(db_path, source)
    }

    /// Offline structural check (`nvr check`), independent of a running
    /// writer thread: opens `db_path` read-only and runs the same
    /// `PRAGMA integrity_check` plus per-table probe used on startup.
    pub fn check_integrity(db_path: &Path) -> Result<()> {
        let conn = Connection::open_with_flags(db_path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        schema::verify_integrity(&conn)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

/// Open `db_path`, verifying integrity and falling back to the sibling
/// `.bak` file, then quarantining the original if neither is usable.
fn open_verified(db_path: &Path) -> Result<Connection> {
    if db_path.exists() {
        match Connection::open(db_path).map_err(NvrError::from).and_then(|c| {
            schema::verify_integrity(&c)?;
            Ok(c)
        }) {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                error!(error = %e, path = %db_path.display(), "catalog failed integrity check");
                let bak = backup_path(db_path);
                if bak.exists() {
                    match backup::restore_backup(db_path, &bak) {
                        Ok(RestoreOutcome::Restored) => {
                            info!("catalog restored from backup");
                            let conn = Connection::open(db_path)?;
                            schema::verify_integrity(&conn)?;
                            return Ok(conn);
                        }
                        Ok(RestoreOutcome::BackupAlsoCorrupt) | Err(_) => {
                            warn!("backup is also corrupt or unreadable, quarantining");
                        }
                    }
                }
                let quarantine = quarantine_path(db_path);
                let _ = std::fs::rename(db_path, &quarantine);
                warn!(quarantine = %quarantine.display(), "corrupt catalog quarantined, starting fresh");
            }
        }
    }
    let conn = Connection::open(db_path)?;
    schema::init_schema(&conn)?;
    Ok(conn)
}

fn writer_loop(mut conn: Connection, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    if let Err(e) = schema::init_schema(&conn) {
        error!(error = %e, "failed to initialize catalog schema");
        return;
    }
    while let Some(cmd) = cmd_rx.blocking_recv() {
        match cmd {
            Command::InsertSegment(seg, reply) => {
                let _ = reply.send(insert_segment(&conn, &seg));
            }
            Command::MarkComplete(id, reply) => {
                let _ = reply.send(mark_complete(&conn, id));
            }
            Command::InsertEvent(event, reply) => {
                let _ = reply.send(insert_event(&conn, &event));
            }
            Command::Query(params, reply) => {
                let _ = reply.send(query(&conn, &params));
            }
            Command::GetSegment(id, reply) => {
                let _ = reply.send(get_segment(&conn, id));
            }
            Command::Tombstone(id, now_us, reply) => {
                let _ = reply.send(tombstone(&conn, id, now_us));
            }
            Command::CollectTombstones(older_than_us, reply) => {
                let _ = reply.send(collect_tombstones(&conn, older_than_us));
            }
            Command::Vacuum(reply) => {
                let _ = reply.send(vacuum(&mut conn));
            }
            Command::RegisterStreams(streams, reply) => {
                let _ = reply.send(register_streams(&conn, &streams));
            }
            Command::RetentionCandidates(q, reply) => {
                let _ = reply.send(retention::select_candidates(&conn, &q));
            }
            Command::ExportBackup(dest, reply) => {
                let _ = reply.send(backup::export_backup(&conn, &dest));
            }
            Command::Shutdown => break,
        }
    }
}

fn register_streams(conn: &Connection, streams: &[StreamDescriptor]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "insert into streams (id, name, url, enabled, priority) values (:id, :name, :url, :enabled, :priority)
             on conflict(id) do update set name = :name, url = :url, enabled = :enabled, priority = :priority",
        )?;
        for s in streams {
            stmt.execute(named_params! {
                ":id": s.id,
                ":name": s.name,
                ":url": s.url,
                ":enabled": s.enabled,
                ":priority": s.priority,
            })?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn codec_str(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "h264",
        Codec::H265 => "h265",
        Codec::Aac => "aac",
        Codec::Unknown => "unknown",
    }
}

fn codec_from_str(s: &str) -> Codec {
    match s {
        "h264" => Codec::H264,
        "h265" => Codec::H265,
        "aac" => Codec::Aac,
        _ => Codec::Unknown,
    }
}

fn insert_segment(conn: &Connection, seg: &Segment) -> Result<()> {
    conn.prepare_cached(
        "insert into segments (id, stream_id, path, start_us, end_us, bytes, frames, codec, complete, tombstone_us)
         values (:id, :stream_id, :path, :start_us, :end_us, :bytes, :frames, :codec, :complete, null)",
    )?
    .execute(named_params! {
        ":id": seg.id.to_string(),
        ":stream_id": seg.stream_id,
        ":path": seg.path.to_string_lossy(),
        ":start_us": seg.start_us,
        ":end_us": seg.end_us,
        ":bytes": seg.bytes,
        ":frames": seg.frames,
        ":codec": codec_str(seg.codec),
        ":complete": seg.complete,
    })?;
    if let Some(event) = &seg.detection_event {
        insert_event(conn, event)?;
    }
    conn.prepare_cached(
        "update events set segment_id = :sid
         where stream_id = :stream and segment_id is null and ts_us >= :start and ts_us < :end",
    )?
    .execute(named_params! {
        ":sid": seg.id.to_string(),
        ":stream": seg.stream_id,
        ":start": seg.start_us,
        ":end": seg.end_us,
    })?;
    Ok(())
}

fn mark_complete(conn: &Connection, id: Uuid) -> Result<()> {
    let changed = conn
        .prepare_cached("update segments set complete = 1 where id = :id")?
        .execute(named_params! { ":id": id.to_string() })?;
    if changed == 0 {
        return Err(NvrError::NotFound { what: format!("segment {id}") });
    }
    Ok(())
}

fn insert_event(conn: &Connection, event: &DetectionEvent) -> Result<()> {
    conn.prepare_cached(
        "insert into events (id, stream_id, segment_id, ts_us, label, confidence, bbox_x, bbox_y, bbox_w, bbox_h)
         values (:id, :stream_id, :segment_id, :ts_us, :label, :confidence, :bx, :by, :bw, :bh)",
    )?
    .execute(named_params! {
        ":id": event.id.to_string(),
        ":stream_id": event.stream_id,
        ":segment_id": event.segment_id.map(|id| id.to_string()),
        ":ts_us": event.ts_us,
        ":label": event.label,
        ":confidence": event.confidence,
        ":bx": event.bbox.map(|b| b.x),
        ":by": event.bbox.map(|b| b.y),
        ":bw": event.bbox.map(|b| b.w),
        ":bh": event.bbox.map(|b| b.h),
    })?;
    Ok(())
}

fn row_to_segment(row: &rusqlite::Row) -> rusqlite::Result<Segment> {
    let id: String = row.get("id")?;
    let path: String = row.get("path")?;
    let codec: String = row.get("codec")?;
    Ok(Segment {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        stream_id: row.get("stream_id")?,
        path: PathBuf::from(path),
        start_us: row.get("start_us")?,
        end_us: row.get("end_us")?,
        bytes: row.get::<_, i64>("bytes")? as u64,
        frames: row.get::<_, i64>("frames")? as u64,
        codec: codec_from_str(&codec),
        complete: row.get("complete")?,
        detection_event: None,
    })
}

fn events_for_segment(conn: &Connection, segment_id: Uuid) -> Result<Vec<DetectionEvent>> {
    let mut stmt = conn.prepare_cached(
        "select id, stream_id, segment_id, ts_us, label, confidence, bbox_x, bbox_y, bbox_w, bbox_h
         from events where segment_id = :id order by ts_us asc",
    )?;
    let rows = stmt.query_map(named_params! { ":id": segment_id.to_string() }, |row| {
        let id: String = row.get(0)?;
        let seg_id: Option<String> = row.get(2)?;
        let bx: Option<f64> = row.get(6)?;
        let by: Option<f64> = row.get(7)?;
        let bw: Option<f64> = row.get(8)?;
        let bh: Option<f64> = row.get(9)?;
        Ok(DetectionEvent {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            stream_id: row.get(1)?,
            segment_id: seg_id.and_then(|s| Uuid::parse_str(&s).ok()),
            ts_us: row.get(3)?,
            label: row.get(4)?,
            confidence: row.get::<_, f64>(5)? as f32,
            bbox: match (bx, by, bw, bh) {
                (Some(x), Some(y), Some(w), Some(h)) => Some(BoundingBox {
                    x: x as f32,
                    y: y as f32,
                    w: w as f32,
                    h: h as f32,
                }),
                _ => None,
            },
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(NvrError::from)
}

fn get_segment(conn: &Connection, id: Uuid) -> Result<Option<SegmentRow>> {
    let mut stmt = conn.prepare_cached(
        "select id, stream_id, path, start_us, end_us, bytes, frames, codec, complete
         from segments where id = :id and tombstone_us is null",
    )?;
    let mut rows = stmt.query(named_params! { ":id": id.to_string() })?;
    let Some(row) = rows.next()? else { return Ok(None) };
    let segment = row_to_segment(row)?;
    let events = events_for_segment(conn, segment.id)?;
    Ok(Some(SegmentRow { segment, events }))
}

fn query(conn: &Connection, params: &QueryParams) -> Result<QueryPage> {
    let limit = if params.limit == 0 { 100 } else { params.limit.min(1000) };
    let desc = matches!(params.order, SortOrder::StartDesc);
    let cmp = if desc { "<" } else { ">" };
    let dir = if desc { "desc" } else { "asc" };

    let mut sql = String::from(
        "select id, stream_id, path, start_us, end_us, bytes, frames, codec, complete
         from segments where tombstone_us is null",
    );
    if params.stream_id.is_some() {
        sql.push_str(" and stream_id = :stream_id");
    }
    if let Some(_r) = params.range {
        sql.push_str(" and start_us < :to_us and end_us > :from_us");
    }
    if params.event_only {
        sql.push_str(" and exists (select 1 from events e where e.segment_id = segments.id)");
    }
    if params.after.is_some() {
        sql.push_str(&format!(" and (start_us, id) {cmp} (:after_start, :after_id)"));
    }
    sql.push_str(&format!(" order by start_us {dir}, id {dir} limit :limit"));

    let mut stmt = conn.prepare_cached(&sql)?;
    let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
    let stream_id_val = params.stream_id.clone();
    if let Some(sid) = &stream_id_val {
        named.push((":stream_id", sid));
    }
    if let Some(r) = &params.range {
        named.push((":to_us", &r.to_us));
        named.push((":from_us", &r.from_us));
    }
    let after_id_str = params.after.map(|a| a.id.to_string());
    if let Some(after) = &params.after {
        named.push((":after_start", &after.start_us));
        named.push((":after_id", after_id_str.as_ref().unwrap()));
    }
    let limit_plus_one = (limit + 1) as i64;
    named.push((":limit", &limit_plus_one));

    let mut rows = stmt.query(named.as_slice())?;
    let mut segments = Vec::new();
    while let Some(row) = rows.next()? {
        segments.push(row_to_segment(row)?);
    }

    let next = if segments.len() > limit {
        segments.truncate(limit);
        segments.last().map(|s| PageCursor { start_us: s.start_us, id: s.id })
    } else {
        None
    };

    let mut sorted = Vec::with_capacity(segments.len());
    for segment in segments {
        let events = events_for_segment(conn, segment.id)?;
        sorted.push(SegmentRow { segment, events });
    }

    Ok(QueryPage { rows: sorted, next })
}

fn tombstone(conn: &Connection, id: Uuid, now_us: i64) -> Result<()> {
    let changed = conn
        .prepare_cached("update segments set tombstone_us = :now where id = :id and tombstone_us is null")?
        .execute(named_params! { ":now": now_us, ":id": id.to_string() })?;
    if changed == 0 {
        return Err(NvrError::NotFound { what: format!("segment {id}") });
    }
    Ok(())
}

fn collect_tombstones(conn: &Connection, older_than_us: i64) -> Result<Vec<PathBuf>> {
    let mut stmt =
        conn.prepare_cached("select id, path from segments where tombstone_us is not null and tombstone_us < :cutoff")?;
    let rows: Vec<(String, String)> = stmt
        .query_map(named_params! { ":cutoff": older_than_us }, |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    let mut unlinked = Vec::with_capacity(rows.len());
    for (id, path) in &rows {
        let path = PathBuf::from(path);
        match std::fs::remove_file(&path) {
            Ok(()) => unlinked.push(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => unlinked.push(path),
            Err(e) => {
                warn!(segment = id, path = %path.display(), error = %e, "failed to unlink tombstoned segment, will retry");
                continue;
            }
        }
        conn.prepare_cached("delete from segments where id = :id")?
            .execute(named_params! { ":id": id })?;
        conn.prepare_cached("delete from events where segment_id = :id")?
            .execute(named_params! { ":id": id })?;
    }
    Ok(unlinked)
}

fn vacuum(conn: &mut Connection) -> Result<VacuumReport> {
    let before: i64 = conn.query_row("select count(*) from segments", [], |r| r.get(0))?;
    conn.execute_batch("vacuum;")?;
    let after: i64 = conn.query_row("select count(*) from segments", [], |r| r.get(0))?;
    Ok(VacuumReport {
        reclaimed_rows: before.saturating_sub(after) as u64,
        reclaimed_bytes_estimate: 0,
    })
}
