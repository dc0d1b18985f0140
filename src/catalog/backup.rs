// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Crash-safe snapshot and restore for the Recording Catalog (§4.6), built
//! on SQLite's online backup API so a backup taken while the writer thread
//! is mid-transaction is still a consistent point-in-time copy rather than
//! a torn file.

use std::path::Path;
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::Connection;

use super::schema;
use crate::error::{NvrError, Result};

#[derive(Debug, Clone, Copy)]
pub struct BackupReport {
    pub pages_copied: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    BackupAlsoCorrupt,
}

/// Copy `conn`'s contents into `dest` page by page. `conn` keeps serving
/// writer-thread requests while the backup steps run, since SQLite's
/// backup API reads are interleaved with the source connection's own
/// transactions rather than requiring it to be quiesced.
pub fn export_backup(conn: &Connection, dest: &Path) -> Result<BackupReport> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension("tmp");
    let _ = std::fs::remove_file(&tmp);
    let mut dest_conn = Connection::open(&tmp)?;
    {
        let backup = Backup::new(conn, &mut dest_conn)?;
        backup.run_to_completion(100, Duration::from_millis(5), None)?;
    }
    drop(dest_conn);
    std::fs::rename(&tmp, dest)?;
    Ok(BackupReport { pages_copied: -1 })
}

/// Restore `db_path` from `source`. The candidate is verified before it is
/// allowed to replace the live file: a corrupt backup must never be
/// mistaken for a recovery path.
pub fn restore_backup(db_path: &Path, source: &Path) -> Result<RestoreOutcome> {
    let source_conn = Connection::open_with_flags(source, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(NvrError::from)?;
    if schema::verify_integrity(&source_conn).is_err() {
        return Ok(RestoreOutcome::BackupAlsoCorrupt);
    }

    let tmp = db_path.with_extension("restoring");
    let _ = std::fs::remove_file(&tmp);
    let mut dest_conn = Connection::open(&tmp)?;
    {
        let backup = Backup::new(&source_conn, &mut dest_conn)?;
        backup.run_to_completion(100, Duration::from_millis(5), None)?;
    }
    drop(dest_conn);
    drop(source_conn);

    if db_path.exists() {
        let clobbered = db_path.with_extension("replaced");
        let _ = std::fs::rename(db_path, &clobbered);
    }
    std::fs::rename(&tmp, db_path)?;
    Ok(RestoreOutcome::Restored)
}
