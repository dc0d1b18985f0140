// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

/// Abstract error kind, independent of the underlying cause. Gives API
/// clients and the CLI a stable, matchable category (§7 of the design).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Auth,
    Decode,
    CatalogCorrupt,
    CatalogBusy,
    RingLagged,
    QuotaExceeded,
    InvalidConfig,
    NotFound,
    Conflict,
    DeadlineExceeded,
    Shutdown,
}

#[derive(Debug, Error)]
pub enum NvrError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("GStreamer error: {0}")]
    GStreamer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream '{id}' connection failed: {reason}")]
    StreamConnection { id: String, reason: String },

    #[error("Stream '{id}' authentication failed: {reason}")]
    Auth { id: String, reason: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Chunk storage error: {0}")]
    Storage(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("Catalog is corrupt: {0}")]
    CatalogCorrupt(String),

    #[error("Catalog is busy, retry later")]
    CatalogBusy,

    #[error("Ring buffer lagged, dropped {dropped} packets")]
    RingLagged { dropped: u64 },

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Stream '{id}' not found")]
    StreamNotFound { id: String },

    #[error("'{what}' not found")]
    NotFound { what: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Deadline exceeded waiting for {0}")]
    DeadlineExceeded(String),

    #[error("Shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, NvrError>;

impl NvrError {
    /// Stable category for API responses and retry-policy decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NvrError::Config(_) => ErrorKind::InvalidConfig,
            NvrError::GStreamer(_) => ErrorKind::Io,
            NvrError::Io(_) => ErrorKind::Io,
            NvrError::StreamConnection { .. } => ErrorKind::Io,
            NvrError::Auth { .. } => ErrorKind::Auth,
            NvrError::Decode(_) => ErrorKind::Decode,
            NvrError::Storage(_) => ErrorKind::Io,
            NvrError::Index(_) => ErrorKind::Io,
            NvrError::Catalog(e) => match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::DatabaseBusy =>
                {
                    ErrorKind::CatalogBusy
                }
                _ => ErrorKind::CatalogCorrupt,
            },
            NvrError::CatalogCorrupt(_) => ErrorKind::CatalogCorrupt,
            NvrError::CatalogBusy => ErrorKind::CatalogBusy,
            NvrError::RingLagged { .. } => ErrorKind::RingLagged,
            NvrError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            NvrError::StreamNotFound { .. } => ErrorKind::NotFound,
            NvrError::NotFound { .. } => ErrorKind::NotFound,
            NvrError::Conflict(_) => ErrorKind::Conflict,
            NvrError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            NvrError::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Process exit code for a startup-fatal error (§6: 0 clean, 1
    /// misconfiguration, 2 storage unusable, 3 forced termination).
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::InvalidConfig => 1,
            ErrorKind::Io | ErrorKind::CatalogCorrupt => 2,
            ErrorKind::DeadlineExceeded => 3,
            _ => 1,
        }
    }

    /// Human-readable message suitable for an API response body.
    pub fn message(&self) -> String {
        self.to_string()
    }
}
