// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Playback and export: turn a cataloged [`crate::catalog::Segment`] (or an
//! HLS live directory) into an HTTP response body.
//!
//! Range-request handling is grounded on the teacher's ferrex sibling
//! example (`stream_handlers.rs`): parse `Range: bytes=start-end`, seek, and
//! stream the rest via `tokio_util::io::ReaderStream` rather than buffering
//! the whole file. The teacher's own `playback.rs` only ever concatenated
//! whole MPEG-TS segments to a file on disk for `nvr export`; this module
//! keeps that export path but adds the HTTP streaming path the new API
//! surface needs.

use std::io::Write;
use std::ops::Range;
use std::path::Path;

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::catalog::Segment;
use crate::error::{NvrError, Result};

/// Parse a single-range `Range: bytes=start-end` header value. Multi-range
/// requests are not supported; callers fall back to a full-body response.
fn parse_range_header(range_str: &str, file_size: u64) -> Option<Range<u64>> {
    let range_part = range_str.strip_prefix("bytes=")?;
    let (start_s, end_s) = range_part.split_once('-')?;

    let start = if start_s.is_empty() {
        let suffix_len: u64 = end_s.parse().ok()?;
        file_size.saturating_sub(suffix_len)
    } else {
        start_s.parse().ok()?
    };

    let end = if end_s.is_empty() {
        file_size.saturating_sub(1)
    } else {
        end_s.parse::<u64>().ok()?.min(file_size.saturating_sub(1))
    };

    if start > end || start >= file_size {
        return None;
    }
    Some(start..end + 1)
}

/// Serve one recorded segment's `.mp4` file, honoring a `Range` header for
/// seeking. The whole-file path sets `Accept-Ranges` so players know they
/// can issue range requests on the next seek.
pub async fn serve_segment(segment: &Segment, headers: &HeaderMap) -> Result<Response> {
    let file = tokio::fs::File::open(&segment.path)
        .await
        .map_err(|e| NvrError::Storage(format!("open segment {:?}: {e}", segment.path)))?;
    let file_size = segment.bytes;

    if let Some(range) = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range_header(v, file_size))
    {
        let mut file = file;
        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(|e| NvrError::Storage(format!("seek segment {:?}: {e}", segment.path)))?;
        let content_length = range.end - range.start;
        let stream = ReaderStream::new(file.take(content_length));

        return Ok(Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::CONTENT_LENGTH, content_length.to_string())
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, range.end - 1, file_size),
            )
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from_stream(stream))
            .expect("well-formed partial content response"));
    }

    let stream = ReaderStream::new(file);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, file_size.to_string())
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::from_stream(stream))
        .expect("well-formed ok response"))
}

/// Serve a segment as an attachment download rather than an inline stream.
pub async fn download_segment(segment: &Segment) -> Result<Response> {
    let file = tokio::fs::File::open(&segment.path)
        .await
        .map_err(|e| NvrError::Storage(format!("open segment {:?}: {e}", segment.path)))?;
    let stream = ReaderStream::new(file);
    let filename = format!("{}_{}.mp4", segment.stream_id, segment.id);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, segment.bytes.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(stream))
        .expect("well-formed download response"))
}

/// Export recorded segments for `stream_id` in `[from, to)` to a single
/// concatenated `.mp4` file (`nvr export`, §6 CLI). This is a convenience
/// for operators pulling an evidentiary clip; it is not how the HTTP API
/// serves playback, which streams one segment file at a time instead.
pub fn export_concatenated(segments: &[Segment], output_path: &Path) -> Result<usize> {
    if segments.is_empty() {
        return Err(NvrError::NotFound { what: "segments in range".into() });
    }

    let mut out = std::fs::File::create(output_path)
        .map_err(|e| NvrError::Storage(format!("create output {output_path:?}: {e}")))?;

    let mut total_bytes: u64 = 0;
    for seg in segments {
        let data = std::fs::read(&seg.path)
            .map_err(|e| NvrError::Storage(format!("read segment {:?}: {e}", seg.path)))?;
        out.write_all(&data)?;
        total_bytes += data.len() as u64;
    }
    out.flush()?;
    info!(
        segments = segments.len(),
        total_bytes,
        output = ?output_path,
        "export complete"
    );
    Ok(segments.len())
}
