// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The MP4 Segmenter (B, §4.2): accumulates packets into fragmented MP4
//! files rotated by wall-clock duration, size cap, discontinuity, or
//! lifecycle stop request, and registers each closed segment with the
//! Recording Catalog.
//!
//! Box writing is generalized from the teacher's fixed LE record-header
//! writer (`storage::chunk_pool`) into a generic, big-endian ISO-BMFF box
//! writer: every box is `[u32 size][4-byte type][payload]`, nested the way
//! `moof`/`mdat` nest under no parent and `mfhd`/`traf` nest under `moof`.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, Segment};
use crate::config::StreamDescriptor;
use crate::error::{NvrError, Result};
use crate::mp4::{write_fragment, write_init_segment};
use crate::packet::{Codec, Packet};

/// ISO-BMFF track id used for the sole video track every segment carries.
const TRACK_ID: u32 = 1;
/// Every timestamp in this crate is microseconds.
const TIMESCALE: u32 = 1_000_000;

/// Segmenter state machine (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    WaitingForKeyframe,
    Writing,
    Rotating,
    Closing,
}

/// Why a rotation was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    DurationElapsed,
    SizeCap,
    Discontinuity,
    LifecycleStop,
}

struct OpenFile {
    path: PathBuf,
    file: std::fs::File,
    started_at: DateTime<Utc>,
    first_pts_us: i64,
    frame_count: u64,
    bytes_written: u64,
    segment_id: Uuid,
    codec: Codec,
    sequence_number: u32,
}

/// Target bytes-per-second used to pre-size the next file (§4.2).
const DEFAULT_BPS_ESTIMATE: u64 = 2_000_000 / 8;

pub struct Segmenter {
    stream: StreamDescriptor,
    storage_root: PathBuf,
    segment_duration: Duration,
    size_cap_bytes: u64,
    state: SegmenterState,
    open: Option<OpenFile>,
    consecutive_open_failures: u32,
}

impl Segmenter {
    pub fn new(
        stream: StreamDescriptor,
        storage_root: PathBuf,
        segment_duration: Duration,
        size_cap_bytes: u64,
    ) -> Self {
        Self {
            stream,
            storage_root,
            segment_duration,
            size_cap_bytes,
            state: SegmenterState::WaitingForKeyframe,
            open: None,
            consecutive_open_failures: 0,
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    fn segment_dir(&self, when: DateTime<Utc>) -> PathBuf {
        self.storage_root
            .join("recordings")
            .join("mp4")
            .join(&self.stream.id)
            .join(when.format("%Y%m%d").to_string())
    }

    /// Feed one packet through the state machine. Returns the closed
    /// [`Segment`] if this packet triggered a rotation.
    pub async fn on_packet(&mut self, catalog: &Catalog, pkt: &Packet) -> Result<Option<Segment>> {
        if pkt.is_discontinuity() && self.open.is_some() {
            return self.rotate(catalog, RotationReason::Discontinuity).await;
        }

        match self.state {
            SegmenterState::WaitingForKeyframe => {
                if !pkt.is_key_frame() {
                    return Ok(None);
                }
                self.open_new_file(pkt)?;
                self.state = SegmenterState::Writing;
                self.write_packet(pkt)?;
                Ok(None)
            }
            SegmenterState::Writing => {
                self.write_packet(pkt)?;

                let should_rotate_duration = self
                    .open
                    .as_ref()
                    .map(|o| {
                        (pkt.pts_us - o.first_pts_us) as u64
                            >= self.segment_duration.as_micros() as u64
                    })
                    .unwrap_or(false);
                let should_rotate_size = self
                    .open
                    .as_ref()
                    .map(|o| o.bytes_written >= self.size_cap_bytes)
                    .unwrap_or(false);

                if should_rotate_duration {
                    self.rotate(catalog, RotationReason::DurationElapsed).await
                } else if should_rotate_size {
                    self.rotate(catalog, RotationReason::SizeCap).await
                } else {
                    Ok(None)
                }
            }
            SegmenterState::Rotating | SegmenterState::Closing => Ok(None),
        }
    }

    /// Lifecycle stop request (§4.2 rotation trigger d; also closes on
    /// `on_stop` from the consumer capability set, §9).
    pub async fn on_stop(&mut self, catalog: &Catalog) -> Result<Option<Segment>> {
        if self.open.is_some() {
            self.state = SegmenterState::Closing;
            self.rotate(catalog, RotationReason::LifecycleStop).await
        } else {
            Ok(None)
        }
    }

    pub async fn on_discontinuity(&mut self, catalog: &Catalog) -> Result<Option<Segment>> {
        if self.open.is_some() {
            self.rotate(catalog, RotationReason::Discontinuity).await
        } else {
            Ok(None)
        }
    }

    fn open_new_file(&mut self, first_pkt: &Packet) -> Result<()> {
        let started_at = Utc::now();
        let dir = self.segment_dir(started_at);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            self.consecutive_open_failures += 1;
            return Err(NvrError::Storage(format!("create segment dir {dir:?}: {e}")));
        }

        let segment_id = Uuid::now_v7();
        let path = dir.join(format!("{segment_id}.mp4"));
        let target_bytes = self.segment_duration.as_secs() * DEFAULT_BPS_ESTIMATE;

        let file = match std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                self.consecutive_open_failures += 1;
                return Err(NvrError::Storage(format!("open segment file {path:?}: {e}")));
            }
        };
        if let Err(e) = file.set_len(target_bytes.max(4096)) {
            warn!(path = ?path, error = %e, "Failed to pre-size segment file, continuing anyway");
        }

        self.consecutive_open_failures = 0;
        self.open = Some(OpenFile {
            path,
            file,
            started_at,
            first_pts_us: first_pkt.pts_us,
            frame_count: 0,
            bytes_written: 0,
            segment_id,
            codec: first_pkt.codec,
            sequence_number: 0,
        });
        self.write_ftyp_and_moov()?;
        Ok(())
    }

    fn write_ftyp_and_moov(&mut self) -> Result<()> {
        let open = self.open.as_mut().expect("open file");
        let written = write_init_segment(&mut open.file, TRACK_ID, TIMESCALE)
            .map_err(|e| NvrError::Storage(format!("write init segment: {e}")))?;
        open.bytes_written += written;
        Ok(())
    }

    fn write_packet(&mut self, pkt: &Packet) -> Result<()> {
        let open = self.open.as_mut().expect("open file");
        open.sequence_number += 1;
        let seq = open.sequence_number;
        let pts = pkt.pts_us;
        let payload = &pkt.payload;

        let result = write_fragment(&mut open.file, TRACK_ID, seq, pts, payload);

        match result {
            Ok(written) => {
                open.bytes_written += written;
                open.frame_count += 1;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WriteZero => {
                // A short write is fatal to the current file but not the
                // stream (§4.2 failure semantics).
                error!(stream = self.stream.id, "Short write, abandoning segment");
                self.open = None;
                self.state = SegmenterState::WaitingForKeyframe;
                Err(NvrError::Storage("short write".into()))
            }
            Err(e) => Err(NvrError::Io(e)),
        }
    }

    /// Close the current file, fsync it, register it with the Catalog, and
    /// open the next one. The `finalize` contract: this returns only after
    /// the row is durably in the Catalog, or after the Catalog rejects it
    /// (in which case we log and continue per §4.2).
    async fn rotate(
        &mut self,
        catalog: &Catalog,
        reason: RotationReason,
    ) -> Result<Option<Segment>> {
        self.state = SegmenterState::Rotating;
        let Some(open) = self.open.take() else {
            self.state = SegmenterState::WaitingForKeyframe;
            return Ok(None);
        };

        // The file was pre-sized with `set_len` to a bytes-per-second estimate
        // (§4.2 "opens the next file pre-sized at a target bytes-per-second
        // estimate"); truncate back to what was actually written before
        // fsync so the file on disk never carries trailing zero padding.
        if let Err(e) = open.file.set_len(open.bytes_written) {
            warn!(stream = self.stream.id, error = %e, "failed to truncate segment to actual length");
        }
        if let Err(e) = open.file.sync_all() {
            error!(stream = self.stream.id, error = %e, "fsync failed, attempting next segment");
            self.consecutive_open_failures += 1;
            self.state = SegmenterState::WaitingForKeyframe;
            return Err(NvrError::Io(e));
        }

        let end_ts = Utc::now();
        let actual_bytes = std::fs::metadata(&open.path).map(|m| m.len()).unwrap_or(open.bytes_written);

        let segment = Segment {
            id: open.segment_id,
            stream_id: self.stream.id.clone(),
            path: open.path.clone(),
            start_us: open.started_at.timestamp_micros(),
            end_us: end_ts.timestamp_micros(),
            bytes: actual_bytes,
            frames: open.frame_count,
            codec: open.codec,
            complete: true,
            detection_event: None,
        };

        match catalog.insert_segment(&segment).await {
            Ok(()) => {
                info!(
                    stream = self.stream.id,
                    segment_id = %segment.id,
                    bytes = segment.bytes,
                    frames = segment.frames,
                    reason = ?reason,
                    "Segment closed and cataloged"
                );
            }
            Err(e) => {
                error!(stream = self.stream.id, error = %e, "Catalog rejected segment, continuing");
            }
        }

        self.state = if reason == RotationReason::LifecycleStop {
            SegmenterState::Closing
        } else {
            SegmenterState::WaitingForKeyframe
        };
        Ok(Some(segment))
    }

    /// `true` once three consecutive open/write failures have occurred;
    /// the owning quartet (§4.7) transitions the stream to *failed* when
    /// this holds.
    pub fn should_fail_stream(&self) -> bool {
        self.consecutive_open_failures >= 3
    }

    pub fn consecutive_open_failures(&self) -> u32 {
        self.consecutive_open_failures
    }
}
