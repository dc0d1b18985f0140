// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The HLS Writer (C, §4.3): a second, independent consumer of the Packet
//! Ring per stream, producing short fMP4 segments and a sliding-window
//! LL-HLS manifest. The manifest generation keeps the teacher's playlist
//! string-building style (`#EXTM3U`/`#EXT-X-*` via `std::fmt::Write`,
//! LL-HLS `SERVER-CONTROL`/`PRELOAD-HINT` extensions) but this module now
//! also owns writing the segment files themselves and unlinking the ones
//! that fall out of the window — the teacher's version only ever read an
//! in-memory index and never touched the filesystem.

use std::collections::VecDeque;
use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::StreamDescriptor;
use crate::mp4::{write_fragment, write_init_segment};
use crate::packet::Packet;
use crate::ring::{PacketRing, RingEvent};

const TRACK_ID: u32 = 1;
const TIMESCALE: u32 = 1_000_000;

#[derive(Debug, Clone)]
struct LiveSegment {
    sequence: u64,
    path: PathBuf,
    duration_secs: f64,
    created_at: Instant,
}

fn hls_dir(storage_root: &Path, stream_id: &str) -> PathBuf {
    storage_root.join("recordings").join("hls").join(stream_id)
}

/// Runs the HLS writer for one stream until the ring reports end of stream
/// or `cancel` fires. Writes `init.mp4` once, then a rolling set of
/// `<sequence>.m4s` fragments plus `index.m3u8`, keeping only
/// `window_segments` of them live and unlinking the rest after
/// `unlink_grace` has passed (so a client mid-request for a just-evicted
/// segment still gets a 200 instead of racing the unlink).
pub async fn run(
    stream: StreamDescriptor,
    storage_root: PathBuf,
    ring: PacketRing,
    target_segment_duration: Duration,
    window_segments: usize,
    unlink_grace: Duration,
    mut cancel: tokio::sync::watch::Receiver<bool>,
) {
    let dir = hls_dir(&storage_root, &stream.id);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(stream = stream.id, error = %e, "failed to create HLS directory, writer disabled");
        return;
    }

    let init_path = dir.join("init.mp4");
    if let Err(e) = write_init_file(&init_path) {
        warn!(stream = stream.id, error = %e, "failed to write HLS init segment, writer disabled");
        return;
    }

    let mut cursor = ring.subscribe();
    let mut window: VecDeque<LiveSegment> = VecDeque::new();
    let mut retired: VecDeque<LiveSegment> = VecDeque::new();
    let mut sequence: u64 = 0;
    let mut current: Option<OpenSegment> = None;

    loop {
        if *cancel.borrow() {
            break;
        }
        let deadline = Instant::now() + Duration::from_millis(500);
        let event = tokio::select! {
            ev = cursor.next(deadline) => ev,
            _ = cancel.changed() => continue,
        };

        match event {
            RingEvent::Packet(pkt) => {
                // Rotate before writing, not after: a new segment must
                // start with the keyframe that triggers it, so it is
                // independently decodable.
                let should_rotate = pkt.is_key_frame()
                    && current
                        .as_ref()
                        .is_some_and(|s| (pkt.pts_us - s.first_pts_us) as u64 >= target_segment_duration.as_micros() as u64);
                if should_rotate {
                    if let Some(seg) = current.take() {
                        let live = seg.close();
                        sequence += 1;
                        window.push_back(live);
                        while window.len() > window_segments {
                            if let Some(evicted) = window.pop_front() {
                                retired.push_back(evicted);
                            }
                        }
                        if let Err(e) = write_manifest(&dir, target_segment_duration, &window, false) {
                            warn!(stream = stream.id, error = %e, "failed to write HLS manifest");
                        }
                    }
                }

                if current.is_none() {
                    if !pkt.is_key_frame() {
                        continue;
                    }
                    match OpenSegment::create(&dir, sequence, pkt.pts_us) {
                        Ok(seg) => current = Some(seg),
                        Err(e) => {
                            warn!(stream = stream.id, error = %e, "failed to open HLS segment");
                            continue;
                        }
                    }
                }

                if let Some(seg) = current.as_mut() {
                    if let Err(e) = seg.write(&pkt) {
                        warn!(stream = stream.id, error = %e, "failed to write HLS fragment");
                    }
                }
            }
            RingEvent::Lagged { dropped } => {
                info!(stream = stream.id, dropped, "HLS writer lagged, forcing new segment");
                current = None;
            }
            RingEvent::EndOfStream => break,
            RingEvent::Timeout => {}
        }

        retire_expired(&mut retired, unlink_grace);
    }

    if let Some(seg) = current.take() {
        let live = seg.close();
        window.push_back(live);
        while window.len() > window_segments {
            if let Some(evicted) = window.pop_front() {
                retired.push_back(evicted);
            }
        }
    }
    // Final manifest on stream stop carries ENDLIST: no more segments will
    // ever be appended, so a player should treat this as a closed playlist
    // rather than keep polling for a reload.
    if let Err(e) = write_manifest(&dir, target_segment_duration, &window, true) {
        warn!(stream = stream.id, error = %e, "failed to write final HLS manifest");
    }
}

fn retire_expired(retired: &mut VecDeque<LiveSegment>, grace: Duration) {
    while let Some(front) = retired.front() {
        if front.created_at.elapsed() < grace {
            break;
        }
        let seg = retired.pop_front().unwrap();
        if let Err(e) = std::fs::remove_file(&seg.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %seg.path.display(), error = %e, "failed to unlink expired HLS segment");
            }
        }
    }
}

struct OpenSegment {
    path: PathBuf,
    file: std::fs::File,
    sequence_number: u32,
    first_pts_us: i64,
    last_pts_us: i64,
    sequence: u64,
    created_at: Instant,
}

impl OpenSegment {
    fn create(dir: &Path, sequence: u64, first_pts_us: i64) -> std::io::Result<Self> {
        let path = dir.join(format!("{sequence}.m4s"));
        let file = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        Ok(Self {
            path,
            file,
            sequence_number: 0,
            first_pts_us,
            last_pts_us: first_pts_us,
            sequence,
            created_at: Instant::now(),
        })
    }

    fn write(&mut self, pkt: &Packet) -> std::io::Result<()> {
        self.sequence_number += 1;
        write_fragment(&mut self.file, TRACK_ID, self.sequence_number, pkt.pts_us, &pkt.payload)?;
        self.last_pts_us = pkt.pts_us;
        Ok(())
    }

    fn close(self) -> LiveSegment {
        let _ = self.file.sync_all();
        let duration_secs = (self.last_pts_us - self.first_pts_us).max(0) as f64 / 1_000_000.0;
        LiveSegment {
            sequence: self.sequence,
            path: self.path,
            duration_secs: if duration_secs > 0.0 { duration_secs } else { 1.0 },
            created_at: self.created_at,
        }
    }
}

fn write_init_file(path: &Path) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
    write_init_segment(&mut file, TRACK_ID, TIMESCALE)?;
    Ok(())
}

/// Build the manifest text and atomically rename it into place, so a
/// client reading `index.m3u8` mid-write never sees a half-written file.
fn write_manifest(
    dir: &Path,
    target_duration: Duration,
    window: &VecDeque<LiveSegment>,
    endlist: bool,
) -> std::io::Result<()> {
    let target_secs = target_duration.as_secs().max(1);
    let first_seq = window.front().map(|s| s.sequence).unwrap_or(0);

    let mut m3u8 = String::with_capacity(2048);
    writeln!(m3u8, "#EXTM3U").unwrap();
    writeln!(m3u8, "#EXT-X-VERSION:7").unwrap();
    writeln!(m3u8, "#EXT-X-TARGETDURATION:{target_secs}").unwrap();
    writeln!(m3u8, "#EXT-X-MEDIA-SEQUENCE:{first_seq}").unwrap();
    writeln!(m3u8, "#EXT-X-MAP:URI=\"init.mp4\"").unwrap();
    writeln!(
        m3u8,
        "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,HOLD-BACK={:.1}",
        target_secs as f64 * 3.0
    )
    .unwrap();

    for seg in window {
        writeln!(m3u8, "#EXTINF:{:.3},", seg.duration_secs).unwrap();
        writeln!(m3u8, "{}.m4s", seg.sequence).unwrap();
    }

    if endlist {
        writeln!(m3u8, "#EXT-X-ENDLIST").unwrap();
    } else if let Some(last) = window.back() {
        writeln!(
            m3u8,
            "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"{}.m4s\"",
            last.sequence + 1
        )
        .unwrap();
    }

    let tmp = dir.join("index.m3u8.tmp");
    std::fs::write(&tmp, m3u8)?;
    std::fs::rename(&tmp, dir.join("index.m3u8"))?;
    Ok(())
}

/// Build a VOD playlist for a closed time range directly from cataloged
/// segments, referencing the long-form `.mp4` recordings rather than the
/// ephemeral `.m4s` live fragments (those are gone once retired).
pub fn generate_vod_playlist(segments: &[crate::catalog::Segment]) -> Option<String> {
    if segments.is_empty() {
        return None;
    }
    let mut m3u8 = String::with_capacity(1024);
    writeln!(m3u8, "#EXTM3U").unwrap();
    writeln!(m3u8, "#EXT-X-VERSION:7").unwrap();
    let target = segments
        .iter()
        .map(|s| ((s.end_us - s.start_us).max(0) as f64 / 1_000_000.0).ceil() as u64)
        .max()
        .unwrap_or(1);
    writeln!(m3u8, "#EXT-X-TARGETDURATION:{target}").unwrap();
    writeln!(m3u8, "#EXT-X-MEDIA-SEQUENCE:0").unwrap();
    writeln!(m3u8, "#EXT-X-PLAYLIST-TYPE:VOD").unwrap();
    for seg in segments {
        let duration = (seg.end_us - seg.start_us).max(0) as f64 / 1_000_000.0;
        writeln!(m3u8, "#EXTINF:{duration:.3},").unwrap();
        writeln!(m3u8, "/api/recordings/play/{}", seg.id).unwrap();
    }
    writeln!(m3u8, "#EXT-X-ENDLIST").unwrap();
    Some(m3u8)
}
