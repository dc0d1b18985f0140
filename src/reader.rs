// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The Stream Reader (E, §4.5): owns the GStreamer pipeline for one RTSP
//! source and publishes what it demuxes into the Packet Ring as [`Packet`]s.
//!
//! This is the teacher's `camera.rs` pipeline (`rtspsrc ! depay ! parse !
//! appsink`) generalized two ways: the appsink callback now emits
//! [`Packet`]s carrying real flags and timestamps instead of muxed MPEG-TS
//! bytes, and the connection supervisor implements the reconnect policy in
//! full (full-jitter exponential backoff, a stall timeout independent of
//! GStreamer's own error reporting, and immediate non-retry on
//! authentication failure).

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::StreamDescriptor;
use crate::error::{NvrError, Result};
use crate::lifecycle::StreamState;
use crate::metrics::Metrics;
use crate::packet::{Codec, Packet, PacketFlags};
use crate::ring::PacketRing;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// No packet for this long while connected is treated as a dead connection
/// and forces a reconnect, even if GStreamer hasn't reported an error.
const STALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Full-jitter backoff (§4.5): `sleep = random(0, min(cap, base * 2^attempt))`.
/// Spreads reconnect storms across many streams instead of having them
/// retry in lockstep.
fn backoff_delay(attempt: u32) -> Duration {
    let multiplier: u32 = 1u32 << attempt.min(6);
    let capped = BACKOFF_BASE.saturating_mul(multiplier).min(BACKOFF_CAP);
    let jittered_ms = rand::rng().random_range(0..=capped.as_millis().max(1) as u64);
    Duration::from_millis(jittered_ms)
}

fn classify_gst_error(msg: &str) -> NvrError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("authentication") {
        NvrError::Auth { id: String::new(), reason: msg.to_string() }
    } else {
        NvrError::GStreamer(msg.to_string())
    }
}

/// One GStreamer pipeline bound to a single RTSP source, pushing decoded
/// access units out over an async channel for the supervisor to republish
/// into the ring.
struct Pipeline {
    pipeline: gst::Pipeline,
    rx: mpsc::Receiver<Packet>,
}

impl Pipeline {
    fn connect(stream: &StreamDescriptor) -> Result<Self> {
        gst::init().map_err(|e| NvrError::GStreamer(format!("gst::init: {e}")))?;

        let (tx, rx) = mpsc::channel::<Packet>(256);

        let pipeline_str = format!(
            "rtspsrc location={url} latency=200 protocols=tcp ! \
             rtph264depay ! h264parse config-interval=-1 ! \
             appsink name=sink emit-signals=true max-buffers=64 drop=true sync=false",
            url = stream.url
        );

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| classify_gst_error(&format!("parse_launch: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| NvrError::GStreamer("not a pipeline".into()))?;

        let appsink: gst_app::AppSink = pipeline
            .by_name("sink")
            .ok_or_else(|| NvrError::GStreamer("appsink not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| NvrError::GStreamer("cast to AppSink failed".into()))?;

        let seq = std::sync::atomic::AtomicU64::new(0);
        let tx_clone = tx.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buf = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buf.map_readable().map_err(|_| gst::FlowError::Error)?;

                    let mut flags = PacketFlags::NONE;
                    if !buf.flags().contains(gst::BufferFlags::DELTA_UNIT) {
                        flags.insert(PacketFlags::KEY_FRAME);
                    }
                    let pts_us = buf.pts().map(|t| t.useconds() as i64).unwrap_or(0);
                    let dts_us = buf.dts().map(|t| t.useconds() as i64).unwrap_or(pts_us);
                    let packet = Packet {
                        seq: seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
                        pts_us,
                        dts_us,
                        flags,
                        codec: Codec::H264,
                        payload: bytes::Bytes::copy_from_slice(map.as_slice()),
                    };
                    let _ = tx_clone.try_send(packet);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| NvrError::GStreamer(format!("set_state Playing: {e}")))?;

        Ok(Self { pipeline, rx })
    }

    fn stop(&self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome of one connected session, reported back to the Lifecycle
/// Manager's state machine (§4.7).
#[derive(Debug)]
pub enum ReaderExit {
    /// Told to stop by the caller; not a failure.
    Stopped,
    /// Authentication failed; the manager should not keep retrying blindly.
    AuthFailed { reason: String },
    /// Connection dropped or stalled; caller should back off and retry.
    ConnectionLost { reason: String },
}

/// Runs the reconnect-and-publish loop for `stream` until `cancel` fires.
/// Every successfully read packet is published into `ring`; a lost
/// connection resets the packet sequence only implicitly (the ring itself
/// tags a [`PacketFlags::DISCONTINUITY`] is the segmenter's job, not the
/// reader's — the reader just stops and restarts from attempt 0 on the
/// next successful connect).
pub async fn run(
    stream: StreamDescriptor,
    ring: PacketRing,
    state_tx: tokio::sync::watch::Sender<StreamState>,
    mut cancel: tokio::sync::watch::Receiver<bool>,
    metrics: std::sync::Arc<Metrics>,
) -> ReaderExit {
    let mut attempt: u32 = 0;
    let max_attempts = if stream.max_reconnect_attempts == 0 {
        u32::MAX
    } else {
        stream.max_reconnect_attempts
    };

    loop {
        if *cancel.borrow() {
            let _ = state_tx.send(StreamState::Stopping);
            return ReaderExit::Stopped;
        }
        if attempt >= max_attempts {
            let _ = state_tx.send(StreamState::Failed);
            return ReaderExit::ConnectionLost { reason: "max reconnect attempts reached".into() };
        }

        let _ = state_tx.send(StreamState::Connecting);
        let mut pipeline = match Pipeline::connect(&stream) {
            Ok(p) => {
                attempt = 0;
                info!(stream = stream.id, "stream connected");
                let _ = state_tx.send(StreamState::Running);
                p
            }
            Err(NvrError::Auth { reason, .. }) => {
                error!(stream = stream.id, %reason, "authentication failed, not retrying");
                let _ = state_tx.send(StreamState::Failed);
                return ReaderExit::AuthFailed { reason };
            }
            Err(e) => {
                attempt += 1;
                metrics.record_reader_reconnect();
                let delay = backoff_delay(attempt);
                warn!(stream = stream.id, attempt, ?delay, error = %e, "connect failed, backing off");
                let _ = state_tx.send(StreamState::Backoff);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.changed() => if *cancel.borrow() {
                        let _ = state_tx.send(StreamState::Stopping);
                        return ReaderExit::Stopped
                    },
                }
                continue;
            }
        };

        let mut first_packet_flagged = false;
        let mut disconnected = false;
        loop {
            let recv = timeout(STALL_TIMEOUT, pipeline.rx.recv());
            tokio::select! {
                result = recv => {
                    match result {
                        Ok(Some(mut packet)) => {
                            if !first_packet_flagged {
                                packet.flags.insert(PacketFlags::DISCONTINUITY);
                                first_packet_flagged = true;
                            }
                            ring.publish(packet);
                        }
                        Ok(None) => {
                            warn!(stream = stream.id, "pipeline channel closed, reconnecting");
                            disconnected = true;
                            break;
                        }
                        Err(_elapsed) => {
                            warn!(stream = stream.id, ?STALL_TIMEOUT, "stream stalled, forcing reconnect");
                            disconnected = true;
                            break;
                        }
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        pipeline.stop();
                        let _ = state_tx.send(StreamState::Stopping);
                        return ReaderExit::Stopped;
                    }
                }
            }
        }
        drop(pipeline);

        if disconnected {
            attempt += 1;
            metrics.record_reader_reconnect();
            let delay = backoff_delay(attempt);
            let _ = state_tx.send(StreamState::Backoff);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.changed() => if *cancel.borrow() {
                    let _ = state_tx.send(StreamState::Stopping);
                    return ReaderExit::Stopped
                },
            }
        }
    }
}
