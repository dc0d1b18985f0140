// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The Lifecycle Manager (G, §4.7): owns the quartet of tasks (reader,
//! segmenter, HLS writer, detection tap) for every stream, enforces the
//! at-most-one-quartet-per-name invariant, and drives the orderly shutdown
//! sequence through the [`crate::shutdown`] coordinator.
//!
//! This replaces the teacher's `RecordingManager`: where that type holds a
//! flat `HashMap<String, WorkerEntry>` and shuts down by calling
//! `JoinHandle::abort()` on everything, this one tracks each stream's state
//! machine explicitly and quiesces in tiers instead of aborting blind.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parking_lot::RwLock as PRwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::config::{Config, StreamDescriptor};
use crate::detect::{DetectionSink, NullSink};
use crate::error::{NvrError, Result};
use crate::lifecycle::StreamState;
use crate::metrics::Metrics;
use crate::ring::PacketRing;
use crate::segmenter::Segmenter;
use crate::shutdown::{join_with_deadline, Component, QuiesceReport, ShutdownCoordinator, Tier};
use crate::{hls, reader};

struct StreamHandle {
    descriptor: StreamDescriptor,
    ring: PacketRing,
    state_rx: watch::Receiver<StreamState>,
    cancel_tx: watch::Sender<bool>,
    reader_task: JoinHandle<()>,
    writer_tasks: Vec<JoinHandle<()>>,
}

/// Tunables the manager needs when spawning a quartet; mirrors the knobs
/// named in [`crate::config::StorageConfig`] plus the detection collaborator.
#[derive(Clone)]
pub struct ManagerParams {
    pub storage_root: PathBuf,
    pub ring_capacity: usize,
    pub segment_duration: Duration,
    pub segment_size_cap_bytes: u64,
    pub hls_segment_duration: Duration,
    pub hls_window_segments: usize,
    pub hls_unlink_grace: Duration,
    /// Delay between tombstoning a long-form segment and unlinking its file
    /// in the retention loop, unrelated to `hls_unlink_grace` above.
    pub retention_unlink_grace: Duration,
    pub detection_cooldown_ms: u64,
}

/// Safety-net rotation size: the segmenter's duration trigger is the
/// primary one, this only matters if the real bitrate wildly exceeds
/// `segmenter::DEFAULT_BPS_ESTIMATE`'s pre-sizing guess.
const SEGMENT_SIZE_CAP_BYTES: u64 = 2 * 1024 * 1024 * 1024;

impl ManagerParams {
    pub fn from_config(config: &Config) -> Self {
        let hls_segment_duration = Duration::from_secs(4);
        Self {
            storage_root: config.storage.storage_path.clone(),
            ring_capacity: (config.storage.buffer_size_kb * 1024 / 4096).max(64),
            segment_duration: Duration::from_secs(config.storage.segment_duration_seconds),
            segment_size_cap_bytes: SEGMENT_SIZE_CAP_BYTES,
            hls_segment_duration,
            hls_window_segments: config.storage.hls_window_segments,
            hls_unlink_grace: hls_segment_duration * 2,
            retention_unlink_grace: Duration::from_secs(60),
            detection_cooldown_ms: config.detection.detection_cooldown_ms,
        }
    }
}

/// Owns every stream quartet. Cloning shares the same underlying state
/// (`Arc`/`parking_lot::RwLock`), matching the teacher's `Arc<RwLock<...>>`
/// sharing idiom for the chunk pool.
#[derive(Clone)]
pub struct Manager {
    streams: Arc<PRwLock<HashMap<String, StreamHandle>>>,
    catalog: Catalog,
    catalog_thread: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
    retention_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    sink: Arc<dyn DetectionSink>,
    params: ManagerParams,
    metrics: Arc<Metrics>,
}

impl Manager {
    /// Open the catalog, register every configured stream, spawn a quartet
    /// for each enabled one, and start the retention loop.
    pub fn new(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.storage.storage_path)
            .map_err(|e| NvrError::Storage(format!("cannot create storage_path: {e}")))?;

        let db_path = config.storage.storage_path.join("catalog.db");
        let (catalog, catalog_thread) = Catalog::open(&db_path)?;

        let params = ManagerParams::from_config(config);
        let manager = Self {
            streams: Arc::new(PRwLock::new(HashMap::new())),
            catalog,
            catalog_thread: Arc::new(Mutex::new(Some(catalog_thread))),
            retention_handle: Arc::new(Mutex::new(None)),
            sink: Arc::new(NullSink),
            params,
            metrics: Metrics::new(),
        };

        Ok(manager)
    }

    /// Swap in a real detection collaborator. Call before `start`; streams
    /// added afterwards pick up whatever sink is current at add time.
    pub fn set_detection_sink(&mut self, sink: Arc<dyn DetectionSink>) {
        self.sink = sink;
    }

    /// In-process counters reported by the `/api/status` endpoint.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Register every configured stream with the catalog and spawn a
    /// quartet for each one with `enabled = true`. Also starts the
    /// retention loop. Call once at startup, after construction.
    pub async fn start(&self, config: &Config) -> Result<()> {
        self.catalog.register_streams(&config.streams).await?;
        for stream in &config.streams {
            if stream.enabled {
                self.add_stream(stream.clone())?;
            }
        }

        let interval = Duration::from_secs(config.storage.retention_interval_secs);
        let max_age = if config.storage.retention_days == 0 {
            None
        } else {
            Some(Duration::from_secs(config.storage.retention_days as u64 * 86400))
        };
        let max_bytes = if config.storage.max_storage_bytes == 0 {
            None
        } else {
            Some(config.storage.max_storage_bytes)
        };
        let handle = crate::catalog::spawn_retention_loop(
            self.catalog.clone(),
            interval,
            max_age,
            max_bytes,
            self.params.retention_unlink_grace,
            self.metrics.clone(),
        );
        *self.retention_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Add and start a new stream quartet. Enforces at-most-one quartet per
    /// stream id (§4.7 invariant).
    pub fn add_stream(&self, descriptor: StreamDescriptor) -> Result<()> {
        let mut streams = self.streams.write();
        if streams.contains_key(&descriptor.id) {
            return Err(NvrError::Conflict(format!("stream '{}' already running", descriptor.id)));
        }

        let ring = PacketRing::new(self.params.ring_capacity);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);

        let reader_task = tokio::spawn({
            let descriptor = descriptor.clone();
            let ring = ring.clone();
            let cancel_rx = cancel_rx.clone();
            let metrics = self.metrics.clone();
            async move {
                let exit = reader::run(descriptor.clone(), ring.clone(), state_tx, cancel_rx, metrics).await;
                info!(stream = descriptor.id, ?exit, "reader exited");
                ring.close();
            }
        });

        let segmenter_task = tokio::spawn({
            let descriptor = descriptor.clone();
            let ring = ring.clone();
            let catalog = self.catalog.clone();
            let segment_duration = self.params.segment_duration;
            let size_cap = self.params.segment_size_cap_bytes;
            let storage_root = self.params.storage_root.clone();
            let metrics = self.metrics.clone();
            async move {
                run_segmenter_driver(descriptor, storage_root, ring, segment_duration, size_cap, catalog, metrics).await;
            }
        });

        let hls_task = tokio::spawn({
            let descriptor = descriptor.clone();
            let ring = ring.clone();
            let storage_root = self.params.storage_root.clone();
            let hls_duration = self.params.hls_segment_duration;
            let window = self.params.hls_window_segments;
            let grace = self.params.hls_unlink_grace;
            let cancel_rx = cancel_rx.clone();
            async move {
                hls::run(descriptor, storage_root, ring, hls_duration, window, grace, cancel_rx).await;
            }
        });

        let detect_task = tokio::spawn({
            let descriptor = descriptor.clone();
            let ring = ring.clone();
            let catalog = self.catalog.clone();
            let sink = self.sink.clone();
            let cooldown_ms = self.params.detection_cooldown_ms;
            let cancel_rx = cancel_rx.clone();
            let metrics = self.metrics.clone();
            async move {
                crate::detect::run(descriptor, cooldown_ms, ring, catalog, sink, cancel_rx, metrics).await;
            }
        });

        streams.insert(
            descriptor.id.clone(),
            StreamHandle {
                descriptor,
                ring,
                state_rx,
                cancel_tx,
                reader_task,
                writer_tasks: vec![segmenter_task, hls_task, detect_task],
            },
        );
        Ok(())
    }

    /// Stop and remove a stream's quartet. Cancels the reader (which closes
    /// the ring once it exits), waits briefly for the writer tasks to drain
    /// what's left, then aborts anything still running past `deadline`.
    pub async fn remove_stream(&self, id: &str, deadline: Duration) -> Result<()> {
        let handle = {
            let mut streams = self.streams.write();
            streams.remove(id).ok_or_else(|| NvrError::StreamNotFound { id: id.to_string() })?
        };
        let _ = handle.cancel_tx.send(true);
        let until = Instant::now() + deadline;
        if join_with_deadline(handle.reader_task, until).await.is_err() {
            warn!(stream = id, "reader task did not stop in time");
        }
        handle.ring.close();
        for task in handle.writer_tasks {
            if join_with_deadline(task, until).await.is_err() {
                warn!(stream = id, "writer task did not stop in time, aborting");
            }
        }
        info!(stream = id, "stream removed");
        Ok(())
    }

    pub fn list(&self) -> Vec<(StreamDescriptor, StreamState)> {
        self.streams
            .read()
            .values()
            .map(|h| (h.descriptor.clone(), *h.state_rx.borrow()))
            .collect()
    }

    pub fn status(&self, id: &str) -> Result<StreamState> {
        self.streams
            .read()
            .get(id)
            .map(|h| *h.state_rx.borrow())
            .ok_or_else(|| NvrError::StreamNotFound { id: id.to_string() })
    }

    /// Drain every quartet through the tiered shutdown coordinator (§4.8):
    /// Manager housekeeping, then Readers, then Writers, then Catalog.
    pub async fn drain(&self, total_deadline: Duration) -> QuiesceReport {
        let per_tier = total_deadline / 4;
        let mut coordinator = ShutdownCoordinator::new(per_tier, total_deadline);

        if let Some(handle) = self.retention_handle.lock().unwrap().take() {
            coordinator.register(Tier::Manager, Arc::new(JoinComponent { name: "retention".into(), handle: Mutex::new(Some(handle)) }));
        }

        let drained: Vec<(String, StreamHandle)> = self.streams.write().drain().collect();
        for (id, handle) in drained {
            let _ = handle.cancel_tx.send(true);
            coordinator.register(
                Tier::Readers,
                Arc::new(JoinComponent { name: format!("reader:{id}"), handle: Mutex::new(Some(handle.reader_task)) }),
            );
            coordinator.register(
                Tier::Writers,
                Arc::new(JoinAllComponent { name: format!("writers:{id}"), handles: Mutex::new(Some(handle.writer_tasks)) }),
            );
        }

        if let Some(thread) = self.catalog_thread.lock().unwrap().take() {
            coordinator.register(
                Tier::Catalog,
                Arc::new(CatalogComponent { catalog: self.catalog.clone(), thread: Mutex::new(Some(thread)) }),
            );
        }

        coordinator.shutdown().await
    }
}

async fn run_segmenter_driver(
    descriptor: StreamDescriptor,
    storage_root: PathBuf,
    ring: PacketRing,
    segment_duration: Duration,
    size_cap_bytes: u64,
    catalog: Catalog,
    metrics: Arc<Metrics>,
) {
    let mut segmenter = Segmenter::new(descriptor.clone(), storage_root, segment_duration, size_cap_bytes);
    let mut cursor = ring.subscribe();
    loop {
        let deadline = Instant::now() + Duration::from_secs(1);
        match cursor.next(deadline).await {
            crate::ring::RingEvent::Packet(pkt) => {
                match segmenter.on_packet(&catalog, &pkt).await {
                    Ok(Some(segment)) => metrics.record_segment_closed(segment.bytes),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(stream = descriptor.id, error = %e, "segmenter error");
                        if segmenter.should_fail_stream() {
                            warn!(stream = descriptor.id, "segmenter giving up after repeated failures");
                            break;
                        }
                    }
                }
            }
            crate::ring::RingEvent::Lagged { dropped } => {
                metrics.record_ring_lag();
                info!(stream = descriptor.id, dropped, "segmenter lagged, rotating");
                let _ = segmenter.on_discontinuity(&catalog).await;
            }
            crate::ring::RingEvent::EndOfStream => {
                let _ = segmenter.on_stop(&catalog).await;
                break;
            }
            crate::ring::RingEvent::Timeout => {}
        }
    }
}

struct JoinComponent {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl Component for JoinComponent {
    fn name(&self) -> &str {
        &self.name
    }
    async fn quiesce(&self, deadline: Instant) -> Result<()> {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            join_with_deadline(handle, deadline).await?;
        }
        Ok(())
    }
}

struct JoinAllComponent {
    name: String,
    handles: Mutex<Option<Vec<JoinHandle<()>>>>,
}

#[async_trait::async_trait]
impl Component for JoinAllComponent {
    fn name(&self) -> &str {
        &self.name
    }
    async fn quiesce(&self, deadline: Instant) -> Result<()> {
        let handles = self.handles.lock().unwrap().take();
        let Some(handles) = handles else { return Ok(()) };
        for handle in handles {
            join_with_deadline(handle, deadline).await?;
        }
        Ok(())
    }
}

struct CatalogComponent {
    catalog: Catalog,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl Component for CatalogComponent {
    fn name(&self) -> &str {
        "catalog"
    }
    async fn quiesce(&self, _deadline: Instant) -> Result<()> {
        self.catalog.shutdown().await;
        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| NvrError::Storage(format!("catalog thread join panicked: {e}")))?
                .map_err(|_| NvrError::Storage("catalog writer thread panicked".into()))?;
        }
        Ok(())
    }
}
