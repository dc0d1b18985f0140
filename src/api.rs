// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP API — the collaborator-facing surface (§6 External Interfaces),
//! runs alongside the recording process on the shared Tokio runtime.
//!
//! Endpoints:
//!   GET    /api/streams                         → list Stream Descriptors with live state
//!   POST   /api/streams                         → add_stream (conflict on duplicate id)
//!   DELETE /api/streams/{id}                    → drain and remove a stream
//!   GET    /api/recordings                      → paged Catalog query
//!   GET    /api/recordings/{id}                  → segment metadata
//!   GET    /api/recordings/play/{id}             → serve MP4 bytes (range-aware)
//!   GET    /api/recordings/download/{id}         → same bytes, attachment disposition
//!   DELETE /api/recordings/{id}                  → tombstone + immediate unlink
//!   GET    /api/hls/{stream}/{file}              → live HLS manifest/init/fragment bytes
//!   GET    /api/status                           → system status + counters (JSON)
//!
//! Request/response shape mirrors the teacher's `StatusResponse`/`ListResponse`
//! style (flat JSON via `serde_json::json!` for ad-hoc bodies, typed structs
//! for the stable ones), but the resources underneath are the Manager and
//! Catalog rather than a `ChunkPool`/`SegmentIndex` pair.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{PageCursor, QueryParams, SortOrder, TimeRange};
use crate::config::{Config, StreamDescriptor};
use crate::error::{ErrorKind, NvrError};
use crate::manager::Manager;
use crate::playback;

/// Shared state passed to all handlers.
pub struct AppState {
    pub manager: Manager,
    pub config: std::sync::RwLock<Config>,
    pub config_path: PathBuf,
}

impl IntoResponse for NvrError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidConfig | ErrorKind::Decode => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::CatalogBusy | ErrorKind::DeadlineExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, axum::Json(serde_json::json!({ "error": self.message() }))).into_response()
    }
}

// ──────────────── request / response types ────────────────────────────────

#[derive(Deserialize)]
pub struct RecordingsQuery {
    stream: Option<String>,
    start: Option<i64>,
    end: Option<i64>,
    #[serde(default)]
    event_only: bool,
    after_start: Option<i64>,
    after_id: Option<Uuid>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct StreamStatus {
    id: String,
    name: String,
    url: String,
    enabled: bool,
    state: String,
}

#[derive(Serialize)]
struct StatusResponse {
    streams: Vec<StreamStatus>,
    metrics: crate::metrics::MetricsSnapshot,
}

// ──────────────── router ──────────────────────────────────────────────────

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/streams", get(handle_list_streams).post(handle_add_stream))
        .route("/api/streams/{id}", delete(handle_remove_stream))
        .route("/api/recordings", get(handle_query_recordings))
        .route("/api/recordings/{id}", get(handle_get_recording).delete(handle_delete_recording))
        .route("/api/recordings/play/{id}", get(handle_play_recording))
        .route("/api/recordings/download/{id}", get(handle_download_recording))
        .route("/api/hls/{stream}/{file}", get(handle_hls_file))
        .fallback_service(ServeDir::new("frontend"))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    info!(port, "HTTP API listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
    }
}

// ──────────────── handlers ────────────────────────────────────────────────

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let streams: Vec<StreamStatus> = state
        .manager
        .list()
        .into_iter()
        .map(|(descriptor, live_state)| StreamStatus {
            id: descriptor.id,
            name: descriptor.name,
            url: descriptor.url,
            enabled: descriptor.enabled,
            state: live_state.as_str().to_string(),
        })
        .collect();
    let metrics = state.manager.metrics().snapshot();
    axum::Json(StatusResponse { streams, metrics })
}

async fn handle_list_streams(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let streams: Vec<StreamStatus> = state
        .manager
        .list()
        .into_iter()
        .map(|(descriptor, live_state)| StreamStatus {
            id: descriptor.id,
            name: descriptor.name,
            url: descriptor.url,
            enabled: descriptor.enabled,
            state: live_state.as_str().to_string(),
        })
        .collect();
    let total = streams.len();
    axum::Json(serde_json::json!({ "streams": streams, "total": total }))
}

/// `POST /api/streams` (§6: `add_stream` or idempotent replace, conflict on
/// duplicate name). A duplicate id is treated as a conflict rather than a
/// silent replace: swapping a running quartet out from under itself would
/// need to go through `remove_stream` first anyway, so there is no
/// meaningfully "idempotent" replace short of that.
async fn handle_add_stream(
    State(state): State<Arc<AppState>>,
    axum::Json(descriptor): axum::Json<StreamDescriptor>,
) -> Result<impl IntoResponse, NvrError> {
    state.manager.add_stream(descriptor.clone())?;

    let mut cfg = state.config.write().unwrap();
    cfg.streams.retain(|s| s.id != descriptor.id);
    cfg.streams.push(descriptor.clone());
    if let Err(e) = cfg.save_to_file(&state.config_path) {
        warn!(error = %e, "failed to persist config after add_stream");
    }

    Ok((StatusCode::CREATED, axum::Json(serde_json::json!({ "status": "added", "id": descriptor.id }))))
}

/// `DELETE /api/streams/{id}` (§6: soft-disable then remove, blocks until
/// drained or deadline).
async fn handle_remove_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, NvrError> {
    state.manager.remove_stream(&id, std::time::Duration::from_secs(10)).await?;

    let mut cfg = state.config.write().unwrap();
    cfg.streams.retain(|s| s.id != id);
    if let Err(e) = cfg.save_to_file(&state.config_path) {
        warn!(error = %e, "failed to persist config after remove_stream");
    }

    Ok(axum::Json(serde_json::json!({ "status": "removed", "id": id })))
}

fn query_params_from(params: RecordingsQuery) -> QueryParams {
    let range = match (params.start, params.end) {
        (Some(from_us), Some(to_us)) => Some(TimeRange { from_us, to_us }),
        _ => None,
    };
    let after = match (params.after_start, params.after_id) {
        (Some(start_us), Some(id)) => Some(PageCursor { start_us, id }),
        _ => None,
    };
    QueryParams {
        range,
        stream_id: params.stream,
        event_only: params.event_only,
        order: SortOrder::StartDesc,
        after,
        limit: params.limit.unwrap_or(0),
    }
}

async fn handle_query_recordings(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecordingsQuery>,
) -> Result<impl IntoResponse, NvrError> {
    let page = state.manager.catalog().query(query_params_from(params)).await?;
    Ok(axum::Json(serde_json::json!({
        "rows": page.rows.iter().map(recording_json).collect::<Vec<_>>(),
        "next": page.next.map(|c| serde_json::json!({ "start_us": c.start_us, "id": c.id })),
    })))
}

fn recording_json(row: &crate::catalog::SegmentRow) -> serde_json::Value {
    let s = &row.segment;
    serde_json::json!({
        "id": s.id,
        "stream_id": s.stream_id,
        "start_us": s.start_us,
        "end_us": s.end_us,
        "bytes": s.bytes,
        "frames": s.frames,
        "complete": s.complete,
        "events": row.events.iter().map(|e| serde_json::json!({
            "id": e.id,
            "ts_us": e.ts_us,
            "label": e.label,
            "confidence": e.confidence,
            "bbox": e.bbox.map(|b| serde_json::json!({"x": b.x, "y": b.y, "w": b.w, "h": b.h})),
        })).collect::<Vec<_>>(),
    })
}

async fn handle_get_recording(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, NvrError> {
    let row = state
        .manager
        .catalog()
        .get_segment(id)
        .await?
        .ok_or_else(|| NvrError::NotFound { what: format!("recording {id}") })?;
    Ok(axum::Json(recording_json(&row)))
}

async fn handle_play_recording(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, NvrError> {
    let row = state
        .manager
        .catalog()
        .get_segment(id)
        .await?
        .ok_or_else(|| NvrError::NotFound { what: format!("recording {id}") })?;
    playback::serve_segment(&row.segment, &headers).await
}

async fn handle_download_recording(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, NvrError> {
    let row = state
        .manager
        .catalog()
        .get_segment(id)
        .await?
        .ok_or_else(|| NvrError::NotFound { what: format!("recording {id}") })?;
    playback::download_segment(&row.segment).await
}

/// `DELETE /api/recordings/{id}` (§6: tombstone + unlink). Unlike the
/// background retention sweep, an explicit operator delete does not wait
/// out the grace window: it tombstones at "now" and immediately collects
/// everything tombstoned at or before that same instant, so the file is
/// gone by the time this handler returns.
async fn handle_delete_recording(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, NvrError> {
    let now_us = now_micros();
    state.manager.catalog().tombstone(id, now_us).await?;
    let unlinked = state.manager.catalog().collect_tombstones(now_us).await?;
    info!(recording = %id, unlinked = unlinked.len(), "recording deleted via API");
    Ok(axum::Json(serde_json::json!({ "status": "deleted", "id": id })))
}

fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Serve a file out of one stream's live HLS directory (`init.mp4`,
/// `index.m3u8`, `<n>.m4s`). Path-traversal-guarded: `file` must not contain
/// a path separator, since it's joined directly onto the per-stream
/// directory rather than resolved through the Catalog.
async fn handle_hls_file(
    State(state): State<Arc<AppState>>,
    Path((stream, file)): Path<(String, String)>,
) -> Result<impl IntoResponse, NvrError> {
    if file.contains('/') || file.contains("..") {
        return Err(NvrError::NotFound { what: "hls file".into() });
    }
    let storage_root = state.config.read().unwrap().storage.storage_path.clone();
    let path = storage_root.join("recordings").join("hls").join(&stream).join(&file);

    let content_type = if file.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else {
        "video/mp4"
    };

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| NvrError::NotFound { what: format!("hls file '{file}' for stream '{stream}'") })?;

    Ok((StatusCode::OK, [(axum::http::header::CONTENT_TYPE, content_type)], bytes))
}
