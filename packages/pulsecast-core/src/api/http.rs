//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to services for business logic.
//! Request bodies carry the wire-format `mode` + content-id pair; the edge
//! converts them into the typed [`StreamSource`] before anything else runs.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::ws::{logs_ws_handler, monitoring_ws_handler};
use crate::api::AppState;
use crate::constants::SERVICE_ID;
use crate::error::{LiveError, LiveResult};
use crate::services::session_manager::StartRequest;
use crate::services::ScheduleRequest;
use crate::store::entities::{
    AssetSource, PlaybackOrder, Recurrence, SessionStatus, StreamSource, TriggerStatus,
};

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ManualLiveRequest {
    stream_key_id: i64,
    mode: String,
    video_id: Option<i64>,
    playlist_id: Option<i64>,
    #[serde(rename = "loop", default = "default_loop")]
    loop_playback: bool,
    #[serde(default)]
    max_duration_hours: u32,
    extra_id: Option<String>,
}

fn default_loop() -> bool {
    true
}

#[derive(Deserialize)]
struct ScheduleLiveRequest {
    stream_key_id: i64,
    #[serde(default = "default_mode")]
    mode: String,
    video_id: Option<i64>,
    playlist_id: Option<i64>,
    scheduled_time: DateTime<Utc>,
    #[serde(rename = "loop", default = "default_loop")]
    loop_playback: bool,
    #[serde(default = "default_recurrence")]
    recurrence: String,
    #[serde(default)]
    max_duration_hours: u32,
}

fn default_mode() -> String {
    "playlist".to_string()
}

fn default_recurrence() -> String {
    "none".to_string()
}

#[derive(Deserialize)]
struct StopByKeyQuery {
    #[serde(default = "default_stop_all")]
    stop_all: bool,
}

fn default_stop_all() -> bool {
    true
}

#[derive(Deserialize)]
struct ScheduleListQuery {
    status: Option<String>,
    stream_key_id: Option<i64>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    status: Option<String>,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    100
}

#[derive(Deserialize)]
struct CreateKeyRequest {
    name: String,
    stream_key: String,
}

#[derive(Deserialize)]
struct CreateAssetRequest {
    name: String,
    path: String,
    #[serde(default)]
    duration_seconds: f64,
    #[serde(default = "default_asset_source")]
    source: String,
}

fn default_asset_source() -> String {
    "uploaded".to_string()
}

#[derive(Deserialize)]
struct PlaylistRequest {
    name: String,
    #[serde(default = "default_playlist_mode")]
    mode: String,
    #[serde(default)]
    asset_ids: Vec<i64>,
}

fn default_playlist_mode() -> String {
    "sequence".to_string()
}

/// Converts a wire-format mode + content pair into the typed source.
fn parse_source(
    mode: &str,
    video_id: Option<i64>,
    playlist_id: Option<i64>,
) -> LiveResult<StreamSource> {
    match mode {
        "single" => video_id
            .map(|asset_id| StreamSource::Single { asset_id })
            .ok_or(LiveError::MissingContentId("video_id required for single mode")),
        "playlist" => playlist_id
            .map(|playlist_id| StreamSource::Playlist { playlist_id })
            .ok_or(LiveError::MissingContentId(
                "playlist_id required for playlist mode",
            )),
        other => Err(LiveError::BadMode(other.to_string())),
    }
}

fn parse_recurrence(raw: &str) -> LiveResult<Recurrence> {
    Recurrence::parse(raw)
        .ok_or_else(|| crate::services::ScheduleError::BadRecurrence(raw.to_string()).into())
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Live session control
        .route("/live/manual", post(start_manual_live))
        .route("/live/stop/{id}", post(stop_live))
        .route("/live/stop-by-key/{key_id}", post(stop_by_stream_key))
        .route("/live/stop-all", post(stop_all_sessions))
        .route("/live/status/{id}", get(get_live_status))
        .route("/live/active", get(get_active_sessions))
        .route("/live/history", get(get_session_history))
        .route("/live/cleanup-orphans", post(cleanup_orphans))
        // Scheduling
        .route("/live/schedule", post(schedule_live))
        .route("/live/schedule/list", get(list_scheduled_lives))
        .route(
            "/live/schedule/{id}",
            put(update_scheduled_live).delete(cancel_scheduled_live),
        )
        // Entity management (thin CRUD over the store)
        .route("/keys", get(list_stream_keys).post(create_stream_key))
        .route("/keys/{id}", delete(retire_stream_key))
        .route("/assets", get(list_assets).post(create_asset))
        .route("/assets/{id}", delete(delete_asset))
        .route("/playlists", get(list_playlists).post(create_playlist))
        .route("/playlists/{id}", put(update_playlist))
        // Streaming endpoints
        .route("/ws/monitoring", get(monitoring_ws_handler))
        .route("/ws/logs/{session_id}", get(logs_ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers — live sessions
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe and service identity.
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "limits": {
            "max_concurrent_streams": state.config.limits.max_concurrent_streams
        }
    }))
}

async fn start_manual_live(
    State(state): State<AppState>,
    Json(req): Json<ManualLiveRequest>,
) -> LiveResult<Json<serde_json::Value>> {
    let source = parse_source(&req.mode, req.video_id, req.playlist_id)?;
    let summary = state
        .manager
        .start_manual(StartRequest {
            stream_key_id: req.stream_key_id,
            source,
            loop_playback: req.loop_playback,
            max_duration_hours: req.max_duration_hours,
            extra_id: req.extra_id,
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "session_id": summary.session_id,
        "stream_key_name": summary.stream_key_name,
        "mode": summary.mode,
        "encoder_pid": summary.encoder_pid,
        "status": "running",
        "message": "Live streaming started successfully",
    })))
}

async fn stop_live(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> LiveResult<Json<serde_json::Value>> {
    let report = state.manager.stop_session(session_id).await?;
    Ok(Json(json!({
        "success": true,
        "session_id": report.session_id,
        "already_stopped": report.already_stopped,
        "duration": report.duration,
    })))
}

async fn stop_by_stream_key(
    State(state): State<AppState>,
    Path(key_id): Path<i64>,
    Query(query): Query<StopByKeyQuery>,
) -> LiveResult<Json<serde_json::Value>> {
    let report = state.manager.stop_by_key(key_id, query.stop_all).await?;
    Ok(Json(json!({
        "success": true,
        "stream_key_id": report.stream_key_id,
        "stream_key_name": report.stream_key_name,
        "stopped_count": report.stopped_sessions.len(),
        "stopped_sessions": report.stopped_sessions,
    })))
}

async fn stop_all_sessions(
    State(state): State<AppState>,
) -> LiveResult<Json<serde_json::Value>> {
    let report = state.manager.stop_all().await?;
    Ok(Json(json!({
        "success": true,
        "stopped_count": report.stopped_count,
        "failed_count": report.failed_count,
        "stopped_sessions": report.stopped_sessions,
        "failed_sessions": report.failed_sessions,
    })))
}

async fn get_live_status(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> LiveResult<Json<serde_json::Value>> {
    Ok(Json(state.manager.session_status(session_id).await?))
}

async fn get_active_sessions(
    State(state): State<AppState>,
) -> LiveResult<Json<serde_json::Value>> {
    let sessions = state.manager.active_sessions()?;
    Ok(Json(json!(sessions
        .iter()
        .map(|s| s.to_json())
        .collect::<Vec<_>>())))
}

async fn get_session_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> LiveResult<Json<serde_json::Value>> {
    // An unrecognized status filter matches nothing.
    let status = match query.status.as_deref() {
        Some(raw) => match SessionStatus::parse(raw) {
            Some(status) => Some(status),
            None => return Ok(Json(json!([]))),
        },
        None => None,
    };
    let sessions = state.store.list_sessions(status, query.limit)?;
    Ok(Json(json!(sessions
        .iter()
        .map(|s| s.to_json())
        .collect::<Vec<_>>())))
}

async fn cleanup_orphans(State(state): State<AppState>) -> LiveResult<Json<serde_json::Value>> {
    let report = state.manager.force_reap_orphans().await?;
    Ok(Json(json!({
        "success": true,
        "killed_count": report.killed_count,
        "orphaned_pids": report.orphaned_pids,
        "interrupted_sessions": report.interrupted_sessions,
    })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers — scheduling
// ─────────────────────────────────────────────────────────────────────────────

fn schedule_request(req: &ScheduleLiveRequest) -> LiveResult<ScheduleRequest> {
    Ok(ScheduleRequest {
        stream_key_id: req.stream_key_id,
        source: parse_source(&req.mode, req.video_id, req.playlist_id)?,
        scheduled_time: req.scheduled_time,
        loop_playback: req.loop_playback,
        recurrence: parse_recurrence(&req.recurrence)?,
        max_duration_hours: req.max_duration_hours,
    })
}

async fn schedule_live(
    State(state): State<AppState>,
    Json(req): Json<ScheduleLiveRequest>,
) -> LiveResult<Json<serde_json::Value>> {
    let trigger = state.scheduler.schedule(schedule_request(&req)?)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Successfully scheduled live for {}", trigger.scheduled_time),
        "schedule_id": trigger.id,
        "job_id": trigger.job_id,
    })))
}

async fn list_scheduled_lives(
    State(state): State<AppState>,
    Query(query): Query<ScheduleListQuery>,
) -> LiveResult<Json<serde_json::Value>> {
    let status = match query.status.as_deref() {
        Some(raw) => match TriggerStatus::parse(raw) {
            Some(status) => Some(status),
            None => return Ok(Json(json!([]))),
        },
        None => None,
    };
    let triggers = state.store.list_triggers(status, query.stream_key_id)?;
    Ok(Json(json!(triggers
        .iter()
        .map(|t| t.to_json())
        .collect::<Vec<_>>())))
}

async fn update_scheduled_live(
    State(state): State<AppState>,
    Path(schedule_id): Path<i64>,
    Json(req): Json<ScheduleLiveRequest>,
) -> LiveResult<Json<serde_json::Value>> {
    let trigger = state
        .scheduler
        .update(schedule_id, schedule_request(&req)?)?;
    Ok(Json(json!({
        "success": true,
        "message": "Schedule updated successfully",
        "schedule_id": trigger.id,
    })))
}

async fn cancel_scheduled_live(
    State(state): State<AppState>,
    Path(schedule_id): Path<i64>,
) -> LiveResult<Json<serde_json::Value>> {
    state.scheduler.cancel(schedule_id)?;
    Ok(Json(json!({
        "success": true,
        "message": "Schedule cancelled successfully",
    })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers — entity management
// ─────────────────────────────────────────────────────────────────────────────

async fn list_stream_keys(State(state): State<AppState>) -> LiveResult<Json<serde_json::Value>> {
    let keys = state.store.list_stream_keys()?;
    Ok(Json(json!(keys.iter().map(|k| k.to_json()).collect::<Vec<_>>())))
}

async fn create_stream_key(
    State(state): State<AppState>,
    Json(req): Json<CreateKeyRequest>,
) -> LiveResult<Json<serde_json::Value>> {
    let key = state.store.create_stream_key(&req.name, &req.stream_key)?;
    Ok(Json(key.to_json()))
}

/// Soft retire: the key row survives (sessions reference it), admission
/// stops accepting it.
async fn retire_stream_key(
    State(state): State<AppState>,
    Path(key_id): Path<i64>,
) -> LiveResult<Json<serde_json::Value>> {
    if !state.store.set_stream_key_active(key_id, false)? {
        return Err(LiveError::Admission(
            crate::store::admission::AdmissionError::UnknownKey(key_id),
        ));
    }
    Ok(Json(json!({ "success": true })))
}

async fn list_assets(State(state): State<AppState>) -> LiveResult<Json<serde_json::Value>> {
    let assets = state.store.list_assets()?;
    Ok(Json(json!(assets)))
}

async fn create_asset(
    State(state): State<AppState>,
    Json(req): Json<CreateAssetRequest>,
) -> LiveResult<Json<serde_json::Value>> {
    let source = AssetSource::parse(&req.source)
        .ok_or_else(|| LiveError::BadMode(req.source.clone()))?;
    let asset = state
        .store
        .create_asset(&req.name, &req.path, req.duration_seconds, source)?;
    Ok(Json(json!(asset)))
}

async fn delete_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<i64>,
) -> LiveResult<Json<serde_json::Value>> {
    if !state.store.delete_asset(asset_id)? {
        return Err(LiveError::UnknownAsset(asset_id));
    }
    Ok(Json(json!({ "success": true })))
}

async fn list_playlists(State(state): State<AppState>) -> LiveResult<Json<serde_json::Value>> {
    let playlists = state.store.list_playlists()?;
    Ok(Json(json!(playlists)))
}

async fn create_playlist(
    State(state): State<AppState>,
    Json(req): Json<PlaylistRequest>,
) -> LiveResult<Json<serde_json::Value>> {
    let order = PlaybackOrder::parse(&req.mode)
        .ok_or_else(|| LiveError::BadMode(req.mode.clone()))?;
    let playlist = state
        .store
        .create_playlist(&req.name, order, &req.asset_ids)?;
    Ok(Json(json!(playlist)))
}

async fn update_playlist(
    State(state): State<AppState>,
    Path(playlist_id): Path<i64>,
    Json(req): Json<PlaylistRequest>,
) -> LiveResult<Json<serde_json::Value>> {
    let order = PlaybackOrder::parse(&req.mode)
        .ok_or_else(|| LiveError::BadMode(req.mode.clone()))?;
    if !state
        .store
        .update_playlist(playlist_id, &req.name, order, &req.asset_ids)?
    {
        return Err(LiveError::UnknownPlaylist(playlist_id));
    }
    Ok(Json(json!({ "success": true })))
}
