//! WebSocket telemetry fan-out.
//!
//! Two channels:
//! - `/ws/monitoring` pushes a status snapshot of all live sessions every
//!   2 seconds, with encoder progress stats scraped from each session's log
//!   tail.
//! - `/ws/logs/{session_id}` streams the last 50 log lines and then follows
//!   appends at ~10 Hz.
//!
//! Every subscriber runs in its own connection task, so a slow or failing
//! send only terminates that subscriber.

use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use serde_json::json;

use crate::api::AppState;
use crate::constants::{
    LOG_FOLLOW_POLL_MS, LOG_TAIL_INITIAL_LINES, SNAPSHOT_INTERVAL_SECS, STATS_SCAN_LINES,
};
use crate::encoder::logs;
use crate::store::entities::SessionStatus;

// ─────────────────────────────────────────────────────────────────────────────
// Monitoring snapshots
// ─────────────────────────────────────────────────────────────────────────────

/// Upgrade handler for `/ws/monitoring`.
pub async fn monitoring_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_monitoring(socket, state))
}

/// Builds one `status_update` document.
fn build_snapshot(state: &AppState) -> serde_json::Value {
    let sessions = match state.store.active_sessions() {
        Ok(sessions) => sessions,
        Err(e) => {
            log::warn!("[WS] Failed to load sessions for snapshot: {}", e);
            Vec::new()
        }
    };

    let mut entries = Vec::with_capacity(sessions.len());
    for session in sessions {
        if !matches!(
            session.status,
            SessionStatus::Running | SessionStatus::Recovering
        ) {
            continue;
        }
        let mut entry = session.to_json();
        entry["runtime_seconds"] =
            json!((Utc::now() - session.start_time).num_seconds().max(0));

        let stats = state
            .supervisor
            .tail_log(session.id, STATS_SCAN_LINES)
            .map(|tail| logs::scrape_stats(&tail))
            .unwrap_or_default();
        entry["stats"] = json!(stats);
        entries.push(entry);
    }

    json!({
        "type": "status_update",
        "sessions": entries,
    })
}

async fn handle_monitoring(mut socket: WebSocket, state: AppState) {
    log::info!("[WS] Monitoring subscriber connected");
    let mut interval = tokio::time::interval(Duration::from_secs(SNAPSHOT_INTERVAL_SECS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let snapshot = build_snapshot(&state);
                let Ok(text) = serde_json::to_string(&snapshot) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Inbound frames (pings, stray text) are ignored.
                    _ => {}
                }
            }
        }
    }
    log::info!("[WS] Monitoring subscriber disconnected");
}

// ─────────────────────────────────────────────────────────────────────────────
// Log tailing
// ─────────────────────────────────────────────────────────────────────────────

/// Upgrade handler for `/ws/logs/{session_id}`.
pub async fn logs_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<i64>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_log_tail(socket, state, session_id))
}

async fn handle_log_tail(mut socket: WebSocket, state: AppState, session_id: i64) {
    let Some(mut log_path) = state.supervisor.log_path(session_id) else {
        let _ = socket
            .send(Message::Text(
                json!({
                    "type": "error",
                    "message": format!("No logs found for session {}", session_id),
                })
                .to_string()
                .into(),
            ))
            .await;
        return;
    };
    log::info!(
        "[WS] Log subscriber attached to session {} ({})",
        session_id,
        log_path.display()
    );

    // Initial backlog: the last 50 lines, plus the current end offset so the
    // follow loop only ships appends.
    let mut offset = std::fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0);
    if let Ok(tail) = logs::tail_file(&log_path, LOG_TAIL_INITIAL_LINES) {
        let backlog = json!({
            "type": "log_tail",
            "session_id": session_id,
            "lines": tail,
        });
        if socket
            .send(Message::Text(backlog.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    let mut interval = tokio::time::interval(Duration::from_millis(LOG_FOLLOW_POLL_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                // The supervisor may have rotated to a fresh file on restart.
                if let Some(current) = state.supervisor.log_path(session_id) {
                    if current != log_path {
                        log_path = current;
                        offset = 0;
                    }
                }
                let (appended, new_offset) = read_appended(&log_path, offset);
                if let Some(text) = appended {
                    let update = json!({
                        "type": "log_append",
                        "session_id": session_id,
                        "data": text,
                    });
                    if socket.send(Message::Text(update.to_string().into())).await.is_err() {
                        break;
                    }
                }
                offset = new_offset;
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    log::info!("[WS] Log subscriber detached from session {}", session_id);
}

/// Reads everything appended past `offset`; returns the new text (if any)
/// and the updated offset.
fn read_appended(path: &std::path::Path, offset: u64) -> (Option<String>, u64) {
    let Ok(mut file) = std::fs::File::open(path) else {
        return (None, offset);
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len <= offset {
        // Truncated files restart from the top.
        return (None, if len < offset { 0 } else { offset });
    }
    if file.seek(SeekFrom::Start(offset)).is_err() {
        return (None, offset);
    }
    let mut buf = String::new();
    match file.read_to_string(&mut buf) {
        Ok(_) if !buf.is_empty() => (Some(buf), len),
        _ => (None, len),
    }
}
