//! Top-level session lifecycle API.
//!
//! Composes admission, the store, and the encoder supervisor into the
//! operations the HTTP layer and the scheduler call: start a session, stop
//! by session / key / everything, and reap orphaned encoder processes.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::json;

use crate::config::StreamLimits;
use crate::constants::GRACEFUL_QUIT_TIMEOUT_SECS;
use crate::encoder::{EncoderPlan, EncoderSupervisor, StopMode, StopOutcome};
use crate::error::{LiveError, LiveResult};
use crate::os;
use crate::store::entities::{
    PlaybackOrder, ScheduledTrigger, Session, SessionStatus, StreamSource,
};
use crate::store::{NewSession, SessionStore};

/// Input for a session start.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub stream_key_id: i64,
    pub source: StreamSource,
    pub loop_playback: bool,
    pub max_duration_hours: u32,
    pub extra_id: Option<String>,
}

/// Result of a successful start.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: i64,
    pub stream_key_name: String,
    pub mode: &'static str,
    pub encoder_pid: u32,
}

/// Result of stopping one session.
#[derive(Debug, Clone)]
pub struct StopReport {
    pub session_id: i64,
    pub already_stopped: bool,
    pub duration: String,
}

/// Result of a stop-by-key request.
#[derive(Debug, Clone)]
pub struct KeyStopReport {
    pub stream_key_id: i64,
    pub stream_key_name: String,
    pub stopped_sessions: Vec<i64>,
}

/// Result of stopping everything.
#[derive(Debug, Clone, Default)]
pub struct StopAllReport {
    pub stopped_count: usize,
    pub failed_count: usize,
    pub stopped_sessions: Vec<i64>,
    pub failed_sessions: Vec<i64>,
}

/// Result of an orphan sweep.
#[derive(Debug, Clone, Default)]
pub struct OrphanReport {
    pub killed_count: usize,
    pub orphaned_pids: Vec<u32>,
    pub interrupted_sessions: Vec<i64>,
}

/// Start/stop/query API over sessions.
pub struct SessionManager {
    store: Arc<SessionStore>,
    supervisor: Arc<EncoderSupervisor>,
    limits: StreamLimits,
    encoder_name: String,
}

impl SessionManager {
    pub fn new(
        store: Arc<SessionStore>,
        supervisor: Arc<EncoderSupervisor>,
        limits: StreamLimits,
        encoder_name: String,
    ) -> Self {
        Self {
            store,
            supervisor,
            limits,
            encoder_name,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<EncoderSupervisor> {
        &self.supervisor
    }

    // ─────────────────────────────────────────────────────────────────────
    // Start
    // ─────────────────────────────────────────────────────────────────────

    /// Starts a session: resolve content, admit + persist `starting` in one
    /// transaction, spawn the encoder, mark running.
    pub async fn start_manual(&self, req: StartRequest) -> LiveResult<SessionSummary> {
        let paths = self.resolve_paths(&req.source)?;

        let (session, key) = self.store.admit_and_create(
            &NewSession {
                stream_key_id: req.stream_key_id,
                source: req.source,
                loop_playback: req.loop_playback,
                max_duration_hours: req.max_duration_hours,
                extra_id: req.extra_id.clone(),
            },
            self.limits.max_concurrent_streams,
        )?;

        log::info!(
            "[Sessions] Starting session {} on key '{}' (mode {}, {} asset(s))",
            session.id,
            key.name,
            req.source.mode(),
            paths.len()
        );

        let plan = EncoderPlan::Concat {
            paths,
            loop_playback: req.loop_playback,
        };
        let pid = match self.supervisor.start(session.id, plan, &key.secret) {
            Ok(pid) => pid,
            Err(e) => {
                // The row was committed as `starting`; finalize it so the key
                // and capacity are released.
                let _ = self.store.mark_failed(session.id, Some(&e.to_string()));
                log::error!("[Sessions] Session {} failed to start: {}", session.id, e);
                return Err(e.into());
            }
        };

        self.store.mark_running(session.id, pid)?;
        log::info!(
            "[Sessions] Session {} running (encoder pid {})",
            session.id,
            pid
        );

        Ok(SessionSummary {
            session_id: session.id,
            stream_key_name: key.name,
            mode: req.source.mode(),
            encoder_pid: pid,
        })
    }

    /// Starts a session from a scheduled trigger's content.
    pub async fn start_from_trigger(
        &self,
        trigger: &ScheduledTrigger,
    ) -> LiveResult<SessionSummary> {
        self.start_manual(StartRequest {
            stream_key_id: trigger.stream_key_id,
            source: trigger.source,
            loop_playback: trigger.loop_playback,
            max_duration_hours: trigger.max_duration_hours,
            extra_id: None,
        })
        .await
    }

    /// Resolves a source into an ordered list of file paths.
    ///
    /// Playlists in `random` order are shuffled here, so every (re)start of
    /// a random playlist draws a fresh order; the manifest builder never
    /// reorders.
    pub fn resolve_paths(&self, source: &StreamSource) -> LiveResult<Vec<PathBuf>> {
        match source {
            StreamSource::Single { asset_id } => {
                let asset = self
                    .store
                    .get_asset(*asset_id)?
                    .ok_or(LiveError::UnknownAsset(*asset_id))?;
                Ok(vec![PathBuf::from(asset.path)])
            }
            StreamSource::Playlist { playlist_id } => {
                let playlist = self
                    .store
                    .get_playlist(*playlist_id)?
                    .ok_or(LiveError::UnknownPlaylist(*playlist_id))?;
                if playlist.asset_ids.is_empty() {
                    return Err(LiveError::EmptyPlaylist(*playlist_id));
                }

                let mut paths = Vec::with_capacity(playlist.asset_ids.len());
                for asset_id in &playlist.asset_ids {
                    let asset = self
                        .store
                        .get_asset(*asset_id)?
                        .ok_or(LiveError::UnknownAsset(*asset_id))?;
                    paths.push(PathBuf::from(asset.path));
                }
                if playlist.order == PlaybackOrder::Random {
                    paths.shuffle(&mut rand::thread_rng());
                }
                Ok(paths)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stop
    // ─────────────────────────────────────────────────────────────────────

    /// Stops one session. Stopping an already-terminal session succeeds and
    /// says so.
    pub async fn stop_session(&self, session_id: i64) -> LiveResult<StopReport> {
        let session = self.store.get_session(session_id)?;

        if session.status.is_terminal() {
            log::debug!(
                "[Sessions] Session {} already {}",
                session_id,
                session.status.as_str()
            );
            return Ok(StopReport {
                session_id,
                already_stopped: true,
                duration: session.duration_formatted(),
            });
        }

        let outcome = self.supervisor.stop(session_id, StopMode::Graceful).await?;

        // No registry entry means the process (if any) was inherited from a
        // previous host process; take it down by pid.
        if outcome == StopOutcome::AlreadyStopped {
            if let Some(pid) = session.encoder_pid {
                if os::pid_is_process(pid, &self.encoder_name) {
                    log::info!(
                        "[Sessions] Session {}: stopping inherited encoder pid {}",
                        session_id,
                        pid
                    );
                    os::kill_with_grace(pid, Duration::from_secs(GRACEFUL_QUIT_TIMEOUT_SECS))
                        .await;
                }
            }
        }

        self.store.mark_stopped(session_id)?;
        let stopped = self.store.get_session(session_id)?;
        log::info!(
            "[Sessions] Session {} stopped after {}",
            session_id,
            stopped.duration_formatted()
        );
        Ok(StopReport {
            session_id,
            already_stopped: false,
            duration: stopped.duration_formatted(),
        })
    }

    /// Stops the session(s) bound to a stream key. With `stop_all = false`
    /// only the most recent active session is stopped.
    pub async fn stop_by_key(&self, stream_key_id: i64, stop_all: bool) -> LiveResult<KeyStopReport> {
        let key = self
            .store
            .get_stream_key(stream_key_id)?
            .ok_or(LiveError::Admission(
                crate::store::admission::AdmissionError::UnknownKey(stream_key_id),
            ))?;

        let mut sessions = self.store.active_by_stream_key(stream_key_id)?;
        if !stop_all {
            sessions.truncate(1);
        }

        let mut stopped_sessions = Vec::new();
        for session in sessions {
            match self.stop_session(session.id).await {
                Ok(_) => stopped_sessions.push(session.id),
                Err(e) => log::error!(
                    "[Sessions] Failed to stop session {} for key {}: {}",
                    session.id,
                    stream_key_id,
                    e
                ),
            }
        }

        log::info!(
            "[Sessions] Stopped {} session(s) for key '{}'",
            stopped_sessions.len(),
            key.name
        );
        Ok(KeyStopReport {
            stream_key_id,
            stream_key_name: key.name,
            stopped_sessions,
        })
    }

    /// Stops every active session.
    pub async fn stop_all(&self) -> LiveResult<StopAllReport> {
        let sessions = self.store.active_sessions()?;
        let mut report = StopAllReport::default();

        for session in sessions {
            match self.stop_session(session.id).await {
                Ok(_) => {
                    report.stopped_count += 1;
                    report.stopped_sessions.push(session.id);
                }
                Err(e) => {
                    log::error!("[Sessions] Failed to stop session {}: {}", session.id, e);
                    report.failed_count += 1;
                    report.failed_sessions.push(session.id);
                }
            }
        }
        log::info!(
            "[Sessions] Stop-all: {} stopped, {} failed",
            report.stopped_count,
            report.failed_count
        );
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Orphan reaping
    // ─────────────────────────────────────────────────────────────────────

    /// Kills encoder processes whose pids no active session claims, and
    /// transitions active sessions whose pid is gone to `interrupted`.
    ///
    /// Called on boot (before traffic) and on operator request. Kill
    /// failures are logged and reflected in the count, not raised: cleanup
    /// must not wedge the boot path.
    pub async fn force_reap_orphans(&self) -> LiveResult<OrphanReport> {
        let mut report = OrphanReport::default();

        let active = self.store.active_sessions()?;
        let claimed: HashSet<u32> = active.iter().filter_map(|s| s.encoder_pid).collect();

        for pid in os::list_pids_by_name(&self.encoder_name) {
            if claimed.contains(&pid) {
                continue;
            }
            report.orphaned_pids.push(pid);
            if os::kill_pid(pid) {
                report.killed_count += 1;
                log::warn!("[Sessions] Killed orphaned encoder process {}", pid);
            } else {
                log::error!("[Sessions] Failed to kill orphaned encoder process {}", pid);
            }
        }

        // Sessions claiming a pid that is no longer an encoder process were
        // interrupted by a host restart.
        for session in active {
            if self.supervisor.owns(session.id) {
                continue;
            }
            if !matches!(
                session.status,
                SessionStatus::Running | SessionStatus::Recovering
            ) {
                continue;
            }
            let alive = session
                .encoder_pid
                .map(|pid| os::pid_is_process(pid, &self.encoder_name))
                .unwrap_or(false);
            if !alive {
                match self.store.mark_interrupted(session.id) {
                    Ok(()) => {
                        log::warn!("[Sessions] Session {} marked interrupted", session.id);
                        report.interrupted_sessions.push(session.id);
                    }
                    Err(e) => log::debug!(
                        "[Sessions] Session {} not interruptible: {}",
                        session.id,
                        e
                    ),
                }
            }
        }

        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// One session's row plus the supervisor's live process view.
    pub async fn session_status(&self, session_id: i64) -> LiveResult<serde_json::Value> {
        let session = self.store.get_session(session_id)?;
        let mut body = session.to_json();
        if let Some(status) = self.supervisor.status(session_id).await {
            body["encoder_status"] = json!(status);
        }
        Ok(body)
    }

    /// All active sessions.
    pub fn active_sessions(&self) -> LiveResult<Vec<Session>> {
        Ok(self.store.active_sessions()?)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::EncoderSettings;
    use crate::store::entities::AssetSource;
    use tokio_util::sync::CancellationToken;

    fn manager(dir: &std::path::Path) -> (SessionManager, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        let settings = EncoderSettings {
            binary: PathBuf::from("/bin/sleep"),
            ingest_base_url: "rtmp://ingest.test/live".to_string(),
            log_dir: dir.join("logs"),
            manifest_dir: Some(dir.join("manifests")),
            audio_bitrate: "128k".to_string(),
        };
        let supervisor = Arc::new(EncoderSupervisor::new(
            settings,
            Arc::clone(&store),
            CancellationToken::new(),
        ));
        (
            SessionManager::new(
                Arc::clone(&store),
                supervisor,
                StreamLimits {
                    max_concurrent_streams: 2,
                },
                "sleep".to_string(),
            ),
            store,
        )
    }

    fn seed(store: &SessionStore) -> i64 {
        store
            .create_asset("a", "/media/a.mp4", 10.0, AssetSource::Uploaded)
            .unwrap();
        store
            .create_asset("b", "/media/b.mp4", 10.0, AssetSource::Uploaded)
            .unwrap();
        store.create_stream_key("Main", "main-key-0001").unwrap().id
    }

    #[tokio::test]
    async fn start_single_marks_running_with_pid() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(dir.path());
        let key_id = seed(&store);

        let summary = manager
            .start_manual(StartRequest {
                stream_key_id: key_id,
                source: StreamSource::Single { asset_id: 1 },
                loop_playback: true,
                max_duration_hours: 0,
                extra_id: None,
            })
            .await
            .unwrap();

        let session = store.get_session(summary.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.encoder_pid, Some(summary.encoder_pid));
        assert_eq!(summary.mode, "single");

        manager.stop_session(summary.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn second_start_on_same_key_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(dir.path());
        let key_id = seed(&store);

        let req = StartRequest {
            stream_key_id: key_id,
            source: StreamSource::Single { asset_id: 1 },
            loop_playback: true,
            max_duration_hours: 0,
            extra_id: None,
        };
        let first = manager.start_manual(req.clone()).await.unwrap();
        let err = manager.start_manual(req).await.unwrap_err();
        assert_eq!(err.code(), "key_busy");

        // The first session is untouched by the rejected start.
        assert_eq!(
            store.get_session(first.session_id).unwrap().status,
            SessionStatus::Running
        );
        manager.stop_session(first.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_asset_fails_before_admission() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(dir.path());
        let key_id = seed(&store);

        let err = manager
            .start_manual(StartRequest {
                stream_key_id: key_id,
                source: StreamSource::Single { asset_id: 99 },
                loop_playback: true,
                max_duration_hours: 0,
                extra_id: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_asset");
        assert_eq!(store.count_active().unwrap(), 0);
    }

    #[tokio::test]
    async fn spawn_failure_finalizes_session_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        let settings = EncoderSettings {
            binary: PathBuf::from("/nonexistent/encoder"),
            ingest_base_url: "rtmp://ingest.test/live".to_string(),
            log_dir: dir.path().join("logs"),
            manifest_dir: Some(dir.path().join("manifests")),
            audio_bitrate: "128k".to_string(),
        };
        let supervisor = Arc::new(EncoderSupervisor::new(
            settings,
            Arc::clone(&store),
            CancellationToken::new(),
        ));
        let manager = SessionManager::new(
            Arc::clone(&store),
            supervisor,
            StreamLimits::default(),
            "encoder".to_string(),
        );
        store
            .create_asset("a", "/media/a.mp4", 10.0, AssetSource::Uploaded)
            .unwrap();
        let key_id = store.create_stream_key("Main", "main-key-0001").unwrap().id;

        let err = manager
            .start_manual(StartRequest {
                stream_key_id: key_id,
                source: StreamSource::Single { asset_id: 1 },
                loop_playback: true,
                max_duration_hours: 0,
                extra_id: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "spawn_failed");

        // The starting row was finalized, releasing key and capacity.
        assert_eq!(store.count_active().unwrap(), 0);
        let failed = store.list_sessions(Some(SessionStatus::Failed), 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.is_some());
    }

    #[tokio::test]
    async fn stop_is_idempotent_for_terminal_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(dir.path());
        let key_id = seed(&store);

        let summary = manager
            .start_manual(StartRequest {
                stream_key_id: key_id,
                source: StreamSource::Single { asset_id: 1 },
                loop_playback: true,
                max_duration_hours: 0,
                extra_id: None,
            })
            .await
            .unwrap();

        let first = manager.stop_session(summary.session_id).await.unwrap();
        assert!(!first.already_stopped);
        let second = manager.stop_session(summary.session_id).await.unwrap();
        assert!(second.already_stopped);

        let session = store.get_session(summary.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);
        assert!(session.end_time.unwrap() >= session.start_time);
    }

    #[tokio::test]
    async fn stop_by_key_stops_only_that_key() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(dir.path());
        let key_id = seed(&store);
        let other_key = store.create_stream_key("Other", "other-key-0001").unwrap().id;

        let a = manager
            .start_manual(StartRequest {
                stream_key_id: key_id,
                source: StreamSource::Single { asset_id: 1 },
                loop_playback: true,
                max_duration_hours: 0,
                extra_id: None,
            })
            .await
            .unwrap();
        let b = manager
            .start_manual(StartRequest {
                stream_key_id: other_key,
                source: StreamSource::Single { asset_id: 2 },
                loop_playback: true,
                max_duration_hours: 0,
                extra_id: None,
            })
            .await
            .unwrap();

        let report = manager.stop_by_key(key_id, true).await.unwrap();
        assert_eq!(report.stopped_sessions, vec![a.session_id]);
        assert_eq!(
            store.get_session(b.session_id).unwrap().status,
            SessionStatus::Running
        );
        manager.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn playlist_paths_resolve_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(dir.path());
        seed(&store);
        let playlist = store
            .create_playlist("mix", PlaybackOrder::Sequence, &[2, 1])
            .unwrap();

        let paths = manager
            .resolve_paths(&StreamSource::Playlist {
                playlist_id: playlist.id,
            })
            .unwrap();
        assert_eq!(
            paths,
            vec![PathBuf::from("/media/b.mp4"), PathBuf::from("/media/a.mp4")]
        );
    }

    #[tokio::test]
    async fn empty_playlist_cannot_launch() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(dir.path());
        seed(&store);
        let playlist = store
            .create_playlist("empty", PlaybackOrder::Sequence, &[])
            .unwrap();

        let err = manager
            .resolve_paths(&StreamSource::Playlist {
                playlist_id: playlist.id,
            })
            .unwrap_err();
        assert_eq!(err.code(), "empty_playlist");
    }
}
