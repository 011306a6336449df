//! Periodic health monitoring of active sessions.
//!
//! A single cooperative task wakes every 10 seconds, snapshots the active
//! sessions, and for each one enforces the duration cap, verifies liveness,
//! schedules delayed recovery for dead streams, and applies the stability
//! reset. Decisions are computed from the snapshot; each resulting
//! transition runs in its own short store call, and a session that was
//! stopped in between simply makes that transition fail its from-state
//! assertion.
//!
//! Restart ownership: while the supervisor's registry holds an entry for a
//! session, in-process restarts are the supervisor's job and the monitor
//! keeps its hands off. The monitor's restart path only exists for sessions
//! inherited from a previous host process, where the registry is empty and
//! the stored pid is all we have.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    HEALTH_CHECK_INTERVAL_SECS, MONITOR_RESTART_DELAYS_SECS, STABILITY_RESET_SECS,
};
use crate::encoder::{EncoderPlan, EncoderSupervisor};
use crate::os;
use crate::services::session_manager::SessionManager;
use crate::store::entities::{Session, SessionStatus};
use crate::store::SessionStore;

/// Background monitor over all active sessions.
pub struct HealthMonitor {
    store: Arc<SessionStore>,
    supervisor: Arc<EncoderSupervisor>,
    manager: Arc<SessionManager>,
    encoder_name: String,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<SessionStore>,
        supervisor: Arc<EncoderSupervisor>,
        manager: Arc<SessionManager>,
        encoder_name: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            supervisor,
            manager,
            encoder_name,
            cancel,
        }
    }

    /// Starts the periodic monitoring loop.
    pub fn spawn(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            log::info!("[Monitor] Health monitor started");
            let mut interval =
                tokio::time::interval(Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                this.tick().await;
            }
            log::info!("[Monitor] Health monitor stopped");
        });
    }

    /// One monitoring pass.
    pub async fn tick(&self) {
        let sessions = match self.store.active_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                log::error!("[Monitor] Failed to load active sessions: {}", e);
                return;
            }
        };

        for session in sessions {
            if self.enforce_duration_cap(&session).await {
                continue;
            }
            self.apply_stability_reset(&session);

            // Registry presence decides restart ownership.
            if self.supervisor.owns(session.id) {
                continue;
            }
            if session.status != SessionStatus::Running {
                continue;
            }

            let alive = session
                .encoder_pid
                .map(|pid| os::pid_is_process(pid, &self.encoder_name))
                .unwrap_or(false);
            if !alive {
                self.handle_dead_stream(&session).await;
            }
        }
    }

    /// Stops sessions that exhausted their duration budget. Returns `true`
    /// when the session was handled.
    async fn enforce_duration_cap(&self, session: &Session) -> bool {
        if session.max_duration_hours == 0 {
            return false;
        }
        let elapsed_hours =
            (Utc::now() - session.start_time).num_seconds() as f64 / 3600.0;
        if elapsed_hours < session.max_duration_hours as f64 {
            return false;
        }

        log::info!(
            "[Monitor] Session {} reached max duration ({}h), stopping",
            session.id,
            session.max_duration_hours
        );
        if let Err(e) = self.manager.stop_session(session.id).await {
            log::error!("[Monitor] Failed to stop session {}: {}", session.id, e);
        }
        true
    }

    /// Zeroes the restart counter once a session has been running
    /// continuously for long enough since its last restart.
    fn apply_stability_reset(&self, session: &Session) {
        if session.status != SessionStatus::Running || session.restart_count == 0 {
            return;
        }
        let stable_for = (Utc::now() - session.running_since()).num_seconds();
        if stable_for < STABILITY_RESET_SECS {
            return;
        }

        log::info!(
            "[Monitor] Session {} stable for {}s, resetting restart count",
            session.id,
            stable_for
        );
        if let Err(e) = self.store.reset_restart_count(session.id) {
            log::debug!("[Monitor] Stability reset for session {} skipped: {}", session.id, e);
        }
        self.supervisor.reset_retries(session.id);
    }

    /// A running session whose process is gone: capture the crash reason,
    /// move to `recovering`, and schedule a delayed restart (or finalize as
    /// failed once the delay table is exhausted).
    async fn handle_dead_stream(&self, session: &Session) {
        let last_error = self.supervisor.last_error(session.id);
        let attempt = session.restart_count as usize;

        if attempt >= MONITOR_RESTART_DELAYS_SECS.len() {
            log::error!(
                "[Monitor] Session {} exhausted recovery attempts, marking failed",
                session.id
            );
            if let Err(e) = self.store.mark_failed(session.id, last_error.as_deref()) {
                log::debug!("[Monitor] Session {} already finalized: {}", session.id, e);
            }
            return;
        }

        log::warn!(
            "[Monitor] Session {} found dead, recovery attempt {} in {}s",
            session.id,
            attempt + 1,
            MONITOR_RESTART_DELAYS_SECS[attempt]
        );
        if let Err(e) = self
            .store
            .mark_recovering(session.id, last_error.as_deref())
        {
            // Stopped in between; nothing to recover.
            log::debug!("[Monitor] Session {} not recoverable: {}", session.id, e);
            return;
        }

        let delay = Duration::from_secs(MONITOR_RESTART_DELAYS_SECS[attempt]);
        let store = Arc::clone(&self.store);
        let supervisor = Arc::clone(&self.supervisor);
        let manager = Arc::clone(&self.manager);
        let cancel = self.cancel.clone();
        let session_id = session.id;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            restart_session(store, supervisor, manager, session_id).await;
        });
    }
}

/// Delayed restart body: re-checks intent, re-resolves content (random
/// playlists draw a fresh order), and respawns through the supervisor.
async fn restart_session(
    store: Arc<SessionStore>,
    supervisor: Arc<EncoderSupervisor>,
    manager: Arc<SessionManager>,
    session_id: i64,
) {
    let session = match store.get_session(session_id) {
        Ok(s) => s,
        Err(e) => {
            log::error!("[Monitor] Session {} vanished before restart: {}", session_id, e);
            return;
        }
    };
    // Stopped (or recovered by someone else) while we slept.
    if session.status != SessionStatus::Recovering {
        log::info!(
            "[Monitor] Session {} no longer recovering ({}), skipping restart",
            session_id,
            session.status.as_str()
        );
        return;
    }
    if supervisor.owns(session_id) {
        return;
    }

    let result: Result<u32, String> = async {
        let key = store
            .get_stream_key(session.stream_key_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("Stream key {} missing", session.stream_key_id))?;
        if !key.active {
            return Err(format!("Stream key '{}' is no longer active", key.name));
        }
        let paths = manager
            .resolve_paths(&session.source)
            .map_err(|e| e.to_string())?;
        supervisor
            .start(
                session_id,
                EncoderPlan::Concat {
                    paths,
                    loop_playback: session.loop_playback,
                },
                &key.secret,
            )
            .map_err(|e| e.to_string())
    }
    .await;

    match result {
        Ok(pid) => match store.record_restart(session_id, pid) {
            Ok(()) => {
                log::info!(
                    "[Monitor] Session {} restarted (new pid {})",
                    session_id,
                    pid
                );
            }
            Err(e) => {
                // Stopped during the spawn; reconcile by taking the fresh
                // process back down.
                log::warn!(
                    "[Monitor] Session {} stopped during restart, reconciling: {}",
                    session_id,
                    e
                );
                let _ = supervisor
                    .stop(session_id, crate::encoder::StopMode::Force)
                    .await;
            }
        },
        Err(reason) => {
            log::error!("[Monitor] Session {} restart failed: {}", session_id, reason);
            let _ = store.mark_failed(session_id, Some(&format!("Restart failed: {}", reason)));
        }
    }
}
