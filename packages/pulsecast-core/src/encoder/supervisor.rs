//! Encoder process supervisor.
//!
//! Keeps one registry entry per live session: the subprocess handle, the
//! manifest it plays, its log file, and the original plan (for restarts).
//! A watcher task polls the registry; when a process dies with a non-zero
//! exit and the session was not stopped, the supervisor schedules a respawn
//! with exponential backoff (`5·2^k` seconds, k capped at 4) and finalizes
//! the session as failed once the retry budget is exhausted.
//!
//! Ordering within one session is provided by the per-entry child lock; the
//! registry itself is only touched in short critical sections.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::EncoderSettings;
use crate::constants::{
    GRACEFUL_QUIT_TIMEOUT_SECS, LAST_ERROR_SCAN_LINES, SUPERVISOR_BACKOFF_BASE_SECS,
    SUPERVISOR_BACKOFF_CAP_EXP, SUPERVISOR_MAX_RETRIES, TERMINATE_TIMEOUT_SECS,
    WATCHER_POLL_INTERVAL_SECS,
};
use crate::encoder::{command, logs, manifest, EncoderError, EncoderPlan};
use crate::os;
use crate::store::SessionStore;

/// How to take a session's process down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// `q` on stdin, then SIGTERM, then SIGKILL, with bounded waits.
    Graceful,
    /// SIGKILL immediately.
    Force,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was taken down (or had already exited) and the entry
    /// was cleaned up.
    Stopped,
    /// No registry entry existed; stop is idempotent.
    AlreadyStopped,
}

/// Point-in-time view of a supervised process.
#[derive(Debug, Clone, Serialize)]
pub struct EncoderStatus {
    pub pid: u32,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub restart_count: u32,
    pub max_retries: u32,
    pub log_file: String,
}

/// One supervised encoder process.
struct EncoderEntry {
    session_id: i64,
    plan: EncoderPlan,
    stream_key: String,
    manifest_path: PathBuf,
    /// Current log file; replaced on restart.
    log_path: parking_lot::Mutex<PathBuf>,
    /// Per-session lock: all child observations and replacements go
    /// through here.
    child: tokio::sync::Mutex<Child>,
    pid: AtomicU32,
    started_at: parking_lot::Mutex<DateTime<Utc>>,
    started_instant: parking_lot::Mutex<tokio::time::Instant>,
    retry_count: AtomicU32,
    stop_requested: AtomicBool,
    /// Set while a delayed restart is scheduled, so the watcher and reap
    /// leave the dead entry alone.
    restart_pending: AtomicBool,
}

/// Backoff before the k-th in-process restart: `5·2^k` seconds, with the
/// exponent capped so delays plateau at 80s.
fn backoff_delay(retries: u32) -> Duration {
    let exp = retries.min(SUPERVISOR_BACKOFF_CAP_EXP);
    Duration::from_secs(SUPERVISOR_BACKOFF_BASE_SECS << exp)
}

/// Registry and watcher for all encoder subprocesses.
pub struct EncoderSupervisor {
    registry: DashMap<i64, Arc<EncoderEntry>>,
    settings: EncoderSettings,
    store: Arc<SessionStore>,
    cancel: CancellationToken,
}

impl EncoderSupervisor {
    pub fn new(
        settings: EncoderSettings,
        store: Arc<SessionStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry: DashMap::new(),
            settings,
            store,
            cancel,
        }
    }

    /// Spawns the encoder for a session and registers it.
    ///
    /// The argument list is derived entirely from the plan and the stream
    /// key; nothing global leaks into the command line. Returns the pid.
    pub fn start(
        &self,
        session_id: i64,
        plan: EncoderPlan,
        stream_key: &str,
    ) -> Result<u32, EncoderError> {
        if self.registry.contains_key(&session_id) {
            return Err(EncoderError::AlreadyRunning(session_id));
        }
        if plan.manifest_paths().is_empty() {
            return Err(EncoderError::NoAssets);
        }

        let manifest_path = manifest::write_manifest(
            &self.settings.manifest_dir(),
            session_id,
            plan.manifest_paths(),
        )?;

        let (child, pid, log_path) =
            match self.spawn_process(session_id, &plan, &manifest_path, stream_key) {
                Ok(spawned) => spawned,
                Err(e) => {
                    manifest::remove_manifest(&manifest_path);
                    return Err(e);
                }
            };

        let entry = Arc::new(EncoderEntry {
            session_id,
            plan,
            stream_key: stream_key.to_string(),
            manifest_path,
            log_path: parking_lot::Mutex::new(log_path.clone()),
            child: tokio::sync::Mutex::new(child),
            pid: AtomicU32::new(pid),
            started_at: parking_lot::Mutex::new(Utc::now()),
            started_instant: parking_lot::Mutex::new(tokio::time::Instant::now()),
            retry_count: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
            restart_pending: AtomicBool::new(false),
        });
        self.registry.insert(session_id, entry);

        log::info!(
            "[Supervisor] Encoder started for session {} (pid {}, log {})",
            session_id,
            pid,
            log_path.display()
        );
        Ok(pid)
    }

    fn spawn_process(
        &self,
        session_id: i64,
        plan: &EncoderPlan,
        manifest_path: &std::path::Path,
        stream_key: &str,
    ) -> Result<(Child, u32, PathBuf), EncoderError> {
        std::fs::create_dir_all(&self.settings.log_dir).map_err(EncoderError::ManifestIo)?;
        let log_path = self.settings.log_dir.join(format!(
            "session_{}_{}.log",
            session_id,
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        let log_file = std::fs::File::create(&log_path).map_err(EncoderError::ManifestIo)?;
        let log_stderr = log_file.try_clone().map_err(EncoderError::ManifestIo)?;

        let args = command::build_args(&self.settings, plan, manifest_path, stream_key);
        log::info!(
            "[Supervisor] Command: {}",
            command::masked_command_line(&self.settings.binary, &args, stream_key)
        );

        let child = Command::new(&self.settings.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_stderr))
            .spawn()
            .map_err(EncoderError::SpawnFailed)?;

        let pid = child.id().ok_or_else(|| {
            EncoderError::SpawnFailed(std::io::Error::other("spawned process has no pid"))
        })?;
        Ok((child, pid, log_path))
    }

    /// Takes the session's process down and removes its registry entry.
    ///
    /// Idempotent: stopping an unknown session reports
    /// [`StopOutcome::AlreadyStopped`].
    pub async fn stop(
        &self,
        session_id: i64,
        mode: StopMode,
    ) -> Result<StopOutcome, EncoderError> {
        let Some((_, entry)) = self.registry.remove(&session_id) else {
            log::debug!("[Supervisor] Stop for session {}: already stopped", session_id);
            return Ok(StopOutcome::AlreadyStopped);
        };
        entry.stop_requested.store(true, Ordering::SeqCst);

        let result = {
            let mut child = entry.child.lock().await;
            if child.try_wait().ok().flatten().is_none() {
                match mode {
                    StopMode::Graceful => self.stop_gracefully(session_id, &mut child).await,
                    StopMode::Force => {
                        let _ = child.kill().await;
                        Ok(())
                    }
                }
            } else {
                Ok(())
            }
        };

        // The manifest goes away even when the kill escalation failed; the
        // entry is already out of the registry either way.
        manifest::remove_manifest(&entry.manifest_path);
        result?;
        log::info!("[Supervisor] Encoder stopped for session {}", session_id);
        Ok(StopOutcome::Stopped)
    }

    /// Graceful-quit ladder: `q` on stdin, wait 5s; SIGTERM, wait 3s; SIGKILL.
    async fn stop_gracefully(
        &self,
        session_id: i64,
        child: &mut Child,
    ) -> Result<(), EncoderError> {
        if let Some(stdin) = child.stdin.as_mut() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }

        let quit_wait = Duration::from_secs(GRACEFUL_QUIT_TIMEOUT_SECS);
        if tokio::time::timeout(quit_wait, child.wait()).await.is_ok() {
            return Ok(());
        }

        log::warn!(
            "[Supervisor] Session {} ignored graceful quit, sending SIGTERM",
            session_id
        );
        if let Some(pid) = child.id() {
            os::terminate_pid(pid);
        }
        let term_wait = Duration::from_secs(TERMINATE_TIMEOUT_SECS);
        if tokio::time::timeout(term_wait, child.wait()).await.is_ok() {
            return Ok(());
        }

        log::warn!("[Supervisor] Session {} ignored SIGTERM, killing", session_id);
        child
            .kill()
            .await
            .map_err(|_| EncoderError::StopTimeout(session_id))?;
        Ok(())
    }

    /// Point-in-time status for a registered session.
    pub async fn status(&self, session_id: i64) -> Option<EncoderStatus> {
        let entry = self
            .registry
            .get(&session_id)
            .map(|r| Arc::clone(r.value()))?;
        let exit = {
            let mut child = entry.child.lock().await;
            child.try_wait().ok().flatten()
        };
        let status = EncoderStatus {
            pid: entry.pid.load(Ordering::SeqCst),
            running: exit.is_none(),
            exit_code: exit.and_then(|s| s.code()),
            started_at: *entry.started_at.lock(),
            uptime_seconds: entry.started_instant.lock().elapsed().as_secs(),
            restart_count: entry.retry_count.load(Ordering::SeqCst),
            max_retries: SUPERVISOR_MAX_RETRIES,
            log_file: entry.log_path.lock().display().to_string(),
        };
        Some(status)
    }

    /// Whether the supervisor owns an entry for this session.
    ///
    /// The health monitor uses this to decide restart ownership: if the
    /// registry has the entry, recovery is the supervisor's job.
    pub fn owns(&self, session_id: i64) -> bool {
        self.registry.contains_key(&session_id)
    }

    /// All registered session ids.
    pub fn registered_sessions(&self) -> Vec<i64> {
        self.registry.iter().map(|r| *r.key()).collect()
    }

    /// Resets the in-process retry counter (stability reset).
    pub fn reset_retries(&self, session_id: i64) {
        if let Some(entry) = self.registry.get(&session_id) {
            entry.retry_count.store(0, Ordering::SeqCst);
        }
    }

    /// Path of the session's current (or most recent) log file.
    pub fn log_path(&self, session_id: i64) -> Option<PathBuf> {
        match self.registry.get(&session_id) {
            Some(entry) => Some(entry.log_path.lock().clone()),
            None => logs::latest_log_for_session(&self.settings.log_dir, session_id),
        }
    }

    /// Last `n` lines of the session's current (or most recent) log.
    pub fn tail_log(&self, session_id: i64, n: usize) -> Option<Vec<String>> {
        logs::tail_file(&self.log_path(session_id)?, n).ok()
    }

    /// Most recent error-looking line from the session's log tail.
    pub fn last_error(&self, session_id: i64) -> Option<String> {
        let tail = self.tail_log(session_id, LAST_ERROR_SCAN_LINES)?;
        logs::last_error_line(&tail)
    }

    /// Removes entries whose process has terminated, skipping entries that
    /// are waiting on a scheduled restart. Returns the reaped session ids.
    pub async fn reap(&self) -> Vec<i64> {
        let entries: Vec<Arc<EncoderEntry>> =
            self.registry.iter().map(|r| r.value().clone()).collect();

        let mut reaped = Vec::new();
        for entry in entries {
            if entry.restart_pending.load(Ordering::SeqCst) {
                continue;
            }
            let exited = {
                let mut child = entry.child.lock().await;
                child.try_wait().ok().flatten().is_some()
            };
            if exited {
                self.registry.remove(&entry.session_id);
                manifest::remove_manifest(&entry.manifest_path);
                log::warn!(
                    "[Supervisor] Reaped dead encoder for session {}",
                    entry.session_id
                );
                reaped.push(entry.session_id);
            }
        }
        reaped
    }

    // ─────────────────────────────────────────────────────────────────────
    // Watcher / restart policy
    // ─────────────────────────────────────────────────────────────────────

    /// Starts the background watcher that detects crashed processes and
    /// schedules their restarts.
    pub fn spawn_watcher(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            log::info!("[Supervisor] Watcher started");
            let mut interval =
                tokio::time::interval(Duration::from_secs(WATCHER_POLL_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                this.sweep(&this).await;
            }
            log::info!("[Supervisor] Watcher stopped");
        });
    }

    /// One watcher pass over the registry.
    async fn sweep(&self, this: &Arc<Self>) {
        let entries: Vec<Arc<EncoderEntry>> =
            self.registry.iter().map(|r| r.value().clone()).collect();

        for entry in entries {
            if entry.stop_requested.load(Ordering::SeqCst)
                || entry.restart_pending.load(Ordering::SeqCst)
            {
                continue;
            }
            let exit = {
                let mut child = entry.child.lock().await;
                child.try_wait().ok().flatten()
            };
            let Some(exit) = exit else { continue };

            let session_id = entry.session_id;
            if exit.code() == Some(0) {
                // Clean exit: a non-looping plan that played to the end.
                log::info!(
                    "[Supervisor] Session {} encoder finished cleanly",
                    session_id
                );
                if let Err(e) = self.store.mark_stopped(session_id) {
                    log::debug!("[Supervisor] Session {} already finalized: {}", session_id, e);
                }
                self.remove_and_cleanup(session_id);
                continue;
            }

            log::warn!(
                "[Supervisor] Session {} encoder died with {:?}",
                session_id,
                exit.code()
            );
            let last_error = self.last_error(session_id);

            let retries = entry.retry_count.load(Ordering::SeqCst);
            if retries >= SUPERVISOR_MAX_RETRIES {
                log::error!(
                    "[Supervisor] Session {} exhausted {} restarts, marking failed",
                    session_id,
                    retries
                );
                if let Err(e) = self
                    .store
                    .mark_failed(session_id, last_error.as_deref())
                {
                    log::debug!("[Supervisor] Session {} already finalized: {}", session_id, e);
                }
                self.remove_and_cleanup(session_id);
                continue;
            }

            // Claim the restart before sleeping so neither a second sweep
            // nor reap acts on this entry.
            entry.restart_pending.store(true, Ordering::SeqCst);
            match self.store.mark_recovering(session_id, last_error.as_deref()) {
                Ok(()) => {}
                Err(e) => {
                    // The session was stopped out from under us; drop the entry.
                    log::debug!(
                        "[Supervisor] Session {} no longer restartable: {}",
                        session_id,
                        e
                    );
                    self.remove_and_cleanup(session_id);
                    continue;
                }
            }

            let delay = backoff_delay(retries);
            log::info!(
                "[Supervisor] Session {} restart {}/{} in {:?}",
                session_id,
                retries + 1,
                SUPERVISOR_MAX_RETRIES,
                delay
            );
            let this = Arc::clone(this);
            tokio::spawn(async move {
                this.delayed_restart(entry, delay).await;
            });
        }
    }

    async fn delayed_restart(self: Arc<Self>, entry: Arc<EncoderEntry>, delay: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let session_id = entry.session_id;
        // Recheck intent: the operator may have stopped the session while
        // we slept (stop removes the registry entry).
        if entry.stop_requested.load(Ordering::SeqCst) || !self.registry.contains_key(&session_id)
        {
            log::info!(
                "[Supervisor] Session {} restart cancelled (stopped during backoff)",
                session_id
            );
            return;
        }

        match self.respawn(&entry).await {
            Ok(pid) => {
                entry.retry_count.fetch_add(1, Ordering::SeqCst);
                match self.store.record_restart(session_id, pid) {
                    Ok(()) => {
                        log::info!(
                            "[Supervisor] Session {} restarted (new pid {})",
                            session_id,
                            pid
                        );
                    }
                    Err(e) => {
                        // Lost the race against a concurrent stop: take the
                        // fresh process straight back down.
                        log::warn!(
                            "[Supervisor] Session {} stopped during restart, reconciling: {}",
                            session_id,
                            e
                        );
                        let mut child = entry.child.lock().await;
                        let _ = child.kill().await;
                        drop(child);
                        self.remove_and_cleanup(session_id);
                        return;
                    }
                }
                entry.restart_pending.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                log::error!("[Supervisor] Session {} restart failed: {}", session_id, e);
                let _ = self
                    .store
                    .mark_failed(session_id, Some(&format!("Restart failed: {}", e)));
                self.remove_and_cleanup(session_id);
            }
        }
    }

    /// Respawns an entry's process with its stored plan, reusing the
    /// manifest and opening a fresh log file.
    async fn respawn(&self, entry: &Arc<EncoderEntry>) -> Result<u32, EncoderError> {
        let (new_child, pid, log_path) = self.spawn_process(
            entry.session_id,
            &entry.plan,
            &entry.manifest_path,
            &entry.stream_key,
        )?;

        let mut child = entry.child.lock().await;
        *child = new_child;
        drop(child);

        entry.pid.store(pid, Ordering::SeqCst);
        *entry.log_path.lock() = log_path;
        *entry.started_at.lock() = Utc::now();
        *entry.started_instant.lock() = tokio::time::Instant::now();
        Ok(pid)
    }

    fn remove_and_cleanup(&self, session_id: i64) {
        if let Some((_, entry)) = self.registry.remove(&session_id) {
            manifest::remove_manifest(&entry.manifest_path);
        }
    }
}
