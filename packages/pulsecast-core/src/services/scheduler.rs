//! Deferred and recurring session scheduling.
//!
//! A trigger is persisted first, then a one-shot timer is armed for its UTC
//! fire time. Firing re-loads the row and atomically claims it (`pending` →
//! `running`), so a stale or duplicate timer is a no-op. The actual start
//! goes through the same admission path as a manual start; time-of-fire
//! state decides, not schedule-time state. Recurrences queue the next
//! *future* occurrence only — downtime is not backfilled.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::{LiveError, LiveResult};
use crate::services::session_manager::SessionManager;
use crate::services::timer::TimerWheel;
use crate::store::admission::AdmissionError;
use crate::store::entities::{Recurrence, ScheduledTrigger, StreamSource, TriggerStatus};
use crate::store::{NewTrigger, SessionStore};

/// Schedule-surface failures.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The requested fire time is not in the future.
    #[error("Scheduled time {0} is in the past")]
    PastScheduledTime(String),

    /// Unrecognized recurrence value.
    #[error("Recurrence must be 'none', 'daily' or 'weekly', got '{0}'")]
    BadRecurrence(String),

    /// The trigger exists but is not pending (edit/cancel refused).
    #[error("Schedule {0} is not pending")]
    NotPending(i64),
}

/// Input for creating or updating a trigger.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub stream_key_id: i64,
    pub source: StreamSource,
    pub scheduled_time: DateTime<Utc>,
    pub loop_playback: bool,
    pub recurrence: Recurrence,
    pub max_duration_hours: u32,
}

/// Computes the next occurrence strictly after `now`.
///
/// Skips over occurrences missed during downtime instead of replaying them.
pub fn next_occurrence(
    scheduled_time: DateTime<Utc>,
    recurrence: Recurrence,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let interval = recurrence.interval()?;
    let mut next = scheduled_time + interval;
    while next <= now {
        next += interval;
    }
    Some(next)
}

/// Persistent scheduler over the timer wheel.
pub struct LiveScheduler {
    store: Arc<SessionStore>,
    manager: Arc<SessionManager>,
    timers: TimerWheel,
    /// Self-handle for timer payloads (set via `Arc::new_cyclic`).
    weak: Weak<LiveScheduler>,
}

impl LiveScheduler {
    pub fn new(store: Arc<SessionStore>, manager: Arc<SessionManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            manager,
            timers: TimerWheel::new(),
            weak: weak.clone(),
        })
    }

    fn job_id(trigger_id: i64) -> String {
        format!("live_schedule_{}", trigger_id)
    }

    /// Validates the parts of a request that are checkable at schedule time.
    ///
    /// Admission (key busy, capacity) deliberately is not checked here; only
    /// the state at fire time matters for those.
    fn validate(&self, req: &ScheduleRequest) -> LiveResult<()> {
        if req.scheduled_time <= Utc::now() {
            return Err(ScheduleError::PastScheduledTime(
                crate::store::entities::to_utc_string(req.scheduled_time),
            )
            .into());
        }
        let key = self
            .store
            .get_stream_key(req.stream_key_id)?
            .ok_or(LiveError::Admission(AdmissionError::UnknownKey(
                req.stream_key_id,
            )))?;
        if !key.active {
            return Err(LiveError::Admission(AdmissionError::InactiveKey(key.name)));
        }
        match req.source {
            StreamSource::Single { asset_id } => {
                self.store
                    .get_asset(asset_id)?
                    .ok_or(LiveError::UnknownAsset(asset_id))?;
            }
            StreamSource::Playlist { playlist_id } => {
                self.store
                    .get_playlist(playlist_id)?
                    .ok_or(LiveError::UnknownPlaylist(playlist_id))?;
            }
        }
        Ok(())
    }

    /// Persists a trigger and arms its timer.
    pub fn schedule(&self, req: ScheduleRequest) -> LiveResult<ScheduledTrigger> {
        self.validate(&req)?;

        let mut trigger = self.store.create_trigger(&NewTrigger {
            stream_key_id: req.stream_key_id,
            source: req.source,
            scheduled_time: req.scheduled_time,
            loop_playback: req.loop_playback,
            recurrence: req.recurrence,
            max_duration_hours: req.max_duration_hours,
        })?;

        let job_id = Self::job_id(trigger.id);
        self.store.set_trigger_job(trigger.id, &job_id)?;
        trigger.job_id = Some(job_id.clone());

        self.arm(&job_id, trigger.scheduled_time, trigger.id);
        log::info!(
            "[Scheduler] Scheduled trigger {} for {} (recurrence {})",
            trigger.id,
            trigger.scheduled_time,
            trigger.recurrence.as_str()
        );
        Ok(trigger)
    }

    fn arm(&self, job_id: &str, at: DateTime<Utc>, trigger_id: i64) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        self.timers.register_once(job_id, at, move || async move {
            this.fire(trigger_id).await;
        });
    }

    /// Executes one trigger: claim, start through admission, finalize, and
    /// queue the next recurrence.
    pub async fn fire(&self, trigger_id: i64) {
        match self.store.claim_trigger(trigger_id) {
            Ok(true) => {}
            Ok(false) => {
                // Cancelled, edited away, or already executed: a stale timer
                // must not double-spawn.
                log::info!("[Scheduler] Trigger {} no longer pending, skipping", trigger_id);
                return;
            }
            Err(e) => {
                log::error!("[Scheduler] Failed to claim trigger {}: {}", trigger_id, e);
                return;
            }
        }

        let trigger = match self.store.get_trigger(trigger_id) {
            Ok(t) => t,
            Err(e) => {
                log::error!("[Scheduler] Trigger {} vanished after claim: {}", trigger_id, e);
                return;
            }
        };

        log::info!("[Scheduler] Firing trigger {}", trigger_id);
        match self.manager.start_from_trigger(&trigger).await {
            Ok(summary) => {
                // Link the spawned session first so a crash before the
                // finalize below is reconcilable on the next boot.
                if let Err(e) = self.store.link_trigger_session(trigger_id, summary.session_id) {
                    log::error!("[Scheduler] Failed to link trigger {}: {}", trigger_id, e);
                }
                if let Err(e) = self
                    .store
                    .finalize_trigger_completed(trigger_id, summary.session_id)
                {
                    log::error!("[Scheduler] Failed to finalize trigger {}: {}", trigger_id, e);
                }
                log::info!(
                    "[Scheduler] Trigger {} spawned session {} (pid {})",
                    trigger_id,
                    summary.session_id,
                    summary.encoder_pid
                );
            }
            Err(e) => {
                // Fire-time failures (KeyBusy, CapacityExhausted, InactiveKey,
                // spawn errors) finalize the trigger; no retry.
                log::warn!("[Scheduler] Trigger {} failed: {}", trigger_id, e);
                if let Err(e2) = self.store.finalize_trigger_failed(trigger_id, &e.to_string()) {
                    log::error!("[Scheduler] Failed to finalize trigger {}: {}", trigger_id, e2);
                }
            }
        }

        // The next recurrence is queued regardless of this fire's outcome.
        self.schedule_recurrence(&trigger);
    }

    fn schedule_recurrence(&self, trigger: &ScheduledTrigger) {
        let Some(next) = next_occurrence(trigger.scheduled_time, trigger.recurrence, Utc::now())
        else {
            return;
        };
        let req = ScheduleRequest {
            stream_key_id: trigger.stream_key_id,
            source: trigger.source,
            scheduled_time: next,
            loop_playback: trigger.loop_playback,
            recurrence: trigger.recurrence,
            max_duration_hours: trigger.max_duration_hours,
        };
        match self.schedule(req) {
            Ok(fresh) => log::info!(
                "[Scheduler] Queued recurrence of trigger {} as {} at {}",
                trigger.id,
                fresh.id,
                next
            ),
            Err(e) => log::warn!(
                "[Scheduler] Could not queue recurrence of trigger {}: {}",
                trigger.id,
                e
            ),
        }
    }

    /// Cancels a pending trigger. The timer is deregistered before the
    /// status write returns.
    pub fn cancel(&self, trigger_id: i64) -> LiveResult<()> {
        let trigger = self.store.get_trigger(trigger_id)?;
        if let Some(job_id) = &trigger.job_id {
            self.timers.cancel(job_id);
        }
        if self.store.cancel_trigger(trigger_id)? {
            log::info!("[Scheduler] Cancelled trigger {}", trigger_id);
            Ok(())
        } else {
            Err(ScheduleError::NotPending(trigger_id).into())
        }
    }

    /// Rewrites a pending trigger and re-arms its timer.
    pub fn update(&self, trigger_id: i64, req: ScheduleRequest) -> LiveResult<ScheduledTrigger> {
        self.validate(&req)?;
        let trigger = self.store.get_trigger(trigger_id)?;
        if trigger.status != TriggerStatus::Pending {
            return Err(ScheduleError::NotPending(trigger_id).into());
        }

        let updated = self.store.update_trigger(
            trigger_id,
            &NewTrigger {
                stream_key_id: req.stream_key_id,
                source: req.source,
                scheduled_time: req.scheduled_time,
                loop_playback: req.loop_playback,
                recurrence: req.recurrence,
                max_duration_hours: req.max_duration_hours,
            },
        )?;
        if !updated {
            return Err(ScheduleError::NotPending(trigger_id).into());
        }

        let job_id = trigger
            .job_id
            .unwrap_or_else(|| Self::job_id(trigger_id));
        self.arm(&job_id, req.scheduled_time, trigger_id);
        log::info!(
            "[Scheduler] Updated trigger {} to fire at {}",
            trigger_id,
            req.scheduled_time
        );
        self.store.get_trigger(trigger_id).map_err(LiveError::from)
    }

    /// Boot recovery: reconcile triggers left `running` by a crashed
    /// process, re-arm future pending triggers, and immediately attempt
    /// overdue ones (subject to admission at fire time).
    pub async fn recover(&self) -> LiveResult<()> {
        for trigger in self.store.running_triggers()? {
            let adopted = trigger.spawned_session_id.and_then(|sid| {
                self.store
                    .get_session(sid)
                    .ok()
                    .filter(|s| s.status.is_active())
                    .map(|_| sid)
            });
            match adopted {
                Some(sid) => {
                    log::info!(
                        "[Scheduler] Trigger {} survived restart with live session {}",
                        trigger.id,
                        sid
                    );
                    self.store.finalize_trigger_completed(trigger.id, sid)?;
                }
                None => {
                    log::warn!(
                        "[Scheduler] Trigger {} was interrupted mid-execution",
                        trigger.id
                    );
                    self.store.finalize_trigger_failed(
                        trigger.id,
                        "Interrupted by host restart during execution",
                    )?;
                }
            }
        }

        let now = Utc::now();
        for trigger in self.store.pending_triggers()? {
            let job_id = trigger
                .job_id
                .clone()
                .unwrap_or_else(|| Self::job_id(trigger.id));
            if trigger.scheduled_time <= now {
                log::info!(
                    "[Scheduler] Trigger {} overdue (was due {}), firing now",
                    trigger.id,
                    trigger.scheduled_time
                );
                // Arm with a past target: fires immediately from the wheel.
            }
            self.arm(&job_id, trigger.scheduled_time, trigger.id);
        }
        Ok(())
    }

    /// Ids of currently armed timers.
    pub fn active_jobs(&self) -> Vec<String> {
        self.timers.active_jobs()
    }

    /// Cancels all armed timers (shutdown path).
    pub fn shutdown(&self) {
        let n = self.timers.cancel_all();
        if n > 0 {
            log::info!("[Scheduler] Cancelled {} armed timer(s)", n);
        }
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{EncoderSettings, StreamLimits};
    use crate::encoder::EncoderSupervisor;
    use crate::store::entities::{AssetSource, SessionStatus};
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    fn scheduler(dir: &std::path::Path) -> (Arc<LiveScheduler>, Arc<SessionStore>) {
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
        let manager = Arc::new(SessionManager::new(
            Arc::clone(&store),
            supervisor,
            StreamLimits::default(),
            "sleep".to_string(),
        ));
        (LiveScheduler::new(Arc::clone(&store), manager), store)
    }

    fn seed(store: &SessionStore) -> i64 {
        store
            .create_asset("a", "/media/a.mp4", 10.0, AssetSource::Uploaded)
            .unwrap();
        store.create_stream_key("Main", "main-key-0001").unwrap().id
    }

    fn request(key_id: i64, at: DateTime<Utc>, recurrence: Recurrence) -> ScheduleRequest {
        ScheduleRequest {
            stream_key_id: key_id,
            source: StreamSource::Single { asset_id: 1 },
            scheduled_time: at,
            loop_playback: true,
            recurrence,
            max_duration_hours: 0,
        }
    }

    #[tokio::test]
    async fn past_time_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path());
        let key_id = seed(&store);

        let err = scheduler
            .schedule(request(
                key_id,
                Utc::now() - chrono::Duration::minutes(1),
                Recurrence::None,
            ))
            .unwrap_err();
        assert_eq!(err.code(), "past_scheduled_time");
    }

    #[tokio::test]
    async fn schedule_persists_row_and_arms_timer() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path());
        let key_id = seed(&store);

        let trigger = scheduler
            .schedule(request(
                key_id,
                Utc::now() + chrono::Duration::hours(1),
                Recurrence::Daily,
            ))
            .unwrap();

        assert_eq!(trigger.status, TriggerStatus::Pending);
        let job_id = trigger.job_id.clone().unwrap();
        assert_eq!(job_id, format!("live_schedule_{}", trigger.id));
        assert_eq!(scheduler.active_jobs(), vec![job_id]);
        assert_eq!(store.get_trigger(trigger.id).unwrap().job_id, trigger.job_id);
    }

    #[tokio::test]
    async fn fire_spawns_session_and_queues_recurrence() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path());
        let key_id = seed(&store);

        let trigger = scheduler
            .schedule(request(
                key_id,
                Utc::now() + chrono::Duration::hours(1),
                Recurrence::Daily,
            ))
            .unwrap();

        scheduler.fire(trigger.id).await;

        let fired = store.get_trigger(trigger.id).unwrap();
        assert_eq!(fired.status, TriggerStatus::Completed);
        let session_id = fired.spawned_session_id.unwrap();
        assert_eq!(
            store.get_session(session_id).unwrap().status,
            SessionStatus::Running
        );

        // A fresh pending trigger exists one day later.
        let pending = store.pending_triggers().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].scheduled_time,
            trigger.scheduled_time + chrono::Duration::days(1)
        );

        scheduler.shutdown();
    }

    #[tokio::test]
    async fn fire_on_busy_key_fails_trigger_but_queues_recurrence() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path());
        let key_id = seed(&store);

        // Key already streaming.
        store
            .admit_and_create(
                &crate::store::NewSession {
                    stream_key_id: key_id,
                    source: StreamSource::Single { asset_id: 1 },
                    loop_playback: true,
                    max_duration_hours: 0,
                    extra_id: None,
                },
                10,
            )
            .unwrap();

        let trigger = scheduler
            .schedule(request(
                key_id,
                Utc::now() + chrono::Duration::hours(1),
                Recurrence::Daily,
            ))
            .unwrap();
        scheduler.fire(trigger.id).await;

        let fired = store.get_trigger(trigger.id).unwrap();
        assert_eq!(fired.status, TriggerStatus::Failed);
        assert!(fired.error_message.unwrap().contains("already in use"));
        assert!(fired.spawned_session_id.is_none());

        // Recurrence still queued despite the failure.
        assert_eq!(store.pending_triggers().unwrap().len(), 1);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn firing_a_cancelled_trigger_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path());
        let key_id = seed(&store);

        let trigger = scheduler
            .schedule(request(
                key_id,
                Utc::now() + chrono::Duration::hours(1),
                Recurrence::None,
            ))
            .unwrap();
        scheduler.cancel(trigger.id).unwrap();
        assert!(scheduler.active_jobs().is_empty());

        scheduler.fire(trigger.id).await;
        assert_eq!(
            store.get_trigger(trigger.id).unwrap().status,
            TriggerStatus::Cancelled
        );
        assert_eq!(store.count_active().unwrap(), 0);
    }

    #[tokio::test]
    async fn cancel_refuses_non_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path());
        let key_id = seed(&store);

        let trigger = scheduler
            .schedule(request(
                key_id,
                Utc::now() + chrono::Duration::hours(1),
                Recurrence::None,
            ))
            .unwrap();
        store.claim_trigger(trigger.id).unwrap();

        let err = scheduler.cancel(trigger.id).unwrap_err();
        assert_eq!(err.code(), "not_pending");
    }

    #[tokio::test]
    async fn update_rewrites_pending_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path());
        let key_id = seed(&store);

        let trigger = scheduler
            .schedule(request(
                key_id,
                Utc::now() + chrono::Duration::hours(1),
                Recurrence::None,
            ))
            .unwrap();

        let new_time = Utc::now() + chrono::Duration::hours(2);
        let updated = scheduler
            .update(trigger.id, request(key_id, new_time, Recurrence::Weekly))
            .unwrap();
        assert_eq!(updated.recurrence, Recurrence::Weekly);
        assert_eq!(updated.scheduled_time, new_time);

        store.claim_trigger(trigger.id).unwrap();
        let err = scheduler
            .update(trigger.id, request(key_id, new_time, Recurrence::None))
            .unwrap_err();
        assert_eq!(err.code(), "not_pending");
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn recovery_reconciles_running_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path());
        let key_id = seed(&store);

        // Trigger that crashed mid-execution with no surviving session.
        let orphaned = store
            .create_trigger(&NewTrigger {
                stream_key_id: key_id,
                source: StreamSource::Single { asset_id: 1 },
                scheduled_time: Utc::now() - chrono::Duration::minutes(5),
                loop_playback: true,
                recurrence: Recurrence::None,
                max_duration_hours: 0,
            })
            .unwrap();
        store.claim_trigger(orphaned.id).unwrap();

        // Trigger that crashed between spawn and finalize: still `running`
        // but linked to a session that survived.
        let (session, _) = store
            .admit_and_create(
                &crate::store::NewSession {
                    stream_key_id: key_id,
                    source: StreamSource::Single { asset_id: 1 },
                    loop_playback: true,
                    max_duration_hours: 0,
                    extra_id: None,
                },
                10,
            )
            .unwrap();
        let survived = store
            .create_trigger(&NewTrigger {
                stream_key_id: key_id,
                source: StreamSource::Single { asset_id: 1 },
                scheduled_time: Utc::now() - chrono::Duration::minutes(5),
                loop_playback: true,
                recurrence: Recurrence::None,
                max_duration_hours: 0,
            })
            .unwrap();
        store.claim_trigger(survived.id).unwrap();
        store.link_trigger_session(survived.id, session.id).unwrap();

        scheduler.recover().await.unwrap();

        assert_eq!(
            store.get_trigger(orphaned.id).unwrap().status,
            TriggerStatus::Failed
        );
        let adopted = store.get_trigger(survived.id).unwrap();
        assert_eq!(adopted.status, TriggerStatus::Completed);
        assert_eq!(adopted.spawned_session_id, Some(session.id));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn recovery_rearms_future_pending_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler(dir.path());
        let key_id = seed(&store);

        let trigger = store
            .create_trigger(&NewTrigger {
                stream_key_id: key_id,
                source: StreamSource::Single { asset_id: 1 },
                scheduled_time: Utc::now() + chrono::Duration::hours(2),
                loop_playback: true,
                recurrence: Recurrence::None,
                max_duration_hours: 0,
            })
            .unwrap();
        store
            .set_trigger_job(trigger.id, &format!("live_schedule_{}", trigger.id))
            .unwrap();

        scheduler.recover().await.unwrap();
        assert_eq!(
            scheduler.active_jobs(),
            vec![format!("live_schedule_{}", trigger.id)]
        );
        scheduler.shutdown();
    }
}
