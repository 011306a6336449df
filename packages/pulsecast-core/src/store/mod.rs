//! Transactional session store over SQLite.
//!
//! The store is the source of truth for every state transition. All Session
//! transitions go through dedicated methods that assert the from-state in the
//! `UPDATE ... WHERE status IN (...)` clause; an update that matches zero
//! rows is either a missing row or an illegal transition, and illegal
//! transitions are programmer errors surfaced as such. Admission and the
//! insert of the new `starting` row happen inside one transaction
//! ([`SessionStore::admit_and_create`]), which is what makes the per-key
//! exclusivity and capacity checks race-free.

pub mod admission;
pub mod entities;
mod schema;

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::store::admission::AdmissionError;
use crate::store::entities::{
    Asset, AssetSource, PlaybackOrder, Playlist, Recurrence, ScheduledTrigger, Session,
    SessionStatus, StreamKey, StreamSource, TriggerStatus,
};

/// Store-level failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// A transition method was called against a row that is not in the
    /// expected from-state. Programmer error, not a user error.
    #[error("Illegal transition: {attempted} is not valid for session {session_id} in its current status")]
    IllegalTransition {
        session_id: i64,
        attempted: &'static str,
    },

    /// Session row does not exist.
    #[error("Session {0} not found")]
    MissingSession(i64),

    /// Trigger row does not exist.
    #[error("Schedule {0} not found")]
    MissingTrigger(i64),

    /// Asset is still referenced by an active session or pending trigger.
    #[error("Asset {0} is referenced by an active session or pending schedule")]
    AssetInUse(i64),

    /// A row violates an invariant the schema cannot express (e.g. a mode
    /// string with mismatched content columns). Indicates out-of-band writes.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// New-session input for [`SessionStore::admit_and_create`].
#[derive(Debug, Clone)]
pub struct NewSession {
    pub stream_key_id: i64,
    pub source: StreamSource,
    pub loop_playback: bool,
    pub max_duration_hours: u32,
    pub extra_id: Option<String>,
}

/// Content fields shared by trigger creation and update.
#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub stream_key_id: i64,
    pub source: StreamSource,
    pub scheduled_time: DateTime<Utc>,
    pub loop_playback: bool,
    pub recurrence: Recurrence,
    pub max_duration_hours: u32,
}

/// SQLite-backed store for all persistent entities.
///
/// A single connection behind a mutex serializes writers, which is all the
/// concurrency SQLite needs here; every critical section is short and no
/// lock is ever held across an await point.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

const SESSION_COLUMNS: &str = "s.id, s.stream_key_id, k.name, s.mode, s.video_id, s.playlist_id, \
     s.status, s.encoder_pid, s.start_time, s.end_time, s.restart_count, s.restarted_at, \
     s.last_error, s.loop_playback, s.max_duration_hours, s.extra_id";

const TRIGGER_COLUMNS: &str = "id, stream_key_id, mode, video_id, playlist_id, scheduled_time, \
     loop_playback, recurrence, max_duration_hours, job_id, status, spawned_session_id, \
     error_message, created_at, started_at, completed_at";

/// Raw session row before invariant-checked conversion.
struct RawSession {
    id: i64,
    stream_key_id: i64,
    stream_key_name: Option<String>,
    mode: String,
    video_id: Option<i64>,
    playlist_id: Option<i64>,
    status: String,
    encoder_pid: Option<i64>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    restart_count: i64,
    restarted_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    loop_playback: bool,
    max_duration_hours: i64,
    extra_id: Option<String>,
}

impl RawSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            stream_key_id: row.get(1)?,
            stream_key_name: row.get(2)?,
            mode: row.get(3)?,
            video_id: row.get(4)?,
            playlist_id: row.get(5)?,
            status: row.get(6)?,
            encoder_pid: row.get(7)?,
            start_time: row.get(8)?,
            end_time: row.get(9)?,
            restart_count: row.get(10)?,
            restarted_at: row.get(11)?,
            last_error: row.get(12)?,
            loop_playback: row.get(13)?,
            max_duration_hours: row.get(14)?,
            extra_id: row.get(15)?,
        })
    }

    fn into_session(self) -> Result<Session, StoreError> {
        let source = StreamSource::from_columns(&self.mode, self.video_id, self.playlist_id)
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "session {}: mode '{}' with video_id={:?} playlist_id={:?}",
                    self.id, self.mode, self.video_id, self.playlist_id
                ))
            })?;
        let status = SessionStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Corrupt(format!("session {}: status '{}'", self.id, self.status))
        })?;
        Ok(Session {
            id: self.id,
            stream_key_id: self.stream_key_id,
            stream_key_name: self.stream_key_name,
            source,
            status,
            encoder_pid: self.encoder_pid.map(|p| p as u32),
            start_time: self.start_time,
            end_time: self.end_time,
            restart_count: self.restart_count as u32,
            restarted_at: self.restarted_at,
            last_error: self.last_error,
            loop_playback: self.loop_playback,
            max_duration_hours: self.max_duration_hours as u32,
            extra_id: self.extra_id,
        })
    }
}

/// Raw trigger row before invariant-checked conversion.
struct RawTrigger {
    id: i64,
    stream_key_id: i64,
    mode: String,
    video_id: Option<i64>,
    playlist_id: Option<i64>,
    scheduled_time: DateTime<Utc>,
    loop_playback: bool,
    recurrence: String,
    max_duration_hours: i64,
    job_id: Option<String>,
    status: String,
    spawned_session_id: Option<i64>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl RawTrigger {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            stream_key_id: row.get(1)?,
            mode: row.get(2)?,
            video_id: row.get(3)?,
            playlist_id: row.get(4)?,
            scheduled_time: row.get(5)?,
            loop_playback: row.get(6)?,
            recurrence: row.get(7)?,
            max_duration_hours: row.get(8)?,
            job_id: row.get(9)?,
            status: row.get(10)?,
            spawned_session_id: row.get(11)?,
            error_message: row.get(12)?,
            created_at: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
        })
    }

    fn into_trigger(self) -> Result<ScheduledTrigger, StoreError> {
        let source = StreamSource::from_columns(&self.mode, self.video_id, self.playlist_id)
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "trigger {}: mode '{}' with video_id={:?} playlist_id={:?}",
                    self.id, self.mode, self.video_id, self.playlist_id
                ))
            })?;
        let recurrence = Recurrence::parse(&self.recurrence).ok_or_else(|| {
            StoreError::Corrupt(format!("trigger {}: recurrence '{}'", self.id, self.recurrence))
        })?;
        let status = TriggerStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Corrupt(format!("trigger {}: status '{}'", self.id, self.status))
        })?;
        Ok(ScheduledTrigger {
            id: self.id,
            stream_key_id: self.stream_key_id,
            source,
            scheduled_time: self.scheduled_time,
            loop_playback: self.loop_playback,
            recurrence,
            max_duration_hours: self.max_duration_hours as u32,
            job_id: self.job_id,
            status,
            spawned_session_id: self.spawned_session_id,
            error_message: self.error_message,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

fn map_stream_key(row: &Row<'_>) -> rusqlite::Result<StreamKey> {
    Ok(StreamKey {
        id: row.get(0)?,
        name: row.get(1)?,
        secret: row.get(2)?,
        active: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn map_asset(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, f64, String, DateTime<Utc>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl SessionStore {
    /// Opens (creating if necessary) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stream keys
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_stream_key(&self, name: &str, secret: &str) -> Result<StreamKey, StoreError> {
        let conn = self.conn.lock();
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO stream_keys (name, secret, active, created_at) VALUES (?1, ?2, 1, ?3)",
            params![name, secret, created_at],
        )?;
        Ok(StreamKey {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            secret: secret.to_string(),
            active: true,
            created_at,
        })
    }

    pub fn get_stream_key(&self, id: i64) -> Result<Option<StreamKey>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, secret, active, created_at FROM stream_keys WHERE id = ?1",
                params![id],
                map_stream_key,
            )
            .optional()?)
    }

    pub fn list_stream_keys(&self) -> Result<Vec<StreamKey>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, secret, active, created_at FROM stream_keys ORDER BY id",
        )?;
        let keys = stmt
            .query_map([], map_stream_key)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    /// Soft-retires (or reactivates) a stream key. Returns `false` if the
    /// key does not exist.
    pub fn set_stream_key_active(&self, id: i64, active: bool) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE stream_keys SET active = ?2 WHERE id = ?1",
            params![id, active],
        )?;
        Ok(n == 1)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Assets
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_asset(
        &self,
        name: &str,
        path: &str,
        duration_seconds: f64,
        source: AssetSource,
    ) -> Result<Asset, StoreError> {
        let conn = self.conn.lock();
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO assets (name, path, duration_seconds, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, path, duration_seconds, source.as_str(), created_at],
        )?;
        Ok(Asset {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            path: path.to_string(),
            duration_seconds,
            source,
            created_at,
        })
    }

    pub fn get_asset(&self, id: i64) -> Result<Option<Asset>, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT id, name, path, duration_seconds, source, created_at
                 FROM assets WHERE id = ?1",
                params![id],
                map_asset,
            )
            .optional()?;
        raw.map(Self::asset_from_raw).transpose()
    }

    pub fn list_assets(&self) -> Result<Vec<Asset>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, path, duration_seconds, source, created_at
             FROM assets ORDER BY id",
        )?;
        let raw = stmt
            .query_map([], map_asset)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(Self::asset_from_raw).collect()
    }

    fn asset_from_raw(
        (id, name, path, duration_seconds, source, created_at): (
            i64,
            String,
            String,
            f64,
            String,
            DateTime<Utc>,
        ),
    ) -> Result<Asset, StoreError> {
        let source = AssetSource::parse(&source)
            .ok_or_else(|| StoreError::Corrupt(format!("asset {}: source '{}'", id, source)))?;
        Ok(Asset {
            id,
            name,
            path,
            duration_seconds,
            source,
            created_at,
        })
    }

    /// Deletes an asset unless it is referenced by an active session or a
    /// pending trigger (directly, or through such a session's playlist).
    /// Returns `false` if the asset does not exist.
    pub fn delete_asset(&self, id: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let direct: i64 = tx.query_row(
            "SELECT COUNT(*) FROM sessions
             WHERE video_id = ?1 AND status IN ('starting', 'running', 'recovering')",
            params![id],
            |row| row.get(0),
        )?;
        let scheduled: i64 = tx.query_row(
            "SELECT COUNT(*) FROM scheduled_triggers
             WHERE video_id = ?1 AND status = 'pending'",
            params![id],
            |row| row.get(0),
        )?;
        if direct > 0 || scheduled > 0 {
            return Err(StoreError::AssetInUse(id));
        }

        // Playlist-level references: playlists bound to active sessions or
        // pending triggers must not lose members.
        let mut stmt = tx.prepare(
            "SELECT DISTINCT p.asset_ids FROM playlists p
             WHERE p.id IN (
                 SELECT playlist_id FROM sessions
                 WHERE playlist_id IS NOT NULL
                   AND status IN ('starting', 'running', 'recovering')
                 UNION
                 SELECT playlist_id FROM scheduled_triggers
                 WHERE playlist_id IS NOT NULL AND status = 'pending'
             )",
        )?;
        let lists = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for raw in lists {
            let ids: Vec<i64> = serde_json::from_str(&raw)
                .map_err(|e| StoreError::Corrupt(format!("playlist asset_ids: {}", e)))?;
            if ids.contains(&id) {
                return Err(StoreError::AssetInUse(id));
            }
        }

        let n = tx.execute("DELETE FROM assets WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(n == 1)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Playlists
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_playlist(
        &self,
        name: &str,
        order: PlaybackOrder,
        asset_ids: &[i64],
    ) -> Result<Playlist, StoreError> {
        let conn = self.conn.lock();
        let created_at = Utc::now();
        let ids_json = serde_json::to_string(asset_ids).expect("Vec<i64> serializes");
        conn.execute(
            "INSERT INTO playlists (name, play_order, asset_ids, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, order.as_str(), ids_json, created_at],
        )?;
        Ok(Playlist {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            order,
            asset_ids: asset_ids.to_vec(),
            created_at,
        })
    }

    pub fn get_playlist(&self, id: i64) -> Result<Option<Playlist>, StoreError> {
        let conn = self.conn.lock();
        let raw: Option<(i64, String, String, String, DateTime<Utc>)> = conn
            .query_row(
                "SELECT id, name, play_order, asset_ids, created_at FROM playlists WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        raw.map(Self::playlist_from_raw).transpose()
    }

    pub fn list_playlists(&self) -> Result<Vec<Playlist>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, play_order, asset_ids, created_at FROM playlists ORDER BY id",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<(i64, String, String, String, DateTime<Utc>)>>>()?;
        raw.into_iter().map(Self::playlist_from_raw).collect()
    }

    fn playlist_from_raw(
        (id, name, order, asset_ids, created_at): (i64, String, String, String, DateTime<Utc>),
    ) -> Result<Playlist, StoreError> {
        let order = PlaybackOrder::parse(&order)
            .ok_or_else(|| StoreError::Corrupt(format!("playlist {}: order '{}'", id, order)))?;
        let asset_ids: Vec<i64> = serde_json::from_str(&asset_ids)
            .map_err(|e| StoreError::Corrupt(format!("playlist {}: asset_ids: {}", id, e)))?;
        Ok(Playlist {
            id,
            name,
            order,
            asset_ids,
            created_at,
        })
    }

    /// Replaces a playlist's name, order, and members. Returns `false` if
    /// the playlist does not exist.
    pub fn update_playlist(
        &self,
        id: i64,
        name: &str,
        order: PlaybackOrder,
        asset_ids: &[i64],
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let ids_json = serde_json::to_string(asset_ids).expect("Vec<i64> serializes");
        let n = conn.execute(
            "UPDATE playlists SET name = ?2, play_order = ?3, asset_ids = ?4 WHERE id = ?1",
            params![id, name, order.as_str(), ids_json],
        )?;
        Ok(n == 1)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sessions — admission + creation
    // ─────────────────────────────────────────────────────────────────────

    /// Runs admission and inserts the new `starting` row in one transaction.
    ///
    /// This is the only way to create a session; the combination makes two
    /// racing starts for the same key resolve deterministically (whichever
    /// transaction commits first wins, the other sees `KeyBusy`).
    pub fn admit_and_create(
        &self,
        new: &NewSession,
        cap: usize,
    ) -> Result<(Session, StreamKey), AdmissionError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::from)?;

        let key = admission::check(&tx, new.stream_key_id, cap)?;

        let start_time = Utc::now();
        tx.execute(
            "INSERT INTO sessions
                 (stream_key_id, mode, video_id, playlist_id, status, start_time,
                  restart_count, loop_playback, max_duration_hours, extra_id)
             VALUES (?1, ?2, ?3, ?4, 'starting', ?5, 0, ?6, ?7, ?8)",
            params![
                new.stream_key_id,
                new.source.mode(),
                new.source.asset_id(),
                new.source.playlist_id(),
                start_time,
                new.loop_playback,
                new.max_duration_hours,
                new.extra_id,
            ],
        )
        .map_err(StoreError::from)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(StoreError::from)?;

        let session = Session {
            id,
            stream_key_id: new.stream_key_id,
            stream_key_name: Some(key.name.clone()),
            source: new.source,
            status: SessionStatus::Starting,
            encoder_pid: None,
            start_time,
            end_time: None,
            restart_count: 0,
            restarted_at: None,
            last_error: None,
            loop_playback: new.loop_playback,
            max_duration_hours: new.max_duration_hours,
            extra_id: new.extra_id.clone(),
        };
        Ok((session, key))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sessions — state transitions
    // ─────────────────────────────────────────────────────────────────────

    /// Applies a guarded transition; distinguishes a missing row from an
    /// illegal from-state when nothing matched.
    fn transition(
        &self,
        session_id: i64,
        attempted: &'static str,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(sql, args)?;
        if n == 1 {
            return Ok(());
        }
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            Err(StoreError::MissingSession(session_id))
        } else {
            Err(StoreError::IllegalTransition {
                session_id,
                attempted,
            })
        }
    }

    /// `starting` → `running` with the freshly spawned pid.
    pub fn mark_running(&self, session_id: i64, pid: u32) -> Result<(), StoreError> {
        self.transition(
            session_id,
            "mark_running",
            "UPDATE sessions SET status = 'running', encoder_pid = ?2
             WHERE id = ?1 AND status = 'starting'",
            &[&session_id, &(pid as i64)],
        )
    }

    /// `running` → `recovering`, capturing the crash reason.
    pub fn mark_recovering(
        &self,
        session_id: i64,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.transition(
            session_id,
            "mark_recovering",
            "UPDATE sessions SET status = 'recovering', last_error = ?2
             WHERE id = ?1 AND status = 'running'",
            &[&session_id, &last_error],
        )
    }

    /// `recovering` → `running` after a successful restart: stores the new
    /// pid, bumps the restart counter, stamps `restarted_at`, clears the
    /// captured error.
    pub fn record_restart(&self, session_id: i64, pid: u32) -> Result<(), StoreError> {
        let now = Utc::now();
        self.transition(
            session_id,
            "record_restart",
            "UPDATE sessions SET status = 'running', encoder_pid = ?2,
                    restart_count = restart_count + 1, restarted_at = ?3, last_error = NULL
             WHERE id = ?1 AND status = 'recovering'",
            &[&session_id, &(pid as i64), &now],
        )
    }

    /// Any active state → `stopped`.
    pub fn mark_stopped(&self, session_id: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        self.transition(
            session_id,
            "mark_stopped",
            "UPDATE sessions SET status = 'stopped', end_time = ?2, encoder_pid = NULL
             WHERE id = ?1 AND status IN ('starting', 'running', 'recovering')",
            &[&session_id, &now],
        )
    }

    /// Any active state → `failed`, recording the terminal error.
    pub fn mark_failed(&self, session_id: i64, last_error: Option<&str>) -> Result<(), StoreError> {
        let now = Utc::now();
        self.transition(
            session_id,
            "mark_failed",
            "UPDATE sessions SET status = 'failed', end_time = ?2, encoder_pid = NULL,
                    last_error = COALESCE(?3, last_error)
             WHERE id = ?1 AND status IN ('starting', 'running', 'recovering')",
            &[&session_id, &now, &last_error],
        )
    }

    /// Any active state → `interrupted` (host process lost the encoder).
    pub fn mark_interrupted(&self, session_id: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        self.transition(
            session_id,
            "mark_interrupted",
            "UPDATE sessions SET status = 'interrupted', end_time = ?2, encoder_pid = NULL
             WHERE id = ?1 AND status IN ('starting', 'running', 'recovering')",
            &[&session_id, &now],
        )
    }

    /// Stability reset: zeroes the restart counter of a running session.
    pub fn reset_restart_count(&self, session_id: i64) -> Result<(), StoreError> {
        self.transition(
            session_id,
            "reset_restart_count",
            "UPDATE sessions SET restart_count = 0
             WHERE id = ?1 AND status = 'running'",
            &[&session_id],
        )
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sessions — queries
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_session(&self, id: i64) -> Result<Session, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions s
                     LEFT JOIN stream_keys k ON k.id = s.stream_key_id
                     WHERE s.id = ?1"
                ),
                params![id],
                RawSession::from_row,
            )
            .optional()?;
        raw.ok_or(StoreError::MissingSession(id))?.into_session()
    }

    pub fn active_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.query_sessions(
            "WHERE s.status IN ('starting', 'running', 'recovering')
             ORDER BY s.start_time DESC",
            &[],
        )
    }

    pub fn active_by_stream_key(&self, stream_key_id: i64) -> Result<Vec<Session>, StoreError> {
        self.query_sessions(
            "WHERE s.stream_key_id = ?1
               AND s.status IN ('starting', 'running', 'recovering')
             ORDER BY s.start_time DESC",
            &[&stream_key_id],
        )
    }

    pub fn count_active(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions
             WHERE status IN ('starting', 'running', 'recovering')",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// History listing: newest first, optionally filtered by status.
    pub fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError> {
        match status {
            Some(status) => self.query_sessions(
                "WHERE s.status = ?1 ORDER BY s.start_time DESC LIMIT ?2",
                &[&status.as_str(), &(limit as i64)],
            ),
            None => self.query_sessions(
                "ORDER BY s.start_time DESC LIMIT ?1",
                &[&(limit as i64)],
            ),
        }
    }

    fn query_sessions(
        &self,
        tail: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions s
             LEFT JOIN stream_keys k ON k.id = s.stream_key_id {tail}"
        ))?;
        let raw = stmt
            .query_map(args, RawSession::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawSession::into_session).collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scheduled triggers
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_trigger(&self, new: &NewTrigger) -> Result<ScheduledTrigger, StoreError> {
        let conn = self.conn.lock();
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO scheduled_triggers
                 (stream_key_id, mode, video_id, playlist_id, scheduled_time,
                  loop_playback, recurrence, max_duration_hours, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
            params![
                new.stream_key_id,
                new.source.mode(),
                new.source.asset_id(),
                new.source.playlist_id(),
                new.scheduled_time,
                new.loop_playback,
                new.recurrence.as_str(),
                new.max_duration_hours,
                created_at,
            ],
        )?;
        Ok(ScheduledTrigger {
            id: conn.last_insert_rowid(),
            stream_key_id: new.stream_key_id,
            source: new.source,
            scheduled_time: new.scheduled_time,
            loop_playback: new.loop_playback,
            recurrence: new.recurrence,
            max_duration_hours: new.max_duration_hours,
            job_id: None,
            status: TriggerStatus::Pending,
            spawned_session_id: None,
            error_message: None,
            created_at,
            started_at: None,
            completed_at: None,
        })
    }

    /// Binds the timer-service handle to the row.
    pub fn set_trigger_job(&self, id: i64, job_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE scheduled_triggers SET job_id = ?2 WHERE id = ?1",
            params![id, job_id],
        )?;
        if n == 1 {
            Ok(())
        } else {
            Err(StoreError::MissingTrigger(id))
        }
    }

    pub fn get_trigger(&self, id: i64) -> Result<ScheduledTrigger, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {TRIGGER_COLUMNS} FROM scheduled_triggers WHERE id = ?1"),
                params![id],
                RawTrigger::from_row,
            )
            .optional()?;
        raw.ok_or(StoreError::MissingTrigger(id))?.into_trigger()
    }

    pub fn list_triggers(
        &self,
        status: Option<TriggerStatus>,
        stream_key_id: Option<i64>,
    ) -> Result<Vec<ScheduledTrigger>, StoreError> {
        let conn = self.conn.lock();
        let mut sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM scheduled_triggers WHERE 1 = 1"
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(key_id) = stream_key_id {
            sql.push_str(&format!(" AND stream_key_id = ?{}", args.len() + 1));
            args.push(Box::new(key_id));
        }
        sql.push_str(" ORDER BY scheduled_time DESC");

        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let raw = stmt
            .query_map(params_ref.as_slice(), RawTrigger::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawTrigger::into_trigger).collect()
    }

    pub fn pending_triggers(&self) -> Result<Vec<ScheduledTrigger>, StoreError> {
        self.list_triggers(Some(TriggerStatus::Pending), None)
    }

    pub fn running_triggers(&self) -> Result<Vec<ScheduledTrigger>, StoreError> {
        self.list_triggers(Some(TriggerStatus::Running), None)
    }

    /// Atomically claims a pending trigger for execution (`pending` →
    /// `running`). Returns `false` when the row is no longer pending, which
    /// makes firing idempotent: a stale timer cannot double-spawn.
    pub fn claim_trigger(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let now = Utc::now();
        let n = conn.execute(
            "UPDATE scheduled_triggers SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )?;
        Ok(n == 1)
    }

    /// Records the spawned session on a claimed trigger without finalizing
    /// it. Written before the completed/failed finalize so a crash in
    /// between leaves a reconcilable row.
    pub fn link_trigger_session(&self, id: i64, session_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE scheduled_triggers SET spawned_session_id = ?2
             WHERE id = ?1 AND status = 'running'",
            params![id, session_id],
        )?;
        if n == 1 {
            Ok(())
        } else {
            Err(StoreError::MissingTrigger(id))
        }
    }

    /// `running` → `completed`, linking the spawned session.
    pub fn finalize_trigger_completed(
        &self,
        id: i64,
        session_id: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let now = Utc::now();
        let n = conn.execute(
            "UPDATE scheduled_triggers
             SET status = 'completed', spawned_session_id = ?2, completed_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id, session_id, now],
        )?;
        if n == 1 {
            Ok(())
        } else {
            Err(StoreError::MissingTrigger(id))
        }
    }

    /// `running` → `failed` with the fire-time error recorded.
    pub fn finalize_trigger_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let now = Utc::now();
        let n = conn.execute(
            "UPDATE scheduled_triggers
             SET status = 'failed', error_message = ?2, completed_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id, error, now],
        )?;
        if n == 1 {
            Ok(())
        } else {
            Err(StoreError::MissingTrigger(id))
        }
    }

    /// Cancels a pending trigger. Returns `false` when the row exists but is
    /// not pending (completed, running, already cancelled).
    pub fn cancel_trigger(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let now = Utc::now();
        let n = conn.execute(
            "UPDATE scheduled_triggers SET status = 'cancelled', completed_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )?;
        Ok(n == 1)
    }

    /// Rewrites a pending trigger's content and fire time. Returns `false`
    /// when the row exists but is not pending.
    pub fn update_trigger(&self, id: i64, new: &NewTrigger) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE scheduled_triggers
             SET stream_key_id = ?2, mode = ?3, video_id = ?4, playlist_id = ?5,
                 scheduled_time = ?6, loop_playback = ?7, recurrence = ?8,
                 max_duration_hours = ?9
             WHERE id = ?1 AND status = 'pending'",
            params![
                id,
                new.stream_key_id,
                new.source.mode(),
                new.source.asset_id(),
                new.source.playlist_id(),
                new.scheduled_time,
                new.loop_playback,
                new.recurrence.as_str(),
                new.max_duration_hours,
            ],
        )?;
        Ok(n == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::open_in_memory().unwrap()
    }

    fn new_session(key_id: i64) -> NewSession {
        NewSession {
            stream_key_id: key_id,
            source: StreamSource::Single { asset_id: 1 },
            loop_playback: true,
            max_duration_hours: 0,
            extra_id: None,
        }
    }

    fn seeded(store: &SessionStore) -> StreamKey {
        store.create_asset("intro", "/media/intro.mp4", 120.0, AssetSource::Uploaded)
            .unwrap();
        store.create_stream_key("Main", "abcd-efgh-ijkl-mnop").unwrap()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn admit_unknown_key_is_rejected() {
        let store = store();
        let err = store.admit_and_create(&new_session(99), 10).unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownKey(99)));
    }

    #[test]
    fn admit_inactive_key_is_rejected() {
        let store = store();
        let key = seeded(&store);
        store.set_stream_key_active(key.id, false).unwrap();
        let err = store.admit_and_create(&new_session(key.id), 10).unwrap_err();
        assert!(matches!(err, AdmissionError::InactiveKey(_)));
    }

    #[test]
    fn admit_busy_key_is_rejected_and_first_session_untouched() {
        let store = store();
        let key = seeded(&store);
        let (first, _) = store.admit_and_create(&new_session(key.id), 10).unwrap();

        let err = store.admit_and_create(&new_session(key.id), 10).unwrap_err();
        match err {
            AdmissionError::KeyBusy { key_id, session_id } => {
                assert_eq!(key_id, key.id);
                assert_eq!(session_id, first.id);
            }
            other => panic!("expected KeyBusy, got {other:?}"),
        }
        assert_eq!(store.count_active().unwrap(), 1);
        assert_eq!(
            store.get_session(first.id).unwrap().status,
            SessionStatus::Starting
        );
    }

    #[test]
    fn admit_enforces_global_cap() {
        let store = store();
        let key1 = seeded(&store);
        let key2 = store.create_stream_key("Second", "second-key-0001").unwrap();
        let key3 = store.create_stream_key("Third", "third-key-0001").unwrap();

        store.admit_and_create(&new_session(key1.id), 2).unwrap();
        store.admit_and_create(&new_session(key2.id), 2).unwrap();
        let err = store.admit_and_create(&new_session(key3.id), 2).unwrap_err();
        assert!(matches!(err, AdmissionError::CapacityExhausted { cap: 2 }));
        assert_eq!(store.count_active().unwrap(), 2);
    }

    #[test]
    fn terminal_session_releases_key_and_capacity() {
        let store = store();
        let key = seeded(&store);
        let (session, _) = store.admit_and_create(&new_session(key.id), 1).unwrap();
        store.mark_running(session.id, 100).unwrap();
        store.mark_stopped(session.id).unwrap();

        // Same key admits again once the previous session is terminal.
        store.admit_and_create(&new_session(key.id), 1).unwrap();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn full_lifecycle_transitions() {
        let store = store();
        let key = seeded(&store);
        let (session, _) = store.admit_and_create(&new_session(key.id), 10).unwrap();

        store.mark_running(session.id, 4242).unwrap();
        let s = store.get_session(session.id).unwrap();
        assert_eq!(s.status, SessionStatus::Running);
        assert_eq!(s.encoder_pid, Some(4242));

        store.mark_recovering(session.id, Some("broken pipe")).unwrap();
        let s = store.get_session(session.id).unwrap();
        assert_eq!(s.status, SessionStatus::Recovering);
        assert_eq!(s.last_error.as_deref(), Some("broken pipe"));
        // Recovering keeps the stale pid until the restart supplies a new one.
        assert_eq!(s.encoder_pid, Some(4242));

        store.record_restart(session.id, 4300).unwrap();
        let s = store.get_session(session.id).unwrap();
        assert_eq!(s.status, SessionStatus::Running);
        assert_eq!(s.encoder_pid, Some(4300));
        assert_eq!(s.restart_count, 1);
        assert!(s.restarted_at.is_some());
        assert!(s.last_error.is_none());

        store.mark_stopped(session.id).unwrap();
        let s = store.get_session(session.id).unwrap();
        assert_eq!(s.status, SessionStatus::Stopped);
        assert!(s.encoder_pid.is_none());
        assert!(s.end_time.is_some());
        assert!(s.end_time.unwrap() >= s.start_time);
    }

    #[test]
    fn illegal_transition_is_detected() {
        let store = store();
        let key = seeded(&store);
        let (session, _) = store.admit_and_create(&new_session(key.id), 10).unwrap();
        store.mark_running(session.id, 1).unwrap();
        store.mark_stopped(session.id).unwrap();

        let err = store.mark_running(session.id, 2).unwrap_err();
        assert!(matches!(
            err,
            StoreError::IllegalTransition {
                attempted: "mark_running",
                ..
            }
        ));
    }

    #[test]
    fn transition_on_missing_session_reports_missing() {
        let store = store();
        let err = store.mark_stopped(404).unwrap_err();
        assert!(matches!(err, StoreError::MissingSession(404)));
    }

    #[test]
    fn mark_failed_keeps_previous_error_when_none_supplied() {
        let store = store();
        let key = seeded(&store);
        let (session, _) = store.admit_and_create(&new_session(key.id), 10).unwrap();
        store.mark_running(session.id, 1).unwrap();
        store.mark_recovering(session.id, Some("io error")).unwrap();
        store.record_restart(session.id, 2).unwrap();
        store.mark_recovering(session.id, Some("io error again")).unwrap();

        // Recovering → failed is legal (retries exhausted while recovering).
        store.mark_failed(session.id, None).unwrap();
        let s = store.get_session(session.id).unwrap();
        assert_eq!(s.status, SessionStatus::Failed);
        assert_eq!(s.last_error.as_deref(), Some("io error again"));
    }

    #[test]
    fn reset_restart_count_only_applies_to_running() {
        let store = store();
        let key = seeded(&store);
        let (session, _) = store.admit_and_create(&new_session(key.id), 10).unwrap();
        store.mark_running(session.id, 1).unwrap();
        store.mark_recovering(session.id, None).unwrap();
        store.record_restart(session.id, 2).unwrap();

        store.reset_restart_count(session.id).unwrap();
        assert_eq!(store.get_session(session.id).unwrap().restart_count, 0);

        store.mark_stopped(session.id).unwrap();
        assert!(store.reset_restart_count(session.id).is_err());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn active_queries_see_all_three_active_states() {
        let store = store();
        let key = seeded(&store);
        let key2 = store.create_stream_key("Second", "second-key-0001").unwrap();
        let (s1, _) = store.admit_and_create(&new_session(key.id), 10).unwrap();
        let (s2, _) = store.admit_and_create(&new_session(key2.id), 10).unwrap();

        store.mark_running(s2.id, 7).unwrap();
        store.mark_recovering(s2.id, None).unwrap();

        assert_eq!(store.count_active().unwrap(), 2);
        assert_eq!(store.active_sessions().unwrap().len(), 2);
        let by_key = store.active_by_stream_key(key.id).unwrap();
        assert_eq!(by_key.len(), 1);
        assert_eq!(by_key[0].id, s1.id);
    }

    #[test]
    fn history_filters_by_status() {
        let store = store();
        let key = seeded(&store);
        let (s1, _) = store.admit_and_create(&new_session(key.id), 10).unwrap();
        store.mark_running(s1.id, 1).unwrap();
        store.mark_stopped(s1.id).unwrap();
        let (s2, _) = store.admit_and_create(&new_session(key.id), 10).unwrap();
        store.mark_running(s2.id, 2).unwrap();
        store.mark_failed(s2.id, Some("crash loop")).unwrap();

        let stopped = store.list_sessions(Some(SessionStatus::Stopped), 50).unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].id, s1.id);

        let all = store.list_sessions(None, 50).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn session_join_carries_key_name() {
        let store = store();
        let key = seeded(&store);
        let (session, _) = store.admit_and_create(&new_session(key.id), 10).unwrap();
        let s = store.get_session(session.id).unwrap();
        assert_eq!(s.stream_key_name.as_deref(), Some("Main"));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Assets & playlists
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn delete_asset_refused_while_session_active() {
        let store = store();
        let key = seeded(&store);
        store.admit_and_create(&new_session(key.id), 10).unwrap();
        let err = store.delete_asset(1).unwrap_err();
        assert!(matches!(err, StoreError::AssetInUse(1)));
    }

    #[test]
    fn delete_asset_refused_while_playlist_of_active_session_contains_it() {
        let store = store();
        let key = seeded(&store);
        let playlist = store
            .create_playlist("mix", PlaybackOrder::Sequence, &[1])
            .unwrap();
        let new = NewSession {
            stream_key_id: key.id,
            source: StreamSource::Playlist {
                playlist_id: playlist.id,
            },
            loop_playback: true,
            max_duration_hours: 0,
            extra_id: None,
        };
        store.admit_and_create(&new, 10).unwrap();
        let err = store.delete_asset(1).unwrap_err();
        assert!(matches!(err, StoreError::AssetInUse(1)));
    }

    #[test]
    fn delete_asset_succeeds_once_unreferenced() {
        let store = store();
        let key = seeded(&store);
        let (session, _) = store.admit_and_create(&new_session(key.id), 10).unwrap();
        store.mark_running(session.id, 1).unwrap();
        store.mark_stopped(session.id).unwrap();
        assert!(store.delete_asset(1).unwrap());
        assert!(!store.delete_asset(1).unwrap());
    }

    #[test]
    fn playlist_round_trip_preserves_order() {
        let store = store();
        let playlist = store
            .create_playlist("mix", PlaybackOrder::Random, &[3, 1, 2])
            .unwrap();
        let loaded = store.get_playlist(playlist.id).unwrap().unwrap();
        assert_eq!(loaded.asset_ids, vec![3, 1, 2]);
        assert_eq!(loaded.order, PlaybackOrder::Random);

        assert!(store
            .update_playlist(playlist.id, "mix2", PlaybackOrder::Sequence, &[2, 3])
            .unwrap());
        let loaded = store.get_playlist(playlist.id).unwrap().unwrap();
        assert_eq!(loaded.name, "mix2");
        assert_eq!(loaded.asset_ids, vec![2, 3]);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Triggers
    // ─────────────────────────────────────────────────────────────────────

    fn new_trigger(key_id: i64, at: DateTime<Utc>) -> NewTrigger {
        NewTrigger {
            stream_key_id: key_id,
            source: StreamSource::Single { asset_id: 1 },
            scheduled_time: at,
            loop_playback: true,
            recurrence: Recurrence::Daily,
            max_duration_hours: 0,
        }
    }

    #[test]
    fn claim_is_idempotent() {
        let store = store();
        let key = seeded(&store);
        let trigger = store
            .create_trigger(&new_trigger(key.id, Utc::now()))
            .unwrap();

        assert!(store.claim_trigger(trigger.id).unwrap());
        // A second (stale) fire is a no-op.
        assert!(!store.claim_trigger(trigger.id).unwrap());
    }

    #[test]
    fn cancel_only_applies_to_pending() {
        let store = store();
        let key = seeded(&store);
        let trigger = store
            .create_trigger(&new_trigger(key.id, Utc::now()))
            .unwrap();

        store.claim_trigger(trigger.id).unwrap();
        assert!(!store.cancel_trigger(trigger.id).unwrap());

        let other = store
            .create_trigger(&new_trigger(key.id, Utc::now()))
            .unwrap();
        assert!(store.cancel_trigger(other.id).unwrap());
        assert_eq!(
            store.get_trigger(other.id).unwrap().status,
            TriggerStatus::Cancelled
        );
    }

    #[test]
    fn finalize_completed_links_session() {
        let store = store();
        let key = seeded(&store);
        let trigger = store
            .create_trigger(&new_trigger(key.id, Utc::now()))
            .unwrap();
        let (session, _) = store.admit_and_create(&new_session(key.id), 10).unwrap();

        store.claim_trigger(trigger.id).unwrap();
        store
            .finalize_trigger_completed(trigger.id, session.id)
            .unwrap();

        let t = store.get_trigger(trigger.id).unwrap();
        assert_eq!(t.status, TriggerStatus::Completed);
        assert_eq!(t.spawned_session_id, Some(session.id));
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn update_only_applies_to_pending() {
        let store = store();
        let key = seeded(&store);
        let trigger = store
            .create_trigger(&new_trigger(key.id, Utc::now()))
            .unwrap();

        let mut updated = new_trigger(key.id, Utc::now() + chrono::Duration::hours(1));
        updated.recurrence = Recurrence::Weekly;
        assert!(store.update_trigger(trigger.id, &updated).unwrap());
        let t = store.get_trigger(trigger.id).unwrap();
        assert_eq!(t.recurrence, Recurrence::Weekly);

        store.claim_trigger(trigger.id).unwrap();
        assert!(!store.update_trigger(trigger.id, &updated).unwrap());
    }

    #[test]
    fn list_triggers_filters() {
        let store = store();
        let key = seeded(&store);
        let key2 = store.create_stream_key("Second", "second-key-0001").unwrap();
        let t1 = store
            .create_trigger(&new_trigger(key.id, Utc::now()))
            .unwrap();
        let _t2 = store
            .create_trigger(&new_trigger(key2.id, Utc::now()))
            .unwrap();
        store.claim_trigger(t1.id).unwrap();

        assert_eq!(store.pending_triggers().unwrap().len(), 1);
        assert_eq!(store.running_triggers().unwrap().len(), 1);
        assert_eq!(
            store
                .list_triggers(None, Some(key.id))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn scheduled_time_round_trips_as_utc() {
        use chrono::TimeZone;
        let store = store();
        let key = seeded(&store);
        let at = Utc.with_ymd_and_hms(2030, 3, 1, 6, 30, 0).unwrap();
        let trigger = store.create_trigger(&new_trigger(key.id, at)).unwrap();
        let loaded = store.get_trigger(trigger.id).unwrap();
        assert_eq!(loaded.scheduled_time, at);
        assert_eq!(loaded.to_json()["scheduled_time"], "2030-03-01T06:30:00Z");
    }
}
