//! SQLite schema for the session store.

/// Schema applied on every open. All statements are idempotent, so opening
/// an existing database is a no-op.
pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stream_keys (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    secret      TEXT NOT NULL UNIQUE,
    active      INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS assets (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    name              TEXT NOT NULL,
    path              TEXT NOT NULL UNIQUE,
    duration_seconds  REAL NOT NULL DEFAULT 0,
    source            TEXT NOT NULL DEFAULT 'uploaded',
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS playlists (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    play_order  TEXT NOT NULL DEFAULT 'sequence',
    asset_ids   TEXT NOT NULL DEFAULT '[]',
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_key_id       INTEGER NOT NULL REFERENCES stream_keys(id),
    mode                TEXT NOT NULL,
    video_id            INTEGER REFERENCES assets(id),
    playlist_id         INTEGER REFERENCES playlists(id),
    status              TEXT NOT NULL,
    encoder_pid         INTEGER,
    start_time          TEXT NOT NULL,
    end_time            TEXT,
    restart_count       INTEGER NOT NULL DEFAULT 0,
    restarted_at        TEXT,
    last_error          TEXT,
    loop_playback       INTEGER NOT NULL DEFAULT 1,
    max_duration_hours  INTEGER NOT NULL DEFAULT 0,
    extra_id            TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_stream_key ON sessions(stream_key_id);

CREATE TABLE IF NOT EXISTS scheduled_triggers (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_key_id       INTEGER NOT NULL REFERENCES stream_keys(id),
    mode                TEXT NOT NULL,
    video_id            INTEGER,
    playlist_id         INTEGER,
    scheduled_time      TEXT NOT NULL,
    loop_playback       INTEGER NOT NULL DEFAULT 1,
    recurrence          TEXT NOT NULL DEFAULT 'none',
    max_duration_hours  INTEGER NOT NULL DEFAULT 0,
    job_id              TEXT UNIQUE,
    status              TEXT NOT NULL DEFAULT 'pending',
    spawned_session_id  INTEGER REFERENCES sessions(id),
    error_message       TEXT,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    completed_at        TEXT
);

CREATE INDEX IF NOT EXISTS idx_triggers_status ON scheduled_triggers(status);
";
