//! Persistent entity types.
//!
//! These are the rows of the SQLite store plus the enums that give their
//! string columns a closed vocabulary. Session content is a tagged sum type
//! ([`StreamSource`]); the `mode` string only exists at the serialization
//! boundary, so a session can never carry both a video and a playlist.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Formats a UTC timestamp with an explicit `Z` designator.
pub(crate) fn to_utc_string(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream Keys
// ─────────────────────────────────────────────────────────────────────────────

/// Credential for one RTMP ingest endpoint.
#[derive(Debug, Clone)]
pub struct StreamKey {
    pub id: i64,
    /// Human-readable label ("Lofi 1", "Backup", ...).
    pub name: String,
    /// The raw ingest secret. Never serialized; use [`StreamKey::masked_secret`].
    pub secret: String,
    /// Soft-retire flag. Inactive keys are rejected by admission.
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl StreamKey {
    /// Masked form of the secret (only the last 4 characters survive).
    pub fn masked_secret(&self) -> String {
        if self.secret.len() <= 4 {
            return self.secret.clone();
        }
        format!("****-****-{}", &self.secret[self.secret.len() - 4..])
    }

    /// API representation; the secret is masked.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "stream_key": self.masked_secret(),
            "is_active": self.active,
            "created_at": to_utc_string(self.created_at),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Assets
// ─────────────────────────────────────────────────────────────────────────────

/// Where an asset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetSource {
    Uploaded,
    Downloaded,
    Scanned,
}

impl AssetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Downloaded => "downloaded",
            Self::Scanned => "scanned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(Self::Uploaded),
            "downloaded" => Some(Self::Downloaded),
            "scanned" => Some(Self::Scanned),
            _ => None,
        }
    }
}

/// An immutable reference to a playable file.
#[derive(Debug, Clone, Serialize)]
pub struct Asset {
    pub id: i64,
    pub name: String,
    /// Absolute path of the media file.
    pub path: String,
    pub duration_seconds: f64,
    pub source: AssetSource,
    pub created_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Playlists
// ─────────────────────────────────────────────────────────────────────────────

/// Playback ordering of a playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackOrder {
    Sequence,
    Random,
}

impl PlaybackOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Random => "random",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sequence" => Some(Self::Sequence),
            "random" => Some(Self::Random),
            _ => None,
        }
    }
}

/// An ordered sequence of asset ids with a playback order.
#[derive(Debug, Clone, Serialize)]
pub struct Playlist {
    pub id: i64,
    pub name: String,
    pub order: PlaybackOrder,
    /// Asset ids in playback order (authoritative for `sequence` mode).
    pub asset_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream Source (session content)
// ─────────────────────────────────────────────────────────────────────────────

/// What a session streams: exactly one asset, or one playlist.
///
/// The tagged representation makes "exactly one of video_id / playlist_id"
/// a structural guarantee instead of a runtime check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Single { asset_id: i64 },
    Playlist { playlist_id: i64 },
}

impl StreamSource {
    /// The wire-format `mode` string.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Single { .. } => "single",
            Self::Playlist { .. } => "playlist",
        }
    }

    pub fn asset_id(&self) -> Option<i64> {
        match self {
            Self::Single { asset_id } => Some(*asset_id),
            Self::Playlist { .. } => None,
        }
    }

    pub fn playlist_id(&self) -> Option<i64> {
        match self {
            Self::Single { .. } => None,
            Self::Playlist { playlist_id } => Some(*playlist_id),
        }
    }

    /// Reconstructs a source from its database columns.
    ///
    /// Returns `None` when the columns violate the mode invariant, which can
    /// only happen through out-of-band writes to the database.
    pub fn from_columns(
        mode: &str,
        video_id: Option<i64>,
        playlist_id: Option<i64>,
    ) -> Option<Self> {
        match (mode, video_id, playlist_id) {
            ("single", Some(asset_id), None) => Some(Self::Single { asset_id }),
            ("playlist", None, Some(playlist_id)) => Some(Self::Playlist { playlist_id }),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Recovering,
    Stopped,
    Failed,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Recovering => "recovering",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "recovering" => Some(Self::Recovering),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }

    /// Active states hold admission capacity and may own an encoder process.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Recovering)
    }

    /// Terminal states carry an `end_time`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Interrupted)
    }
}

/// One in-flight or completed streaming attempt.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: i64,
    pub stream_key_id: i64,
    /// Joined from the stream key row for display purposes.
    pub stream_key_name: Option<String>,
    pub source: StreamSource,
    pub status: SessionStatus,
    pub encoder_pid: Option<u32>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub restart_count: u32,
    /// Time of the most recent successful restart; basis for stability reset.
    pub restarted_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub loop_playback: bool,
    /// 0 = unbounded.
    pub max_duration_hours: u32,
    /// Opaque external broadcast id, stored and echoed verbatim.
    pub extra_id: Option<String>,
}

impl Session {
    /// Session duration so far (or final duration once ended), in seconds.
    pub fn duration_seconds(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    /// Formatted duration (HH:MM:SS).
    pub fn duration_formatted(&self) -> String {
        let total = self.duration_seconds().max(0.0) as u64;
        format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
    }

    /// Instant the current run began: the last restart if any, else start.
    pub fn running_since(&self) -> DateTime<Utc> {
        self.restarted_at.unwrap_or(self.start_time)
    }

    /// API representation.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "stream_key_id": self.stream_key_id,
            "stream_key_name": self.stream_key_name,
            "mode": self.source.mode(),
            "video_id": self.source.asset_id(),
            "playlist_id": self.source.playlist_id(),
            "status": self.status,
            "encoder_pid": self.encoder_pid,
            "start_time": to_utc_string(self.start_time),
            "end_time": self.end_time.map(to_utc_string),
            "restart_count": self.restart_count,
            "last_error": self.last_error,
            "loop": self.loop_playback,
            "max_duration_hours": self.max_duration_hours,
            "extra_id": self.extra_id,
            "duration_seconds": self.duration_seconds(),
            "is_active": self.status.is_active(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduled Triggers
// ─────────────────────────────────────────────────────────────────────────────

/// Recurrence of a scheduled trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    None,
    Daily,
    Weekly,
}

impl Recurrence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            _ => None,
        }
    }

    /// Interval to the next occurrence, if recurring.
    pub fn interval(&self) -> Option<chrono::Duration> {
        match self {
            Self::None => None,
            Self::Daily => Some(chrono::Duration::days(1)),
            Self::Weekly => Some(chrono::Duration::weeks(1)),
        }
    }
}

/// Lifecycle state of a scheduled trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A deferred intent to create a session.
#[derive(Debug, Clone)]
pub struct ScheduledTrigger {
    pub id: i64,
    pub stream_key_id: i64,
    pub source: StreamSource,
    /// Always UTC inside the system.
    pub scheduled_time: DateTime<Utc>,
    pub loop_playback: bool,
    pub recurrence: Recurrence,
    pub max_duration_hours: u32,
    /// Opaque handle to the timer service; set while a timer is armed.
    pub job_id: Option<String>,
    pub status: TriggerStatus,
    pub spawned_session_id: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScheduledTrigger {
    /// API representation. `scheduled_time` always carries the `Z` designator.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "stream_key_id": self.stream_key_id,
            "mode": self.source.mode(),
            "video_id": self.source.asset_id(),
            "playlist_id": self.source.playlist_id(),
            "scheduled_time": to_utc_string(self.scheduled_time),
            "loop": self.loop_playback,
            "recurrence": self.recurrence,
            "max_duration_hours": self.max_duration_hours,
            "job_id": self.job_id,
            "status": self.status,
            "live_session_id": self.spawned_session_id,
            "error_message": self.error_message,
            "created_at": to_utc_string(self.created_at),
            "started_at": self.started_at.map(to_utc_string),
            "completed_at": self.completed_at.map(to_utc_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stream_key_masks_all_but_last_four() {
        let key = StreamKey {
            id: 1,
            name: "Main".into(),
            secret: "abcd-efgh-ijkl-mnop".into(),
            active: true,
            created_at: Utc::now(),
        };
        assert_eq!(key.masked_secret(), "****-****-mnop");
        let json = key.to_json();
        assert_eq!(json["stream_key"], "****-****-mnop");
        assert!(json.to_string().find("abcd").is_none());
    }

    #[test]
    fn short_secret_is_not_expanded() {
        let key = StreamKey {
            id: 1,
            name: "k".into(),
            secret: "abc".into(),
            active: true,
            created_at: Utc::now(),
        };
        assert_eq!(key.masked_secret(), "abc");
    }

    #[test]
    fn stream_source_columns_round_trip() {
        let single = StreamSource::Single { asset_id: 5 };
        assert_eq!(
            StreamSource::from_columns(single.mode(), single.asset_id(), single.playlist_id()),
            Some(single)
        );

        let playlist = StreamSource::Playlist { playlist_id: 9 };
        assert_eq!(
            StreamSource::from_columns(playlist.mode(), playlist.asset_id(), playlist.playlist_id()),
            Some(playlist)
        );
    }

    #[test]
    fn stream_source_rejects_ambiguous_columns() {
        assert_eq!(StreamSource::from_columns("single", Some(1), Some(2)), None);
        assert_eq!(StreamSource::from_columns("playlist", None, None), None);
        assert_eq!(StreamSource::from_columns("music", Some(1), None), None);
    }

    #[test]
    fn active_and_terminal_states_partition() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Recovering,
        ] {
            assert!(status.is_active());
            assert!(!status.is_terminal());
        }
        for status in [
            SessionStatus::Stopped,
            SessionStatus::Failed,
            SessionStatus::Interrupted,
        ] {
            assert!(!status.is_active());
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Recovering,
            SessionStatus::Stopped,
            SessionStatus::Failed,
            SessionStatus::Interrupted,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("zombie"), None);
    }

    #[test]
    fn recurrence_intervals() {
        assert_eq!(Recurrence::None.interval(), None);
        assert_eq!(Recurrence::Daily.interval(), Some(chrono::Duration::days(1)));
        assert_eq!(
            Recurrence::Weekly.interval(),
            Some(chrono::Duration::weeks(1))
        );
    }

    #[test]
    fn session_duration_uses_end_time_when_present() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 1, 13, 30, 5).unwrap();
        let session = Session {
            id: 1,
            stream_key_id: 1,
            stream_key_name: None,
            source: StreamSource::Single { asset_id: 1 },
            status: SessionStatus::Stopped,
            encoder_pid: None,
            start_time: start,
            end_time: Some(end),
            restart_count: 0,
            restarted_at: None,
            last_error: None,
            loop_playback: true,
            max_duration_hours: 0,
            extra_id: None,
        };
        assert_eq!(session.duration_seconds(), 5405.0);
        assert_eq!(session.duration_formatted(), "01:30:05");
    }

    #[test]
    fn session_json_serializes_utc_with_z() {
        let session = Session {
            id: 2,
            stream_key_id: 3,
            stream_key_name: Some("Main".into()),
            source: StreamSource::Playlist { playlist_id: 7 },
            status: SessionStatus::Running,
            encoder_pid: Some(4242),
            start_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            end_time: None,
            restart_count: 1,
            restarted_at: None,
            last_error: None,
            loop_playback: true,
            max_duration_hours: 0,
            extra_id: None,
        };
        let json = session.to_json();
        assert_eq!(json["start_time"], "2025-06-01T12:00:00Z");
        assert_eq!(json["mode"], "playlist");
        assert_eq!(json["playlist_id"], 7);
        assert_eq!(json["video_id"], serde_json::Value::Null);
        assert_eq!(json["status"], "running");
    }
}
