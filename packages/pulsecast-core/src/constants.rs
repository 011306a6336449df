//! Fixed operational constants for session supervision.
//!
//! These values define the timing contract of the supervisor, health monitor
//! and telemetry loops. Changing them changes externally observable recovery
//! behavior (restart backoff, duration-cap precision), so they live here
//! rather than in user-facing configuration.

// ─────────────────────────────────────────────────────────────────────────────
// Encoder Supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between supervisor watcher passes over the process registry (seconds).
pub const WATCHER_POLL_INTERVAL_SECS: u64 = 2;

/// Maximum in-process restart attempts before a session is finalized as failed.
pub const SUPERVISOR_MAX_RETRIES: u32 = 5;

/// Base of the supervisor's exponential restart backoff (seconds).
///
/// The k-th retry waits `5 * 2^k` seconds with k capped at
/// [`SUPERVISOR_BACKOFF_CAP_EXP`], yielding 5, 10, 20, 40, 80.
pub const SUPERVISOR_BACKOFF_BASE_SECS: u64 = 5;

/// Cap on the backoff exponent (delays stop growing past `5 * 2^4` = 80s).
pub const SUPERVISOR_BACKOFF_CAP_EXP: u32 = 4;

/// How long a graceful quit (the encoder's `q` stdin command) may take
/// before escalating to SIGTERM (seconds).
pub const GRACEFUL_QUIT_TIMEOUT_SECS: u64 = 5;

/// How long SIGTERM may take before escalating to SIGKILL (seconds).
pub const TERMINATE_TIMEOUT_SECS: u64 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Health Monitor
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between health-monitor passes over active sessions (seconds).
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 10;

/// Delayed-restart schedule used by the health monitor, indexed by the
/// session's persisted `restart_count`. Reaching the end of the table
/// finalizes the session as failed.
pub const MONITOR_RESTART_DELAYS_SECS: [u64; 5] = [5, 30, 120, 300, 600];

/// Continuous uptime since the most recent restart after which the
/// restart counter is reset to zero (seconds).
///
/// A later crash of a long-stable stream is then treated as a first
/// failure instead of exhausting the remaining retries.
pub const STABILITY_RESET_SECS: i64 = 3600;

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between status snapshots pushed to monitoring subscribers (seconds).
pub const SNAPSHOT_INTERVAL_SECS: u64 = 2;

/// Number of trailing log lines scanned for encoder progress stats.
pub const STATS_SCAN_LINES: usize = 5;

/// Number of trailing log lines sent when a log subscriber first attaches.
pub const LOG_TAIL_INITIAL_LINES: usize = 50;

/// Poll interval while following a session log for appends (milliseconds).
pub const LOG_FOLLOW_POLL_MS: u64 = 100;

/// Number of trailing log lines scanned when extracting a crash reason.
pub const LAST_ERROR_SCAN_LINES: usize = 20;

// ─────────────────────────────────────────────────────────────────────────────
// Admission
// ─────────────────────────────────────────────────────────────────────────────

/// Default global cap on concurrently active sessions.
///
/// Override with the `MAX_CONCURRENT_STREAMS` environment variable or the
/// server configuration file.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier returned by the health endpoint.
pub const SERVICE_ID: &str = "pulsecast";
