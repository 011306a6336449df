//! Centralized error types for the Pulsecast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::encoder::EncoderError;
use crate::services::scheduler::ScheduleError;
use crate::store::admission::AdmissionError;
use crate::store::StoreError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for AdmissionError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnknownKey(_) => "unknown_key",
            Self::InactiveKey(_) => "inactive_key",
            Self::KeyBusy { .. } => "key_busy",
            Self::CapacityExhausted { .. } => "capacity_exhausted",
            Self::Store(_) => "store_error",
        }
    }
}

impl ErrorCode for EncoderError {
    fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning(_) => "already_running",
            Self::NoAssets => "no_assets",
            Self::EmptyPlan => "empty_plan",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::StopTimeout(_) => "stop_timeout",
            Self::ManifestIo(_) => "manifest_io",
        }
    }
}

impl ErrorCode for ScheduleError {
    fn code(&self) -> &'static str {
        match self {
            Self::PastScheduledTime(_) => "past_scheduled_time",
            Self::BadRecurrence(_) => "bad_recurrence",
            Self::NotPending { .. } => "not_pending",
        }
    }
}

/// Application-wide error type for the Pulsecast control plane.
#[derive(Debug, Error)]
pub enum LiveError {
    // ── Validation ──────────────────────────────────────────────────────────
    /// A mode/source discriminator is outside its closed vocabulary
    /// (session mode, playlist order, asset source).
    #[error("Invalid mode '{0}'")]
    BadMode(String),

    /// The content id matching the requested mode is missing.
    #[error("{0}")]
    MissingContentId(&'static str),

    /// Referenced asset does not exist.
    #[error("Asset {0} not found")]
    UnknownAsset(i64),

    /// Referenced playlist does not exist.
    #[error("Playlist {0} not found")]
    UnknownPlaylist(i64),

    /// Playlist resolves to zero playable assets.
    #[error("Playlist {0} has no assets")]
    EmptyPlaylist(i64),

    // ── Policy ──────────────────────────────────────────────────────────────
    /// Admission rejected the start request.
    #[error(transparent)]
    Admission(AdmissionError),

    /// Schedule operation rejected.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    // ── Runtime ─────────────────────────────────────────────────────────────
    /// Encoder supervisor failure.
    #[error(transparent)]
    Encoder(EncoderError),

    /// Orphaned encoder processes could not all be killed.
    #[error("Failed to kill {0} orphaned encoder process(es)")]
    OrphanKillFailed(usize),

    // ── Consistency ─────────────────────────────────────────────────────────
    /// Session row does not exist.
    #[error("Session {0} not found")]
    MissingSession(i64),

    /// Scheduled trigger row does not exist.
    #[error("Schedule {0} not found")]
    MissingTrigger(i64),

    /// Store-level failure (includes illegal state transitions).
    #[error(transparent)]
    Store(StoreError),
}

impl LiveError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadMode(_) => "bad_mode",
            Self::MissingContentId(_) => "missing_content_id",
            Self::UnknownAsset(_) => "unknown_asset",
            Self::UnknownPlaylist(_) => "unknown_playlist",
            Self::EmptyPlaylist(_) => "empty_playlist",
            Self::Admission(e) => e.code(),
            Self::Schedule(e) => e.code(),
            Self::Encoder(e) => e.code(),
            Self::OrphanKillFailed(_) => "orphan_kill_failed",
            Self::MissingSession(_) => "missing_session",
            Self::MissingTrigger(_) => "missing_trigger",
            Self::Store(StoreError::IllegalTransition { .. }) => "illegal_transition",
            Self::Store(_) => "store_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadMode(_)
            | Self::MissingContentId(_)
            | Self::EmptyPlaylist(_)
            | Self::Schedule(_) => StatusCode::BAD_REQUEST,
            Self::UnknownAsset(_)
            | Self::UnknownPlaylist(_)
            | Self::MissingSession(_)
            | Self::MissingTrigger(_) => StatusCode::NOT_FOUND,
            Self::Admission(AdmissionError::UnknownKey(_)) => StatusCode::NOT_FOUND,
            Self::Admission(AdmissionError::InactiveKey(_)) => StatusCode::BAD_REQUEST,
            Self::Admission(AdmissionError::KeyBusy { .. }) => StatusCode::CONFLICT,
            Self::Admission(AdmissionError::CapacityExhausted { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Type Alias
// ─────────────────────────────────────────────────────────────────────────────

/// Convenient Result alias for application-wide operations.
pub type LiveResult<T> = Result<T, LiveError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for LiveError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Illegal transitions are programmer errors; make sure they land in
        // the server log, not only in the response body.
        if matches!(self, Self::Store(StoreError::IllegalTransition { .. })) {
            log::error!("[Error] {}", self);
        }
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<AdmissionError> for LiveError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Store(e) => Self::Store(e),
            other => Self::Admission(other),
        }
    }
}

impl From<EncoderError> for LiveError {
    fn from(err: EncoderError) -> Self {
        Self::Encoder(err)
    }
}

impl From<StoreError> for LiveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissingSession(id) => Self::MissingSession(id),
            StoreError::MissingTrigger(id) => Self::MissingTrigger(id),
            other => Self::Store(other),
        }
    }
}

impl From<rusqlite::Error> for LiveError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_busy_maps_to_conflict() {
        let err = LiveError::from(AdmissionError::KeyBusy {
            key_id: 1,
            session_id: 7,
        });
        assert_eq!(err.code(), "key_busy");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn capacity_exhausted_maps_to_429() {
        let err = LiveError::from(AdmissionError::CapacityExhausted { cap: 2 });
        assert_eq!(err.code(), "capacity_exhausted");
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn unknown_key_maps_to_not_found() {
        let err = LiveError::from(AdmissionError::UnknownKey(9));
        assert_eq!(err.code(), "unknown_key");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn illegal_transition_is_internal() {
        let err = LiveError::from(StoreError::IllegalTransition {
            session_id: 3,
            attempted: "mark_running",
        });
        assert_eq!(err.code(), "illegal_transition");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn missing_session_routes_to_404_variant() {
        let err = LiveError::from(StoreError::MissingSession(12));
        assert_eq!(err.code(), "missing_session");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn past_scheduled_time_is_bad_request() {
        let err = LiveError::from(ScheduleError::PastScheduledTime(
            "2020-01-01T00:00:00Z".into(),
        ));
        assert_eq!(err.code(), "past_scheduled_time");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
