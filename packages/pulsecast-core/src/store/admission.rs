//! Admission control for session starts.
//!
//! Admission is advisory on its own: the checks only hold if the caller
//! inserts the new `starting` row inside the same transaction, which is why
//! [`check`] operates on a [`rusqlite::Transaction`] rather than on the
//! store handle. Every start path (manual, scheduler fire, recovery) routes
//! through [`crate::store::SessionStore::admit_and_create`], which is the
//! only caller.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use thiserror::Error;

use crate::store::entities::StreamKey;
use crate::store::StoreError;

/// Reasons a start request is refused before any process is spawned.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The stream key does not exist.
    #[error("Stream key {0} not found")]
    UnknownKey(i64),

    /// The stream key has been retired.
    #[error("Stream key '{0}' is not active")]
    InactiveKey(String),

    /// Another active session already holds this stream key.
    #[error(
        "Stream key {key_id} is already in use by session {session_id}. \
         Each stream key can only be used by one live stream at a time"
    )]
    KeyBusy { key_id: i64, session_id: i64 },

    /// The global concurrency cap is reached.
    #[error("Maximum concurrent streams limit reached ({cap})")]
    CapacityExhausted { cap: usize },

    /// Underlying database failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for AdmissionError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// Runs the admission checks inside the caller's transaction.
///
/// On success returns the full stream key row (including the raw secret,
/// which the caller needs to build the encoder command line).
pub fn check(
    tx: &Transaction<'_>,
    stream_key_id: i64,
    cap: usize,
) -> Result<StreamKey, AdmissionError> {
    // 1. The key must exist and be active.
    let key: Option<(i64, String, String, bool, DateTime<Utc>)> = tx
        .query_row(
            "SELECT id, name, secret, active, created_at FROM stream_keys WHERE id = ?1",
            params![stream_key_id],
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

    let Some((id, name, secret, active, created_at)) = key else {
        return Err(AdmissionError::UnknownKey(stream_key_id));
    };
    if !active {
        return Err(AdmissionError::InactiveKey(name));
    }

    // 2. Per-key exclusivity: no other active session may hold this key.
    let busy: Option<i64> = tx
        .query_row(
            "SELECT id FROM sessions
             WHERE stream_key_id = ?1
               AND status IN ('starting', 'running', 'recovering')
             LIMIT 1",
            params![stream_key_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(session_id) = busy {
        return Err(AdmissionError::KeyBusy {
            key_id: stream_key_id,
            session_id,
        });
    }

    // 3. Global concurrency cap.
    let active_count: usize = tx.query_row(
        "SELECT COUNT(*) FROM sessions
         WHERE status IN ('starting', 'running', 'recovering')",
        [],
        |row| row.get(0),
    )?;

    if active_count >= cap {
        return Err(AdmissionError::CapacityExhausted { cap });
    }

    Ok(StreamKey {
        id,
        name,
        secret,
        active,
        created_at,
    })
}
