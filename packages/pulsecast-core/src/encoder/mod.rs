//! Encoder process management.
//!
//! - [`command`]: argv construction for both streaming modes
//! - [`manifest`]: concat manifest files consumed by the demuxer
//! - [`logs`]: tailing and scraping of per-session encoder logs
//! - [`supervisor`]: the process registry with restart/backoff and reaping

pub mod command;
pub mod logs;
pub mod manifest;
pub mod supervisor;

use thiserror::Error;

pub use command::EncoderPlan;
pub use logs::EncoderStats;
pub use supervisor::{EncoderStatus, EncoderSupervisor, StopMode, StopOutcome};

/// Failures of the encoder supervisor.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// A supervised process is already registered for this session.
    #[error("Session {0} already has an active encoder process")]
    AlreadyRunning(i64),

    /// The plan resolves to zero playable assets.
    #[error("No assets to stream")]
    NoAssets,

    /// The concat plan is empty.
    #[error("Cannot build a manifest from an empty plan")]
    EmptyPlan,

    /// The encoder binary could not be started.
    #[error("Failed to spawn encoder: {0}")]
    SpawnFailed(std::io::Error),

    /// The stop ladder ran out of escalations with the process still alive.
    #[error("Encoder for session {0} survived the stop sequence")]
    StopTimeout(i64),

    /// Manifest or log file I/O failed.
    #[error("Manifest I/O error: {0}")]
    ManifestIo(std::io::Error),
}
