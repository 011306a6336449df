//! Pulsecast Core - session supervision for 24/7 live streaming.
//!
//! This crate is the control plane for long-lived RTMP streaming sessions:
//! operators register stream keys, assets and playlists, then launch
//! encoder subprocesses that push those playlists to an ingest endpoint,
//! immediately or on a schedule. The core keeps many sessions alive
//! concurrently, restarts crashed encoders with backoff, enforces duration
//! budgets, reaps orphaned processes across its own restarts, and feeds
//! live telemetry to WebSocket subscribers.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`store`]: transactional SQLite store; all state transitions and the
//!   admission checks live here
//! - [`encoder`]: encoder subprocess supervision (spawn, stop ladder,
//!   restart backoff, manifests, log scraping)
//! - [`services`]: session manager, scheduler + timer wheel, health monitor
//! - [`api`]: HTTP/JSON control surface and WebSocket telemetry
//! - [`bootstrap`]: the composition root and boot reconciliation
//! - [`error`]: centralized error types
//!
//! Everything is constructed once in [`bootstrap::bootstrap_services`] and
//! passed by handle; the binary in `apps/server` is a thin shell around it.

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod encoder;
pub mod error;
pub mod os;
pub mod services;
pub mod store;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError};
pub use bootstrap::{bootstrap_services, BootstrapError, BootstrappedServices};
pub use config::{Config, EncoderSettings, StreamLimits};
pub use encoder::{EncoderPlan, EncoderStats, EncoderSupervisor};
pub use error::{ErrorCode, LiveError, LiveResult};
pub use services::{HealthMonitor, LiveScheduler, ScheduleRequest, SessionManager, TimerWheel};
pub use store::entities::{
    Asset, Playlist, ScheduledTrigger, Session, SessionStatus, StreamKey, StreamSource,
};
pub use store::SessionStore;
