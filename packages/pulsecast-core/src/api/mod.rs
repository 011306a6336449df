//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to services.
//! It provides the router construction and server startup functionality.

use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::encoder::EncoderSupervisor;
use crate::services::{HealthMonitor, LiveScheduler, SessionManager};
use crate::store::SessionStore;

pub mod http;
pub mod ws;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// This is a thin wrapper that holds references to services.
/// All business logic lives in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// Source of truth for all persistent entities.
    pub store: Arc<SessionStore>,
    /// Encoder process registry and restart policy.
    pub supervisor: Arc<EncoderSupervisor>,
    /// Top-level session start/stop API.
    pub manager: Arc<SessionManager>,
    /// Deferred and recurring session triggers.
    pub scheduler: Arc<LiveScheduler>,
    /// Periodic liveness and duration-cap enforcement.
    pub monitor: Arc<HealthMonitor>,
    /// Application configuration.
    pub config: Arc<Config>,
}

/// Starts the HTTP server on the configured port.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let port = state.config.preferred_port;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!(
        "Server listening on http://0.0.0.0:{}",
        listener.local_addr().map(|a| a.port()).unwrap_or(port)
    );
    let app = http::create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
