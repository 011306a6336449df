//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. Services are created in
//! dependency order and passed by handle; there is no hidden module-level
//! state anywhere in the core.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::config::Config;
use crate::encoder::EncoderSupervisor;
use crate::error::LiveError;
use crate::services::{HealthMonitor, LiveScheduler, SessionManager};
use crate::store::{SessionStore, StoreError};

/// Failures while wiring or reconciling services.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration rejected by validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database could not be opened or reconciled.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Boot reconciliation failed.
    #[error(transparent)]
    Reconcile(#[from] LiveError),
}

/// Container for all bootstrapped services.
#[derive(Clone)]
pub struct BootstrappedServices {
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
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

/// Bootstraps all services with their dependencies.
///
/// Wiring order matters - services are created in dependency order:
///
/// 1. Store (SQLite)
/// 2. Encoder supervisor (depends on store)
/// 3. Session manager (depends on store, supervisor)
/// 4. Scheduler (depends on store, manager)
/// 5. Health monitor (depends on store, supervisor, manager)
pub fn bootstrap_services(config: Config) -> Result<BootstrappedServices, BootstrapError> {
    config.validate().map_err(BootstrapError::Config)?;
    let config = Arc::new(config);
    let cancel_token = CancellationToken::new();

    let store = Arc::new(SessionStore::open(&config.database_path)?);

    let supervisor = Arc::new(EncoderSupervisor::new(
        config.encoder.clone(),
        Arc::clone(&store),
        cancel_token.clone(),
    ));

    let manager = Arc::new(SessionManager::new(
        Arc::clone(&store),
        Arc::clone(&supervisor),
        config.limits,
        config.encoder.binary_name(),
    ));

    let scheduler = LiveScheduler::new(Arc::clone(&store), Arc::clone(&manager));

    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&store),
        Arc::clone(&supervisor),
        Arc::clone(&manager),
        config.encoder.binary_name(),
        cancel_token.clone(),
    ));

    Ok(BootstrappedServices {
        store,
        supervisor,
        manager,
        scheduler,
        monitor,
        config,
        cancel_token,
    })
}

impl BootstrappedServices {
    /// Boot reconciliation, run before accepting any traffic:
    ///
    /// 1. kill encoder processes no active Session row claims;
    /// 2. mark active sessions whose pid is gone as `interrupted`;
    /// 3. reconcile triggers left `running` by a prior process, re-arm
    ///    pending timers, and fire overdue ones.
    pub async fn reconcile_on_boot(&self) -> Result<(), BootstrapError> {
        log::info!("[Bootstrap] Reconciling state from previous run...");

        let report = self.manager.force_reap_orphans().await?;
        if report.killed_count > 0 {
            log::warn!(
                "[Bootstrap] Killed {} orphaned encoder process(es)",
                report.killed_count
            );
        }
        if !report.interrupted_sessions.is_empty() {
            log::warn!(
                "[Bootstrap] Marked {} ghost session(s) as interrupted",
                report.interrupted_sessions.len()
            );
        }

        self.scheduler.recover().await?;
        log::info!("[Bootstrap] Reconciliation complete");
        Ok(())
    }

    /// Starts the long-lived background tasks (supervisor watcher, health
    /// monitor).
    pub fn start_background_tasks(&self) {
        self.supervisor.spawn_watcher();
        self.monitor.spawn();
    }

    /// Builds the API layer's shared state.
    pub fn app_state(&self) -> AppState {
        AppState {
            store: Arc::clone(&self.store),
            supervisor: Arc::clone(&self.supervisor),
            manager: Arc::clone(&self.manager),
            scheduler: Arc::clone(&self.scheduler),
            monitor: Arc::clone(&self.monitor),
            config: Arc::clone(&self.config),
        }
    }

    /// Initiates graceful shutdown of all background tasks.
    ///
    /// Encoder subprocesses are deliberately left running: a control-plane
    /// restart must not take down live streams. The next boot either
    /// re-adopts their sessions or reaps them as orphans.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        self.scheduler.shutdown();
        log::info!("[Bootstrap] Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_rejects_invalid_config() {
        let mut config = Config::default();
        config.limits.max_concurrent_streams = 0;
        assert!(matches!(
            bootstrap_services(config),
            Err(BootstrapError::Config(_))
        ));
    }

    #[tokio::test]
    async fn bootstrap_wires_services_against_fresh_db() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database_path = dir.path().join("test.db");
        config.encoder.log_dir = dir.path().join("logs");
        config.encoder.manifest_dir = Some(dir.path().join("manifests"));

        let services = bootstrap_services(config).unwrap();
        assert_eq!(services.store.count_active().unwrap(), 0);
        assert!(services.scheduler.active_jobs().is_empty());

        services.shutdown().await;
    }
}
