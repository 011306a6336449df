//! Timer wheel for scheduled triggers.
//!
//! A thin pool of one-shot timers keyed by job id. Each registration spawns
//! a task that sleeps until the target instant and then runs its payload;
//! cancellation is a token flip, and [`TimerWheel::cancel`] guarantees the
//! job is deregistered before it returns. The scheduler cares only about
//! this contract, not the backing implementation.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Registered one-shot timers keyed by job id.
pub struct TimerWheel {
    /// job_id → (generation, cancel token). The generation guards against a
    /// finished task removing the entry of a newer registration that reused
    /// the same job id.
    jobs: Arc<DashMap<String, (u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Registers a one-shot timer. An existing timer under the same job id
    /// is cancelled and replaced.
    ///
    /// The payload runs at (or immediately after) `at`; a target in the past
    /// fires right away.
    pub fn register_once<F, Fut>(&self, job_id: &str, at: DateTime<Utc>, fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        if let Some((_, old)) = self
            .jobs
            .insert(job_id.to_string(), (generation, token.clone()))
        {
            old.cancel();
        }

        let jobs = Arc::clone(&self.jobs);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(job = %job_id, ?delay, "timer_armed");
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    fire().await;
                }
            }
            jobs.remove_if(&job_id, |_, (gen, _)| *gen == generation);
        });
    }

    /// Cancels a registered timer. Returns `false` for unknown job ids.
    ///
    /// Deregistration is synchronous: once this returns, the job id is gone
    /// from the pool and the payload will not start.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.jobs.remove(job_id) {
            Some((_, (_, token))) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of all currently registered timers.
    pub fn active_jobs(&self) -> Vec<String> {
        self.jobs.iter().map(|r| r.key().clone()).collect()
    }

    /// Cancels every registered timer (shutdown path).
    pub fn cancel_all(&self) -> usize {
        let ids = self.active_jobs();
        let mut cancelled = 0;
        for id in ids {
            if self.cancel(&id) {
                cancelled += 1;
            }
        }
        cancelled
    }
}
