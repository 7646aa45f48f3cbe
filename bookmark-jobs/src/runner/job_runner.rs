use super::config::RunnerConfig;
use crate::core::job::JobStatus;
use crate::core::store::{JobStore, QueueError};
use crate::registry::handler_registry::HandlerRegistry;
use anyhow::Context;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::instrument;

pub const JITTER_INTERVAL_MS: [u64; 10] = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34];

/// A bridge between job processors and the store.
///
/// ## Implementation
///
/// - A semaphore holds `max_workers` permits.
/// - A drain cycle claims up to `batch_size` jobs. Each claimed job waits for a permit, then runs
///   in its own task. The cycle ends when every job of the batch has been finalized.
/// - The drain loop repeats cycles until a claim comes back empty.
///
/// At most one drain loop per runner is active at a time; [`JobRunner::ensure_running`] is the
/// trigger producers call after enqueueing. Clones share that state. This does not coordinate
/// separate processes; the store's claim-once guarantee is what keeps them from running a job
/// twice.
///
/// ## Examples
/// See `bookmark-jobs-sqlite` for examples.
pub struct JobRunner<S>
where
    S: JobStore,
{
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicBool>,
    config: RunnerConfig,
}

impl<S: JobStore> Clone for JobRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            semaphore: self.semaphore.clone(),
            active: self.active.clone(),
            config: self.config.clone(),
        }
    }
}

/// Counters collected over one or more drain cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub cycles: u32,
    pub claimed: u64,
    pub completed: u64,
    /// Failed, but put back to `pending` for another attempt.
    pub retried: u64,
    pub failed: u64,
    /// Outcomes that could not be recorded. Those jobs stay `running`.
    pub finalize_errors: u64,
    /// The loop stopped because claiming failed, not because the queue was empty.
    pub aborted: bool,
}

impl DrainSummary {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Done => self.completed += 1,
            JobStatus::Pending => self.retried += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Running => self.finalize_errors += 1,
        }
    }

    fn merge(&mut self, other: DrainSummary) {
        self.cycles += other.cycles;
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.retried += other.retried;
        self.failed += other.failed;
        self.finalize_errors += other.finalize_errors;
        self.aborted |= other.aborted;
    }
}

/// Clears the "drain loop active" flag when dropped, panics included.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S> JobRunner<S>
where
    S: JobStore + 'static,
{
    /// Create a new JobRunner from store, registry and pool settings.
    pub fn new(store: S, registry: HandlerRegistry, config: RunnerConfig) -> Self {
        Self::with_shared(Arc::new(store), Arc::new(registry), config)
    }

    /// Same as `new`, for when the store and registry are shared with a `JobService`.
    pub fn with_shared(store: Arc<S>, registry: Arc<HandlerRegistry>, config: RunnerConfig) -> Self {
        let permits = config.max_workers.max(1);
        Self {
            store,
            registry,
            semaphore: Arc::new(Semaphore::new(permits)),
            active: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Whether a drain loop started by `ensure_running` is active.
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Start a drain loop in the background unless one is already active. Safe to call after
    /// every enqueue, from as many tasks as you like. Returns the handle of the loop it started,
    /// or `None` if another loop was already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn ensure_running(&self) -> Option<JoinHandle<DrainSummary>> {
        if !self.try_activate() {
            tracing::trace!("Drain loop already active");
            return None;
        }
        let runner = self.clone();
        Some(tokio::spawn(async move { runner.drain_while_active().await }))
    }

    fn try_activate(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn drain_while_active(self) -> DrainSummary {
        let mut total = DrainSummary::default();
        loop {
            {
                let _guard = ActiveGuard(self.active.clone());
                total.merge(self.drain().await);
            }
            if total.aborted {
                break;
            }
            // Jobs enqueued after the last empty claim but before the flag was cleared found the
            // loop still active and didn't start a new one.
            match self.store.pending_count().await {
                Ok(0) => break,
                Ok(_) if self.try_activate() => continue,
                Ok(_) => break,
                Err(e) => {
                    tracing::error!("Failed to count pending jobs: {}", e);
                    break;
                }
            }
        }
        total
    }

    /// Run drain cycles in the current task until the store has nothing left to claim.
    #[instrument(skip_all, fields(batch_size = self.config.batch_size, max_workers = self.config.max_workers))]
    pub async fn drain(&self) -> DrainSummary {
        let mut summary = DrainSummary::default();
        loop {
            match self.drain_cycle().await {
                Ok(Some(cycle)) => summary.merge(cycle),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to claim jobs, stopping drain loop: {}", e);
                    summary.aborted = true;
                    break;
                }
            }
        }
        tracing::debug!(?summary, "Drain loop finished");
        summary
    }

    /// One claim-execute-finalize round. `Ok(None)` when nothing was pending.
    pub async fn drain_cycle(&self) -> Result<Option<DrainSummary>, QueueError> {
        let handles = self.store.claim_batch(self.config.batch_size).await?;
        if handles.is_empty() {
            return Ok(None);
        }
        let mut summary = DrainSummary {
            cycles: 1,
            claimed: handles.len() as u64,
            ..Default::default()
        };
        tracing::debug!(claimed = summary.claimed, "Claimed batch");

        let mut tasks = JoinSet::new();
        for handle in handles {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Semaphore closed while draining")?;
            let registry = self.registry.clone();
            tasks.spawn(async move {
                let _permit = permit;
                registry.process(handle).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(status)) => summary.record(status),
                Ok(Err(e)) => {
                    tracing::error!("Failed to record job outcome, job left running: {}", e);
                    summary.finalize_errors += 1;
                }
                Err(e) => {
                    tracing::error!("Job task did not finish: {}", e);
                    summary.finalize_errors += 1;
                }
            }
        }
        Ok(Some(summary))
    }

    /// Keep draining forever: trigger a drain loop, then sleep for `interval` plus a little
    /// jitter. For deployments where jobs are enqueued without calling `ensure_running`.
    pub async fn run(&self, interval: chrono::Duration) -> Result<(), QueueError> {
        let duration = interval
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or(QueueError::InvalidInterval(interval))?;
        loop {
            if let Some(handle) = self.ensure_running() {
                match handle.await {
                    Ok(summary) if summary.aborted => suspend_after_error().await,
                    Ok(_) => {}
                    Err(e) => tracing::error!("Drain loop crashed: {}", e),
                }
            }
            tokio::time::sleep(duration + get_random_jitter()).await;
        }
    }
}

async fn suspend_after_error() {
    tracing::warn!("Suspending worker for 5 seconds");
    tokio::time::sleep(Duration::from_secs(5)).await;
}

fn get_random_jitter() -> Duration {
    JITTER_INTERVAL_MS
        .choose(&mut rand::thread_rng())
        .map(|ms| Duration::from_millis(*ms))
        .unwrap_or_else(|| Duration::from_millis(5)) // Always takes a happy path technically
}
