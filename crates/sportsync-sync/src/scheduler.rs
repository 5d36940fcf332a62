//! Fixed-tick dispatch of due jobs, one tokio task per run.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use sportsync_core::{CollectionJob, CollectionResult, RunStatus};
use sportsync_storage::ResultStore;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::registry::JobRegistry;
use crate::runner::{panic_message, CollectionRunner};

type RunHandle = JoinHandle<Option<CollectionResult>>;

pub struct Scheduler {
    registry: Arc<JobRegistry>,
    runner: Arc<CollectionRunner>,
    store: ResultStore,
    tick_interval: Duration,
    permits: Arc<Semaphore>,
    in_flight: Mutex<Vec<RunHandle>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick_interval", &self.tick_interval)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        runner: Arc<CollectionRunner>,
        tick_interval: Duration,
        max_concurrent_runs: usize,
    ) -> Self {
        let store = runner.store().clone();
        Self {
            registry,
            runner,
            store,
            tick_interval,
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, Vec<RunHandle>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim every due job and start a run task for each. Returns how many
    /// runs were started; jobs already running are skipped by the claim.
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        let due = self.registry.claim_due(now);
        if due.is_empty() {
            debug!("tick: nothing due");
            return 0;
        }
        info!(count = due.len(), "dispatching due jobs");
        let handles: Vec<RunHandle> = due.into_iter().map(|job| self.spawn_run(job)).collect();
        let started = handles.len();

        let mut in_flight = self.in_flight();
        in_flight.retain(|h| !h.is_finished());
        in_flight.extend(handles);
        started
    }

    fn spawn_run(&self, job: CollectionJob) -> RunHandle {
        let registry = Arc::clone(&self.registry);
        let runner = Arc::clone(&self.runner);
        let store = self.store.clone();
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            let start_time = Utc::now();
            let result = match AssertUnwindSafe(runner.run(&job)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(job_id = %job.job_id, panic = message, "run task panicked");
                    let result = CollectionResult {
                        run_id: Uuid::new_v4(),
                        job_id: job.job_id.clone(),
                        start_time,
                        end_time: Utc::now(),
                        status: RunStatus::Error,
                        records_collected: 0,
                        errors: vec![format!("run panicked: {message}")],
                        summary: BTreeMap::new(),
                    };
                    if let Err(err) = store.append_result(&result).await {
                        warn!(job_id = %job.job_id, error = %err, "failed to persist collection result");
                    }
                    result
                }
            };

            match registry.complete(&job.job_id, &result) {
                Ok(updated) => {
                    if let Err(err) = store.save_job(&updated).await {
                        warn!(job_id = %job.job_id, error = %err, "failed to persist job state");
                    }
                }
                Err(err) => warn!(job_id = %job.job_id, error = %err, "completing job failed"),
            }
            Some(result)
        })
    }

    /// Wait for every run started so far and return their results.
    pub async fn drain(&self) -> Vec<CollectionResult> {
        let handles: Vec<RunHandle> = std::mem::take(&mut *self.in_flight());
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(err) => error!(error = %err, "run task failed to join"),
            }
        }
        results
    }

    /// Tick immediately, then on every interval until `shutdown` resolves.
    /// In-flight runs are awaited before returning.
    pub async fn run_until_shutdown<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut sched = JobScheduler::new().await.context("creating scheduler")?;
        let this = Arc::clone(&self);
        let tick_job = Job::new_repeated_async(self.tick_interval, move |_uuid, _l| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                this.tick(Utc::now());
            })
        })
        .context("creating tick job")?;
        sched.add(tick_job).await.context("adding tick job")?;

        self.tick(Utc::now());
        sched.start().await.context("starting scheduler")?;
        info!(tick = ?self.tick_interval, "scheduler started");

        shutdown.await;
        info!("shutdown requested; waiting for in-flight runs");
        sched.shutdown().await.context("stopping scheduler")?;
        let finished = self.drain().await;
        info!(finished = finished.len(), "scheduler stopped");
        Ok(())
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "listening for ctrl-c failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "listening for SIGTERM failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
