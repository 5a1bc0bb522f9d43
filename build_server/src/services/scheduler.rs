//! Build scheduler: a FIFO queue drained by a fixed pool of workers.
//!
//! Admission order is arrival order. Each worker owns its job end-to-end, so
//! every write to a job record comes from exactly one task. Jobs waiting for
//! a free worker stay `queued` indefinitely; that is backpressure, not an
//! error.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::events::job::{CancelReason, JobEvent};
use crate::models::job::{BuildJob, JobId, NewBuildJob};
use crate::services::artifact_service::ArtifactManager;
use crate::services::drivers;
use crate::services::executor::{CancelHandle, JobExecutor};
use crate::services::job_service;
use crate::services::process::ProcessRunner;
use crate::services::workspace::WorkspaceManager;
use crate::store::{RecordStore, StoreError};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<JobId>,
    running: HashMap<JobId, Arc<CancelHandle>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("build scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Inner {
    executor: JobExecutor,
    state: Mutex<QueueState>,
    /// Serializes submissions with each other and with shutdown.
    admission: tokio::sync::Mutex<()>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_gauges(state: &QueueState) {
        crate::metrics::queue_depth(state.pending.len());
        crate::metrics::running_jobs(state.running.len());
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Spawn `max_concurrent` workers over `executor`.
    pub fn start(executor: JobExecutor, max_concurrent: usize) -> Self {
        let inner = Arc::new(Inner {
            executor,
            state: Mutex::new(QueueState::default()),
            admission: tokio::sync::Mutex::new(()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let workers = (0..max_concurrent.max(1))
            .map(|worker| tokio::spawn(run_worker(inner.clone(), worker)))
            .collect();

        tracing::info!(
            workers = max_concurrent.max(1),
            timeout_secs = inner.executor.job_timeout().as_secs(),
            "Build scheduler started"
        );

        Self {
            inner,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Wire the bundled components from `config` and start the workers.
    pub fn from_config(config: &EngineConfig, store: Arc<dyn RecordStore>) -> Self {
        let runner = ProcessRunner::new(config.kill_grace);
        let workspaces = WorkspaceManager::new(
            &config.template_dir,
            &config.jobs_dir,
            config.tools.install.clone(),
            runner.clone(),
            config.retain_workspaces,
        );
        let executor = JobExecutor::new(
            store,
            workspaces,
            ArtifactManager::new(&config.artifacts_dir),
            drivers::default_drivers(config, &runner),
            config.job_timeout,
        );
        Self::start(executor, config.max_concurrent_builds)
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.inner.executor
    }

    /// Create the job record and append it to the queue.
    ///
    /// Fails with [`SubmitError::ShuttingDown`] once [`Scheduler::shutdown`]
    /// has begun; no record is created then.
    pub async fn submit(&self, new_job: NewBuildJob) -> Result<BuildJob, SubmitError> {
        let _admission = self.inner.admission.lock().await;
        if self.inner.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }

        let position = self.queue_len() + 1;
        let job = job_service::create_job(&**self.inner.executor.store(), new_job, position).await?;

        {
            let mut state = self.inner.state();
            state.pending.push_back(job.id);
            Inner::publish_gauges(&state);
        }
        self.inner.notify.notify_one();

        Ok(job)
    }

    /// Cancel a queued or running job.
    ///
    /// A queued job leaves the queue and becomes `cancelled` before this
    /// returns. A running job is signalled; its worker finalizes it once the
    /// active tool process has exited. Returns `false` for unknown or
    /// already terminal jobs.
    pub async fn cancel(&self, id: JobId) -> bool {
        self.cancel_with(id, CancelReason::User).await
    }

    async fn cancel_with(&self, id: JobId, reason: CancelReason) -> bool {
        let removed = {
            let mut state = self.inner.state();
            if let Some(handle) = state.running.get(&id) {
                let signalled = handle.cancel(reason);
                if signalled {
                    tracing::info!(job_id = %id, ?reason, "Cancelling running job");
                }
                return signalled;
            }
            let before = state.pending.len();
            state.pending.retain(|pending| *pending != id);
            let removed = state.pending.len() != before;
            Inner::publish_gauges(&state);
            removed
        };

        if !removed {
            return false;
        }

        let event = JobEvent::JobCancelled {
            reason,
            was_running: false,
        };
        match job_service::transition(&**self.inner.executor.store(), id, &event).await {
            Ok(_) => {
                tracing::info!(job_id = %id, "Cancelled queued job");
                true
            }
            Err(e) => {
                tracing::error!(job_id = %id, "Failed to cancel queued job: {e}");
                false
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.inner.state().running.len()
    }

    /// Stop accepting work, cancel queued and running jobs, and wait for the
    /// workers to finalize them.
    pub async fn shutdown(&self) {
        tracing::info!("Build scheduler shutting down");
        {
            // Let an in-flight submission finish queueing so it is drained below.
            let _admission = self.inner.admission.lock().await;
            self.inner.shutdown.cancel();
        }

        let (pending, running): (Vec<JobId>, Vec<Arc<CancelHandle>>) = {
            let mut state = self.inner.state();
            let pending = state.pending.drain(..).collect();
            let running = state.running.values().cloned().collect();
            Inner::publish_gauges(&state);
            (pending, running)
        };

        for handle in running {
            handle.cancel(CancelReason::Shutdown);
        }
        for id in pending {
            let event = JobEvent::JobCancelled {
                reason: CancelReason::Shutdown,
                was_running: false,
            };
            if let Err(e) =
                job_service::transition(&**self.inner.executor.store(), id, &event).await
            {
                tracing::error!(job_id = %id, "Failed to cancel queued job on shutdown: {e}");
            }
        }

        self.inner.notify.notify_waiters();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Worker task failed: {e}");
            }
        }
        tracing::info!("Build scheduler stopped");
    }
}

/// Take the next job and register its cancel handle in one critical section,
/// so a concurrent `cancel` always finds the job either queued or running.
fn claim_next(inner: &Inner) -> Option<(JobId, Arc<CancelHandle>)> {
    let mut state = inner.state();
    let id = state.pending.pop_front()?;
    let handle = Arc::new(CancelHandle::new());
    state.running.insert(id, handle.clone());
    Inner::publish_gauges(&state);
    Some((id, handle))
}

async fn run_worker(inner: Arc<Inner>, worker: usize) {
    tracing::debug!(worker, "Worker started");

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        let claimed = {
            // Register interest before checking the queue so a submit between
            // the check and the wait is not missed. Dropping the future before
            // the job runs hands any consumed wakeup to an idle worker.
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claimed = claim_next(&inner);
            if claimed.is_none() {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = inner.shutdown.cancelled() => {}
                }
            }
            claimed
        };

        let Some((job_id, handle)) = claimed else {
            continue;
        };

        let watchdog = spawn_watchdog(&inner, job_id, handle.clone());
        let status = inner.executor.execute(job_id, worker, &handle).await;
        watchdog.abort();

        {
            let mut state = inner.state();
            state.running.remove(&job_id);
            Inner::publish_gauges(&state);
        }
        tracing::debug!(worker, job_id = %job_id, status = %status, "Worker finished job");
    }

    tracing::debug!(worker, "Worker stopped");
}

fn spawn_watchdog(inner: &Inner, job_id: JobId, handle: Arc<CancelHandle>) -> JoinHandle<()> {
    let timeout = inner.executor.job_timeout();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if handle.cancel(CancelReason::Timeout) {
            tracing::warn!(
                job_id = %job_id,
                timeout_secs = timeout.as_secs(),
                "Job exceeded its time limit, cancelling"
            );
        }
    })
}
