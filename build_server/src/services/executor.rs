//! Job executor: runs one job end-to-end on the worker that owns it.
//!
//! Preconditions are checked while the job is still `queued`, so a missing
//! template or an unusable config fails the job before any process starts.
//! After that the job is `building` until the workspace is gone and exactly
//! one terminal transition has been applied.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::events::job::{CancelReason, JobEvent};
use crate::models::artifact::ArtifactRef;
use crate::models::job::{BuildJob, JobId, JobStatus, Platform};
use crate::services::artifact_service::ArtifactManager;
use crate::services::customizer::{self, CustomizeError};
use crate::services::drivers::{DriverContext, PlatformDriver};
use crate::services::error_service::{self, PlatformFailure};
use crate::services::job_service::{self, JobLog};
use crate::services::workspace::{WorkspaceError, WorkspaceManager};
use crate::store::{RecordStore, StoreError};

/// Job-level fatal errors. Per-platform failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid build configuration: {}", .0.join("; "))]
    Precondition(Vec<String>),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("Template customization failed: {0}")]
    Customize(#[from] CustomizeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cancellation signal for one running job, remembering why it fired.
#[derive(Debug, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. The first reason wins; later calls return `false`.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Per-platform results of the build phase.
#[derive(Debug, Default)]
struct BuildReport {
    stored: Vec<ArtifactRef>,
    failures: Vec<PlatformFailure>,
}

pub struct JobExecutor {
    store: Arc<dyn RecordStore>,
    workspaces: WorkspaceManager,
    artifacts: ArtifactManager,
    drivers: Vec<Arc<dyn PlatformDriver>>,
    job_timeout: Duration,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        workspaces: WorkspaceManager,
        artifacts: ArtifactManager,
        drivers: Vec<Arc<dyn PlatformDriver>>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            store,
            workspaces,
            artifacts,
            drivers,
            job_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn artifacts(&self) -> &ArtifactManager {
        &self.artifacts
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    fn driver(&self, platform: Platform) -> Option<&Arc<dyn PlatformDriver>> {
        self.drivers.iter().find(|d| d.platform() == platform)
    }

    /// Run `job_id` to a terminal state and return that state.
    pub async fn execute(&self, job_id: JobId, worker: usize, handle: &CancelHandle) -> JobStatus {
        let started = Instant::now();

        let job = match self.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::error!(job_id = %job_id, "Job vanished from the record store");
                return JobStatus::Failed;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, "Failed to load job: {e}");
                return JobStatus::Failed;
            }
        };

        if let Some(reason) = handle.reason() {
            let event = self.cancel_event(reason, false);
            return self.finish(job_id, event, started).await;
        }

        if let Err(e) = self.check_preconditions(&job) {
            tracing::warn!(job_id = %job_id, "Precondition failed: {e}");
            let event = JobEvent::JobFailed {
                error: e.to_string(),
            };
            return self.finish(job_id, event, started).await;
        }

        if let Err(e) =
            job_service::transition(&*self.store, job_id, &JobEvent::JobStarted { worker }).await
        {
            tracing::error!(job_id = %job_id, "Failed to start job: {e}");
            return JobStatus::Failed;
        }

        let log = JobLog::new(self.store.clone(), job_id);
        let result = self.build(&job, &log, handle.token()).await;

        let workspace = self.workspaces.workspace_path(job_id);
        match self.workspaces.cleanup(&workspace).await {
            Ok(true) => log.info("Workspace removed").await,
            Ok(false) => {
                log.info(format!("Workspace retained at {}", workspace.display()))
                    .await
            }
            Err(e) => log.warn(e.to_string()).await,
        }

        let event = match (handle.reason(), result) {
            (Some(reason), _) => {
                self.discard(job_id).await;
                self.cancel_event(reason, true)
            }
            (None, Err(e)) => {
                self.discard(job_id).await;
                JobEvent::JobFailed {
                    error: e.to_string(),
                }
            }
            (None, Ok(report)) => self.settle(job_id, report).await,
        };

        self.finish(job_id, event, started).await
    }

    fn check_preconditions(&self, job: &BuildJob) -> Result<(), JobError> {
        self.workspaces.check_template()?;
        job.config_snapshot
            .validate(job.platform)
            .map_err(JobError::Precondition)
    }

    async fn build(
        &self,
        job: &BuildJob,
        log: &JobLog,
        cancel: &CancellationToken,
    ) -> Result<BuildReport, JobError> {
        let workspace = self.workspaces.prepare(job.id, log, cancel).await?;

        log.info("Customizing template").await;
        let customized = customizer::customize(&workspace, &job.config_snapshot).await?;
        for warning in &customized.warnings {
            log.warn(warning.clone()).await;
        }
        log.info(format!(
            "Customized {} file(s), skipped {} absent file(s)",
            customized.rewritten.len(),
            customized.skipped.len()
        ))
        .await;

        let platforms = job.platform.platforms();
        let mut report = BuildReport::default();

        for platform in &platforms {
            if cancel.is_cancelled() {
                break;
            }
            let platform = *platform;

            let Some(driver) = self.driver(platform) else {
                let failure = PlatformFailure {
                    platform,
                    category: "unavailable",
                    message: format!("No driver registered for {platform}"),
                };
                log.error(failure.describe()).await;
                report.failures.push(failure);
                continue;
            };

            if let Err(e) = driver.check_available(cancel).await {
                if e.is_cancelled() {
                    break;
                }
                if platforms.len() > 1 {
                    log.info(format!("{e}; skipping {platform}")).await;
                } else {
                    log.error(e.to_string()).await;
                }
                crate::metrics::platform_failure(platform.as_str(), e.category());
                report.failures.push(e.into_failure(platform));
                continue;
            }

            let platform_started = Instant::now();
            log.info(format!("Building {platform} ({})", job.build_type))
                .await;
            let ctx = DriverContext {
                workspace: &workspace,
                build_type: job.build_type,
                cancel,
                log,
            };
            let built = driver.build(&ctx).await;
            crate::metrics::platform_build_duration(
                platform.as_str(),
                platform_started.elapsed().as_millis() as u64,
            );

            match built {
                Ok(path) => self.collect(job.id, platform, &path, log, &mut report).await,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    crate::metrics::platform_failure(platform.as_str(), e.category());
                    let failure = e.into_failure(platform);
                    log.error(failure.describe()).await;
                    report.failures.push(failure);
                }
            }
        }

        Ok(report)
    }

    async fn collect(
        &self,
        job_id: JobId,
        platform: Platform,
        path: &Path,
        log: &JobLog,
        report: &mut BuildReport,
    ) {
        match self.artifacts.store(job_id, platform, path).await {
            Ok(reference) => {
                log.info(format!(
                    "{platform} build succeeded: {} ({} bytes)",
                    reference.file_name, reference.size_bytes
                ))
                .await;
                report.stored.push(reference);
            }
            Err(e) => {
                crate::metrics::platform_failure(platform.as_str(), "runtime");
                let failure = PlatformFailure {
                    platform,
                    category: "runtime",
                    message: e.to_string(),
                };
                log.error(failure.describe()).await;
                report.failures.push(failure);
            }
        }
    }

    /// Record artifacts and pick the terminal event for a finished build.
    async fn settle(&self, job_id: JobId, report: BuildReport) -> JobEvent {
        if report.stored.is_empty() {
            let error = error_service::most_specific(&report.failures)
                .map(PlatformFailure::describe)
                .unwrap_or_else(|| "No platform produced an artifact".to_string());
            return JobEvent::JobFailed { error };
        }

        let mut succeeded = Vec::new();
        for reference in report.stored {
            let platform = reference.platform;
            if let Err(e) = self.store.set_artifact(job_id, platform, reference).await {
                self.discard(job_id).await;
                return JobEvent::JobFailed {
                    error: format!("Failed to record {platform} artifact: {e}"),
                };
            }
            succeeded.push(platform);
        }

        JobEvent::JobCompleted {
            succeeded,
            failed: report.failures.iter().map(|f| f.platform).collect(),
        }
    }

    fn cancel_event(&self, reason: CancelReason, was_running: bool) -> JobEvent {
        match reason {
            CancelReason::Timeout => JobEvent::JobFailed {
                error: format!("Build timed out after {}s", self.job_timeout.as_secs()),
            },
            reason => JobEvent::JobCancelled {
                reason,
                was_running,
            },
        }
    }

    async fn discard(&self, job_id: JobId) {
        if let Err(e) = self.artifacts.discard(job_id).await {
            tracing::warn!(job_id = %job_id, "Failed to discard artifacts: {e}");
        }
    }

    async fn finish(&self, job_id: JobId, event: JobEvent, started: Instant) -> JobStatus {
        let duration_ms = started.elapsed().as_millis() as u64;
        let status = match job_service::transition(&*self.store, job_id, &event).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(job_id = %job_id, "Failed to finalize job: {e}");
                event.status()
            }
        };

        crate::metrics::job_duration(duration_ms);
        tracing::info!(job_id = %job_id, status = %status, duration_ms, "Job finished");
        status
    }
}
