//! Job creation, status transitions, and the per-job logger.

use std::sync::Arc;

use crate::events::job::JobEvent;
use crate::models::job::{BuildJob, JobId, JobStatus, LogEntry, LogLevel, NewBuildJob};
use crate::store::{RecordStore, StoreError};

/// Create a job record and log its admission.
pub async fn create_job(
    store: &dyn RecordStore,
    new_job: NewBuildJob,
    position: usize,
) -> Result<BuildJob, StoreError> {
    let job = store.create_job(new_job).await?;
    store
        .append_log(job.id, JobEvent::JobQueued { position }.log_entry())
        .await?;

    crate::metrics::job_status_changed(JobStatus::Queued.as_str());
    tracing::info!(
        job_id = %job.id,
        app_id = %job.app_id,
        platform = ?job.platform,
        build_type = %job.build_type,
        position,
        "Job queued"
    );

    Ok(job)
}

/// Apply a lifecycle event: validate it against the current status, append
/// its single log entry, then move the record.
pub async fn transition(
    store: &dyn RecordStore,
    id: JobId,
    event: &JobEvent,
) -> Result<JobStatus, StoreError> {
    let current = store
        .get_job(id)
        .await?
        .ok_or(StoreError::NotFound(id))?
        .status;
    let next = event.status();

    if !current.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            id,
            from: current,
            to: next,
        });
    }

    store.append_log(id, event.log_entry()).await?;
    store.update_status(id, next, event.error()).await?;

    crate::metrics::job_status_changed(next.as_str());
    tracing::info!(job_id = %id, from = %current, to = %next, "Job status changed");

    Ok(next)
}

/// Append-only logger bound to one job.
///
/// Entries go to the record store and are mirrored to `tracing`. A store
/// failure while logging is reported but never aborts the build.
#[derive(Clone)]
pub struct JobLog {
    store: Arc<dyn RecordStore>,
    job_id: JobId,
}

impl JobLog {
    pub fn new(store: Arc<dyn RecordStore>, job_id: JobId) -> Self {
        Self { store, job_id }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.append(LogEntry::info(message)).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.append(LogEntry::warn(message)).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.append(LogEntry::error(message)).await;
    }

    pub async fn append(&self, entry: LogEntry) {
        match entry.level {
            LogLevel::Info => tracing::info!(job_id = %self.job_id, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(job_id = %self.job_id, "{}", entry.message),
            LogLevel::Error => tracing::error!(job_id = %self.job_id, "{}", entry.message),
        }
        if let Err(e) = self.store.append_log(self.job_id, entry).await {
            tracing::error!(job_id = %self.job_id, "Failed to append job log: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::job::CancelReason;
    use crate::models::job::{BuildType, PlatformSelection};
    use crate::models::snapshot::ConfigSnapshot;
    use crate::store::MemoryStore;

    fn new_job() -> NewBuildJob {
        NewBuildJob {
            app_id: "app".into(),
            user_id: "user".into(),
            platform: PlatformSelection::Android,
            build_type: BuildType::Release,
            config_snapshot: ConfigSnapshot::default(),
        }
    }

    #[tokio::test]
    async fn each_transition_appends_exactly_one_entry() {
        let store = MemoryStore::new();
        let job = create_job(&store, new_job(), 1).await.unwrap();
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().logs.len(), 1);

        transition(&store, job.id, &JobEvent::JobStarted { worker: 0 })
            .await
            .unwrap();
        transition(
            &store,
            job.id,
            &JobEvent::JobFailed {
                error: "no artifact".into(),
            },
        )
        .await
        .unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.logs.len(), 3);
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("no artifact"));
        assert_eq!(stored.logs[2].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn rejected_transition_leaves_log_untouched() {
        let store = MemoryStore::new();
        let job = create_job(&store, new_job(), 1).await.unwrap();
        transition(
            &store,
            job.id,
            &JobEvent::JobCancelled {
                reason: CancelReason::User,
                was_running: false,
            },
        )
        .await
        .unwrap();

        let err = transition(&store, job.id, &JobEvent::JobStarted { worker: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().logs.len(), 2);
    }

    #[tokio::test]
    async fn job_log_appends_in_order() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let job = store.create_job(new_job()).await.unwrap();
        let log = JobLog::new(store.clone(), job.id);
        log.info("Copying template").await;
        log.warn("Icon not found").await;
        log.error("Gradle failed").await;

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        let levels: Vec<_> = stored.logs.iter().map(|l| l.level).collect();
        assert_eq!(levels, vec![LogLevel::Info, LogLevel::Warn, LogLevel::Error]);
    }
}
