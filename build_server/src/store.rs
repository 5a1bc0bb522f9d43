//! Record store contract and the bundled in-memory implementation.
//!
//! The engine reads and writes job state only through [`RecordStore`].
//! Persistence schemas live behind this trait and are not the engine's
//! concern.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::artifact::ArtifactRef;
use crate::models::job::{BuildJob, JobId, JobStatus, LogEntry, NewBuildJob, Platform};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("record store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a job record in `queued` state with a fresh id.
    async fn create_job(&self, new_job: NewBuildJob) -> Result<BuildJob, StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<BuildJob>, StoreError>;

    /// Move a job to `status`. Implementations must reject non-monotonic
    /// transitions and stamp `completedAt` exactly once.
    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn append_log(&self, id: JobId, entry: LogEntry) -> Result<(), StoreError>;

    async fn set_artifact(
        &self,
        id: JobId,
        platform: Platform,
        reference: ArtifactRef,
    ) -> Result<(), StoreError>;

    /// Most recent jobs first.
    async fn list_jobs(&self, limit: usize) -> Result<Vec<BuildJob>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<JobId, BuildJob>,
    order: Vec<JobId>,
}

/// Process-local record store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_job(&self, new_job: NewBuildJob) -> Result<BuildJob, StoreError> {
        let mut inner = self.inner.write().await;

        let mut id = Uuid::new_v4();
        while inner.jobs.contains_key(&id) {
            id = Uuid::new_v4();
        }

        let job = BuildJob {
            id,
            app_id: new_job.app_id,
            user_id: new_job.user_id,
            platform: new_job.platform,
            build_type: new_job.build_type,
            config_snapshot: new_job.config_snapshot,
            status: JobStatus::Queued,
            logs: Vec::new(),
            artifacts: Default::default(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        inner.jobs.insert(id, job.clone());
        inner.order.push(id);
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<BuildJob>, StoreError> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status,
                to: status,
            });
        }

        let now = Utc::now();
        job.status = status;
        if status == JobStatus::Building {
            job.started_at = Some(now);
        }
        if status.is_terminal() {
            job.completed_at = Some(now);
            job.error = if status == JobStatus::Failed { error } else { None };
        }
        Ok(())
    }

    async fn append_log(&self, id: JobId, entry: LogEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.logs.push(entry);
        Ok(())
    }

    async fn set_artifact(
        &self,
        id: JobId,
        platform: Platform,
        reference: ArtifactRef,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.artifacts.insert(platform, reference);
        Ok(())
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<BuildJob>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect())
    }
}
