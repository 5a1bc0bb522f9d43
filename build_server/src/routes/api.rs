//! REST API wire types for build jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::artifact::ArtifactRef;
use crate::models::job::{
    BuildJob, BuildType, JobId, JobStatus, LogEntry, NewBuildJob, Platform, PlatformSelection,
};
use crate::models::snapshot::ConfigSnapshot;

/// Body of `POST /api/builds`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub app_id: String,
    pub user_id: String,
    pub platform: PlatformSelection,
    pub build_type: BuildType,
    pub config_snapshot: ConfigSnapshot,
}

impl From<SubmitRequest> for NewBuildJob {
    fn from(req: SubmitRequest) -> Self {
        NewBuildJob {
            app_id: req.app_id,
            user_id: req.user_id,
            platform: req.platform,
            build_type: req.build_type,
            config_snapshot: req.config_snapshot,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactJson {
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub download_url: String,
}

impl From<&ArtifactRef> for ArtifactJson {
    fn from(artifact: &ArtifactRef) -> Self {
        Self {
            file_name: artifact.file_name.clone(),
            size_bytes: artifact.size_bytes,
            sha256: artifact.sha256.clone(),
            download_url: artifact.download_path(),
        }
    }
}

/// Status query response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildJson {
    pub id: JobId,
    pub app_id: String,
    pub user_id: String,
    pub platform: PlatformSelection,
    pub build_type: BuildType,
    pub status: JobStatus,
    pub logs: Vec<LogEntry>,
    pub artifacts: BTreeMap<Platform, ArtifactJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<BuildJob> for BuildJson {
    fn from(job: BuildJob) -> Self {
        Self {
            id: job.id,
            app_id: job.app_id,
            user_id: job.user_id,
            platform: job.platform,
            build_type: job.build_type,
            status: job.status,
            logs: job.logs,
            artifacts: job
                .artifacts
                .iter()
                .map(|(platform, artifact)| (*platform, ArtifactJson::from(artifact)))
                .collect(),
            error: job.error,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Content type served for a stored package.
pub fn content_type(file_name: &str) -> &'static str {
    if file_name.ends_with(".apk") {
        "application/vnd.android.package-archive"
    } else {
        "application/octet-stream"
    }
}
