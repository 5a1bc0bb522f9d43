//! build.artifact: Stored installable package produced for one platform.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::{JobId, Platform};

/// Reference recorded into `BuildJob.artifacts[platform]`.
///
/// `path` points into the durable artifacts root, never into a job workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub job_id: JobId,
    pub platform: Platform,
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub stored_at: DateTime<Utc>,
}

impl ArtifactRef {
    /// API path the artifact can be downloaded from.
    pub fn download_path(&self) -> String {
        format!("/api/builds/{}/artifacts/{}", self.job_id, self.platform)
    }
}
