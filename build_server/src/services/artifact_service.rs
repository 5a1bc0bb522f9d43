//! Artifact storage and retrieval.
//!
//! Packages are copied out of the workspace into
//! `<artifacts_root>/<job_id>/<platform>/<file>` next to a small manifest,
//! so references survive workspace cleanup and engine restarts.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::models::artifact::ArtifactRef;
use crate::models::job::{JobId, Platform};

const MANIFEST_FILE: &str = "artifact.json";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact source {} does not exist", .0.display())]
    SourceMissing(PathBuf),

    #[error("Artifact source {} has no file name", .0.display())]
    InvalidFileName(PathBuf),

    #[error("Corrupt artifact manifest {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Artifact I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactManager {
    root: PathBuf,
}

impl ArtifactManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    fn platform_dir(&self, job_id: JobId, platform: Platform) -> PathBuf {
        self.job_dir(job_id).join(platform.as_str())
    }

    /// Copy a driver output into durable storage and describe it.
    pub async fn store(
        &self,
        job_id: JobId,
        platform: Platform,
        source: &Path,
    ) -> Result<ArtifactRef, ArtifactError> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(ArtifactError::SourceMissing(source.to_path_buf()));
        }
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArtifactError::InvalidFileName(source.to_path_buf()))?
            .to_string();

        let dir = self.platform_dir(job_id, platform);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(io_error(&dir))?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(io_error(&dir))?;

        let dest = dir.join(&file_name);
        let size_bytes = tokio::fs::copy(source, &dest)
            .await
            .map_err(io_error(&dest))?;

        let hash_path = dest.clone();
        let sha256 = tokio::task::spawn_blocking(move || sha256_file(&hash_path))
            .await
            .map_err(|e| ArtifactError::Io {
                path: dest.clone(),
                source: io::Error::new(io::ErrorKind::Other, e),
            })?
            .map_err(io_error(&dest))?;

        let reference = ArtifactRef {
            job_id,
            platform,
            path: dest,
            file_name,
            size_bytes,
            sha256,
            stored_at: Utc::now(),
        };

        let manifest = dir.join(MANIFEST_FILE);
        let body = serde_json::to_vec_pretty(&reference).map_err(|source| {
            ArtifactError::Manifest {
                path: manifest.clone(),
                source,
            }
        })?;
        tokio::fs::write(&manifest, body)
            .await
            .map_err(io_error(&manifest))?;

        tracing::info!(
            job_id = %job_id,
            platform = %platform,
            size_bytes = reference.size_bytes,
            sha256 = %reference.sha256,
            "Artifact stored"
        );
        Ok(reference)
    }

    /// Look up a stored artifact. `None` means nothing was stored for this
    /// platform; whether the job is still running is a status question.
    pub async fn resolve(
        &self,
        job_id: JobId,
        platform: Platform,
    ) -> Result<Option<ArtifactRef>, ArtifactError> {
        let manifest = self.platform_dir(job_id, platform).join(MANIFEST_FILE);
        let body = match tokio::fs::read(&manifest).await {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ArtifactError::Io { path: manifest, source }),
        };
        let reference: ArtifactRef =
            serde_json::from_slice(&body).map_err(|source| ArtifactError::Manifest {
                path: manifest.clone(),
                source,
            })?;

        if tokio::fs::try_exists(&reference.path).await.unwrap_or(false) {
            Ok(Some(reference))
        } else {
            Ok(None)
        }
    }

    /// Remove everything stored for a job that did not complete.
    pub async fn discard(&self, job_id: JobId) -> Result<(), ArtifactError> {
        let dir = self.job_dir(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(job_id = %job_id, "Discarded stored artifacts");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ArtifactError::Io { path: dir, source }),
        }
    }
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
