//! Per-job workspaces.
//!
//! Each job gets its own copy of the template under `<jobs_dir>/<job_id>`.
//! The template itself is only ever read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::models::job::JobId;
use crate::services::error_service;
use crate::services::job_service::JobLog;
use crate::services::process::{ProcessError, ProcessRunner, ToolCommand};

/// Template entries never copied into a workspace.
const SKIP_ENTRIES: &[&str] = &[".git"];

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Template directory not found: {}", .0.display())]
    TemplateMissing(PathBuf),

    #[error("Failed to copy template into {}: {source}", path.display())]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Dependency installation failed: {0}")]
    Install(String),

    #[error("Dependency installation was cancelled")]
    Cancelled,

    #[error("Failed to remove workspace {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct WorkspaceManager {
    template_dir: PathBuf,
    jobs_dir: PathBuf,
    install: Vec<String>,
    runner: ProcessRunner,
    retain: bool,
}

impl WorkspaceManager {
    pub fn new(
        template_dir: impl Into<PathBuf>,
        jobs_dir: impl Into<PathBuf>,
        install: Vec<String>,
        runner: ProcessRunner,
        retain: bool,
    ) -> Self {
        Self {
            template_dir: template_dir.into(),
            jobs_dir: jobs_dir.into(),
            install,
            runner,
            retain,
        }
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    /// Directory owned by `job_id`. Keyed by job id, so two jobs never share one.
    pub fn workspace_path(&self, job_id: JobId) -> PathBuf {
        self.jobs_dir.join(job_id.to_string())
    }

    /// Precondition check run before anything touches the filesystem.
    pub fn check_template(&self) -> Result<(), WorkspaceError> {
        if self.template_dir.is_dir() {
            Ok(())
        } else {
            Err(WorkspaceError::TemplateMissing(self.template_dir.clone()))
        }
    }

    /// Materialize the workspace and install its build-time dependencies.
    pub async fn prepare(
        &self,
        job_id: JobId,
        log: &JobLog,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, WorkspaceError> {
        self.check_template()?;
        let workspace = self.workspace_path(job_id);

        log.info(format!(
            "Copying template {} into workspace",
            self.template_dir.display()
        ))
        .await;
        let files = self.copy_template(&workspace).await?;
        tracing::debug!(job_id = %job_id, files, workspace = %workspace.display(), "Template copied");

        self.install_dependencies(&workspace, log, cancel).await?;
        Ok(workspace)
    }

    async fn copy_template(&self, workspace: &Path) -> Result<u64, WorkspaceError> {
        let template = self.template_dir.clone();
        let target = workspace.to_path_buf();

        let result = tokio::task::spawn_blocking(move || {
            if target.exists() {
                // Left behind by a crashed run of this same job id.
                fs::remove_dir_all(&target)?;
            }
            copy_dir_recursive(&template, &target)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));

        match result {
            Ok(Ok(files)) => Ok(files),
            Ok(Err(source)) | Err(source) => Err(WorkspaceError::Copy {
                path: workspace.to_path_buf(),
                source,
            }),
        }
    }

    async fn install_dependencies(
        &self,
        workspace: &Path,
        log: &JobLog,
        cancel: &CancellationToken,
    ) -> Result<(), WorkspaceError> {
        let Some(cmd) = ToolCommand::from_argv(&self.install) else {
            log.info("No dependency install command configured, skipping")
                .await;
            return Ok(());
        };
        let cmd = cmd.current_dir(workspace).env("CI", "true");

        log.info(format!("Installing dependencies: {}", cmd.describe()))
            .await;
        match self.runner.run(&cmd, cancel).await {
            Ok(_) => Ok(()),
            Err(ProcessError::Cancelled { .. }) => Err(WorkspaceError::Cancelled),
            Err(e @ ProcessError::Failed { .. }) => {
                let detail = match &e {
                    ProcessError::Failed { stdout, stderr, .. } => {
                        error_service::extract_error_line(stderr)
                            .or_else(|| error_service::extract_error_line(stdout))
                    }
                    _ => None,
                };
                Err(WorkspaceError::Install(match detail {
                    Some(line) => format!("{e}: {line}"),
                    None => e.to_string(),
                }))
            }
            Err(e) => Err(WorkspaceError::Install(e.to_string())),
        }
    }

    /// Remove a workspace once its job is terminal.
    ///
    /// Returns `false` when the workspace was kept for diagnostics.
    pub async fn cleanup(&self, workspace: &Path) -> Result<bool, WorkspaceError> {
        if self.retain {
            tracing::info!(workspace = %workspace.display(), "Retaining workspace for diagnostics");
            return Ok(false);
        }
        match tokio::fs::remove_dir_all(workspace).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(source) => Err(WorkspaceError::Cleanup {
                path: workspace.to_path_buf(),
                source,
            }),
        }
    }
}

/// Recursively copy `src` into `dest`, returning the number of files copied.
///
/// Copied files are made owner-writable so a read-only template can still
/// be customized in the workspace.
pub fn copy_dir_recursive(src: &Path, dest: &Path) -> io::Result<u64> {
    fs::create_dir_all(dest)?;
    let mut copied = 0;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_str().is_some_and(|n| SKIP_ENTRIES.contains(&n)) {
            continue;
        }

        let file_type = entry.file_type()?;
        let target = dest.join(&name);

        if file_type.is_dir() {
            copied += copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
            copied += 1;
        } else {
            fs::copy(entry.path(), &target)?;
            make_writable(&target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dest)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(src, dest).map(|_| ())
}

#[cfg(unix)]
fn make_writable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    if perms.mode() & 0o200 == 0 {
        perms.set_mode(perms.mode() | 0o200);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_writable(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    if perms.readonly() {
        perms.set_readonly(false);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}
