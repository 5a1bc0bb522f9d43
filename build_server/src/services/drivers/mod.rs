//! Platform build drivers.
//!
//! A driver turns a customized workspace into one installable package for
//! its platform. Drivers never panic or abort the engine on tool failure:
//! everything comes back as a [`DriverError`] the executor records against
//! that platform alone.

pub mod android;
pub mod ios;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::models::job::{BuildType, Platform};
use crate::services::error_service::{self, PlatformFailure};
use crate::services::job_service::JobLog;
use crate::services::process::{ProcessError, ProcessRunner, ToolCommand, ToolOutput};

pub use android::AndroidDriver;
pub use ios::IosDriver;

/// Entries listed when an expected output is missing.
const MAX_LISTING: usize = 50;

/// Everything a driver needs for one build.
pub struct DriverContext<'a> {
    pub workspace: &'a Path,
    pub build_type: BuildType,
    pub cancel: &'a CancellationToken,
    pub log: &'a JobLog,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{0}")]
    Unavailable(String),

    #[error("Native project not found at {}", .0.display())]
    MissingProject(PathBuf),

    #[error("{message}")]
    Tool {
        message: String,
        #[source]
        source: ProcessError,
    },

    #[error("{what} not found (searched: {}); contents of {}: {listing}", searched.join(", "), root.display())]
    OutputMissing {
        what: &'static str,
        searched: Vec<String>,
        root: PathBuf,
        listing: String,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Build cancelled")]
    Cancelled,
}

impl DriverError {
    /// Wrap a tool failure, surfacing its most actionable output line.
    pub fn from_process(err: ProcessError) -> Self {
        let detail = match &err {
            ProcessError::Cancelled { .. } => return DriverError::Cancelled,
            ProcessError::Failed { stdout, stderr, .. } => {
                error_service::extract_error_line(stdout)
                    .or_else(|| error_service::extract_error_line(stderr))
            }
            _ => None,
        };
        let message = match detail {
            Some(line) => format!("{err}: {line}"),
            None => err.to_string(),
        };
        DriverError::Tool {
            message,
            source: err,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DriverError::Cancelled)
    }

    pub fn category(&self) -> &'static str {
        match self {
            DriverError::Unavailable(_) => "unavailable",
            DriverError::Tool { source, .. } if source.is_missing_tool() => "tool_missing",
            DriverError::Tool { message, .. } => match error_service::classify_category(message) {
                "unavailable" | "output_missing" => "runtime",
                other => other,
            },
            DriverError::OutputMissing { .. } => "output_missing",
            DriverError::MissingProject(_) | DriverError::Io { .. } | DriverError::Cancelled => {
                "runtime"
            }
        }
    }

    pub fn into_failure(self, platform: Platform) -> PlatformFailure {
        PlatformFailure {
            platform,
            category: self.category(),
            message: self.to_string(),
        }
    }
}

#[async_trait]
pub trait PlatformDriver: Send + Sync {
    fn platform(&self) -> Platform;

    /// Whether this host can build the platform at all. Any tool it runs
    /// stops when `cancel` fires.
    async fn check_available(&self, cancel: &CancellationToken) -> Result<(), DriverError>;

    /// Build the workspace and return the path of the produced package.
    async fn build(&self, ctx: &DriverContext<'_>) -> Result<PathBuf, DriverError>;
}

/// The drivers the engine ships with, in build order.
pub fn default_drivers(config: &EngineConfig, runner: &ProcessRunner) -> Vec<Arc<dyn PlatformDriver>> {
    vec![
        Arc::new(AndroidDriver::new(runner.clone(), &config.tools)),
        Arc::new(IosDriver::new(runner.clone(), &config.tools)),
    ]
}

/// Run one tool step, logging the command line first.
pub(crate) async fn run_step(
    runner: &ProcessRunner,
    cmd: &ToolCommand,
    ctx: &DriverContext<'_>,
) -> Result<ToolOutput, DriverError> {
    ctx.log.info(format!("Running: {}", cmd.describe())).await;
    runner
        .run(cmd, ctx.cancel)
        .await
        .map_err(DriverError::from_process)
}

/// Resolve a configured tool relative to `dir` when it is a relative path
/// (e.g. `./gradlew`); bare names are left for `PATH` lookup.
pub(crate) fn resolve_tool(dir: &Path, program: &str) -> String {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        dir.join(path).to_string_lossy().into_owned()
    } else {
        program.to_string()
    }
}

/// Return the first candidate that exists as a file under `root`.
pub(crate) fn first_existing(root: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|c| root.join(c))
        .find(|p| p.is_file())
}

/// Recursive listing of `dir`, relative to it, for failure messages.
pub(crate) fn list_outputs(dir: &Path) -> String {
    let mut entries = Vec::new();
    collect_entries(dir, dir, &mut entries);
    if entries.is_empty() {
        return if dir.exists() {
            "(empty)".to_string()
        } else {
            "(directory does not exist)".to_string()
        };
    }
    entries.sort();
    let total = entries.len();
    entries.truncate(MAX_LISTING);
    let mut listing = entries.join(", ");
    if total > MAX_LISTING {
        listing.push_str(&format!(", ... ({} more)", total - MAX_LISTING));
    }
    listing
}

fn collect_entries(root: &Path, dir: &Path, entries: &mut Vec<String>) {
    let Ok(read) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in read.flatten() {
        let path = entry.path();
        // Symlinks are listed, never followed.
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            collect_entries(root, &path, entries);
        } else if let Ok(relative) = path.strip_prefix(root) {
            entries.push(relative.to_string_lossy().into_owned());
        }
    }
}
