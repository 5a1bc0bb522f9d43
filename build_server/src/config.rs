//! Build engine configuration, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// External tool invocations, each an explicit argv (no shell).
#[derive(Clone, Debug)]
pub struct ToolCommands {
    /// Dependency installation run in the fresh workspace. Empty skips it.
    pub install: Vec<String>,
    /// Synchronizes web assets into the Android wrapper project.
    pub android_sync: Vec<String>,
    /// Synchronizes web assets into the iOS wrapper project.
    pub ios_sync: Vec<String>,
    /// Gradle wrapper, resolved relative to the workspace `android/` directory.
    pub gradle: String,
    pub xcodebuild: String,
    pub zip: String,
    /// Xcode scheme (and workspace name) of the iOS wrapper project.
    pub ios_scheme: String,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            install: split_command("npm install"),
            android_sync: split_command("npx cap sync android"),
            ios_sync: split_command("npx cap sync ios"),
            gradle: "./gradlew".to_string(),
            xcodebuild: "xcodebuild".to_string(),
            zip: "zip".to_string(),
            ios_scheme: "App".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Read-only project template copied into every workspace.
    pub template_dir: PathBuf,
    /// Ephemeral root holding one job-id-keyed workspace per running job.
    pub jobs_dir: PathBuf,
    /// Durable root holding one job-id-keyed directory of final packages.
    pub artifacts_dir: PathBuf,
    /// Maximum number of concurrently executing jobs (worker pool size).
    pub max_concurrent_builds: usize,
    /// Wall-clock limit per job, enforced by the scheduler.
    pub job_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when stopping a tool process group.
    pub kill_grace: Duration,
    /// Keep workspaces after the job terminates, for diagnostics.
    pub retain_workspaces: bool,
    pub tools: ToolCommands,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from("./template"),
            jobs_dir: PathBuf::from("./data/jobs"),
            artifacts_dir: PathBuf::from("./data/artifacts"),
            max_concurrent_builds: 1,
            job_timeout: Duration::from_secs(1800),
            kill_grace: Duration::from_secs(10),
            retain_workspaces: false,
            tools: ToolCommands::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let template_dir = std::env::var("APPFORGE_TEMPLATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.template_dir);
        let jobs_dir = std::env::var("APPFORGE_JOBS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.jobs_dir);
        let artifacts_dir = std::env::var("APPFORGE_ARTIFACTS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.artifacts_dir);
        let max_concurrent_builds = std::env::var("APPFORGE_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_concurrent_builds);
        let job_timeout = std::env::var("APPFORGE_JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.job_timeout);
        let kill_grace = std::env::var("APPFORGE_KILL_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.kill_grace);
        let retain_workspaces = std::env::var("APPFORGE_RETAIN_WORKSPACES")
            .map(|s| matches!(s.as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.retain_workspaces);

        let tool_defaults = defaults.tools;
        let tools = ToolCommands {
            install: std::env::var("APPFORGE_INSTALL_CMD")
                .map(|s| split_command(&s))
                .unwrap_or(tool_defaults.install),
            android_sync: std::env::var("APPFORGE_ANDROID_SYNC_CMD")
                .map(|s| split_command(&s))
                .unwrap_or(tool_defaults.android_sync),
            ios_sync: std::env::var("APPFORGE_IOS_SYNC_CMD")
                .map(|s| split_command(&s))
                .unwrap_or(tool_defaults.ios_sync),
            gradle: std::env::var("APPFORGE_GRADLE_BIN").unwrap_or(tool_defaults.gradle),
            xcodebuild: std::env::var("APPFORGE_XCODEBUILD_BIN")
                .unwrap_or(tool_defaults.xcodebuild),
            zip: std::env::var("APPFORGE_ZIP_BIN").unwrap_or(tool_defaults.zip),
            ios_scheme: std::env::var("APPFORGE_IOS_SCHEME").unwrap_or(tool_defaults.ios_scheme),
        };

        let config = Self {
            template_dir,
            jobs_dir,
            artifacts_dir,
            max_concurrent_builds,
            job_timeout,
            kill_grace,
            retain_workspaces,
            tools,
        };
        config.normalized()
    }

    /// Clamp values that would stall the engine.
    pub fn normalized(mut self) -> Self {
        if self.max_concurrent_builds == 0 {
            tracing::warn!("APPFORGE_MAX_CONCURRENT is 0 -- using 1 worker");
            self.max_concurrent_builds = 1;
        }
        if self.job_timeout.is_zero() {
            tracing::warn!("APPFORGE_JOB_TIMEOUT_SECS is 0 -- using the 1800s default");
            self.job_timeout = Duration::from_secs(1800);
        }
        if !self.template_dir.is_dir() {
            tracing::warn!(
                template = %self.template_dir.display(),
                "Template directory does not exist -- every build will fail its precondition check"
            );
        }
        if self.retain_workspaces {
            tracing::warn!("Workspace retention enabled -- job directories will not be cleaned up");
        }
        self
    }
}

/// Split a configured command line into argv on whitespace.
/// Quoting is not supported.
pub fn split_command(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}
