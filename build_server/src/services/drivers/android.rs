//! Android driver: Capacitor sync, then Gradle.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ToolCommands;
use crate::models::job::{BuildType, Platform};
use crate::services::drivers::{
    first_existing, list_outputs, resolve_tool, run_step, DriverContext, DriverError,
    PlatformDriver,
};
use crate::services::process::{ProcessRunner, ToolCommand};

/// Output directory searched on a miss, relative to `android/`.
pub const OUTPUTS_DIR: &str = "app/build/outputs";

/// Conventional APK locations relative to `android/`, first match wins.
/// Older Gradle plugins drop the variant directory.
pub fn apk_candidates(build_type: BuildType) -> &'static [&'static str] {
    match build_type {
        BuildType::Debug => &[
            "app/build/outputs/apk/debug/app-debug.apk",
            "app/build/outputs/apk/app-debug.apk",
        ],
        BuildType::Release => &[
            "app/build/outputs/apk/release/app-release.apk",
            "app/build/outputs/apk/release/app-release-unsigned.apk",
            "app/build/outputs/apk/app-release.apk",
        ],
    }
}

pub fn gradle_task(build_type: BuildType) -> &'static str {
    match build_type {
        BuildType::Debug => "assembleDebug",
        BuildType::Release => "assembleRelease",
    }
}

pub struct AndroidDriver {
    runner: ProcessRunner,
    sync: Vec<String>,
    gradle: String,
}

impl AndroidDriver {
    pub fn new(runner: ProcessRunner, tools: &ToolCommands) -> Self {
        Self {
            runner,
            sync: tools.android_sync.clone(),
            gradle: tools.gradle.clone(),
        }
    }
}

#[async_trait]
impl PlatformDriver for AndroidDriver {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn check_available(&self, _cancel: &CancellationToken) -> Result<(), DriverError> {
        Ok(())
    }

    async fn build(&self, ctx: &DriverContext<'_>) -> Result<PathBuf, DriverError> {
        let android_dir = ctx.workspace.join("android");
        if !android_dir.is_dir() {
            return Err(DriverError::MissingProject(android_dir));
        }

        if let Some(sync) = ToolCommand::from_argv(&self.sync) {
            run_step(&self.runner, &sync.current_dir(ctx.workspace), ctx).await?;
        }

        let gradle = ToolCommand::new(resolve_tool(&android_dir, &self.gradle))
            .arg(gradle_task(ctx.build_type))
            .arg("--no-daemon")
            .current_dir(&android_dir)
            .env("CI", "true");
        run_step(&self.runner, &gradle, ctx).await?;

        let candidates = apk_candidates(ctx.build_type);
        if let Some(apk) = first_existing(&android_dir, candidates) {
            ctx.log.info(format!("Found APK at {}", apk.display())).await;
            return Ok(apk);
        }

        let outputs = android_dir.join(OUTPUTS_DIR);
        Err(DriverError::OutputMissing {
            what: "APK",
            searched: candidates.iter().map(|c| c.to_string()).collect(),
            listing: list_outputs(&outputs),
            root: PathBuf::from("android").join(OUTPUTS_DIR),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::models::job::{NewBuildJob, PlatformSelection};
    use crate::models::snapshot::ConfigSnapshot;
    use crate::services::job_service::JobLog;
    use crate::store::{MemoryStore, RecordStore};

    fn write_gradlew(android_dir: &Path, body: &str) {
        fs::create_dir_all(android_dir).unwrap();
        let script = android_dir.join("gradlew");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn driver() -> AndroidDriver {
        let tools = ToolCommands {
            android_sync: vec!["true".to_string()],
            ..Default::default()
        };
        AndroidDriver::new(ProcessRunner::new(Duration::from_secs(1)), &tools)
    }

    async fn log() -> JobLog {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let job = store
            .create_job(NewBuildJob {
                app_id: "app".into(),
                user_id: "user".into(),
                platform: PlatformSelection::Android,
                build_type: BuildType::Debug,
                config_snapshot: ConfigSnapshot::default(),
            })
            .await
            .unwrap();
        JobLog::new(store, job.id)
    }

    #[test]
    fn candidates_start_with_variant_directory() {
        assert_eq!(
            apk_candidates(BuildType::Debug)[0],
            "app/build/outputs/apk/debug/app-debug.apk"
        );
        assert_eq!(apk_candidates(BuildType::Release).len(), 3);
        assert_eq!(gradle_task(BuildType::Release), "assembleRelease");
    }

    #[tokio::test]
    async fn finds_debug_apk_at_conventional_path() {
        let ws = tempfile::tempdir().unwrap();
        write_gradlew(
            &ws.path().join("android"),
            "[ \"$1\" = assembleDebug ] || exit 9\nmkdir -p app/build/outputs/apk/debug\necho apk > app/build/outputs/apk/debug/app-debug.apk",
        );
        let log = log().await;
        let cancel = CancellationToken::new();
        let ctx = DriverContext {
            workspace: ws.path(),
            build_type: BuildType::Debug,
            cancel: &cancel,
            log: &log,
        };

        let apk = driver().build(&ctx).await.unwrap();
        assert!(apk.ends_with("android/app/build/outputs/apk/debug/app-debug.apk"));
    }

    #[tokio::test]
    async fn release_falls_back_to_unsigned_apk() {
        let ws = tempfile::tempdir().unwrap();
        write_gradlew(
            &ws.path().join("android"),
            "mkdir -p app/build/outputs/apk/release\necho apk > app/build/outputs/apk/release/app-release-unsigned.apk",
        );
        let log = log().await;
        let cancel = CancellationToken::new();
        let ctx = DriverContext {
            workspace: ws.path(),
            build_type: BuildType::Release,
            cancel: &cancel,
            log: &log,
        };

        let apk = driver().build(&ctx).await.unwrap();
        assert!(apk.ends_with("app-release-unsigned.apk"));
    }

    #[tokio::test]
    async fn missing_apk_lists_output_directory() {
        let ws = tempfile::tempdir().unwrap();
        write_gradlew(
            &ws.path().join("android"),
            "mkdir -p app/build/outputs/bundle/debug\necho aab > app/build/outputs/bundle/debug/app-debug.aab",
        );
        let log = log().await;
        let cancel = CancellationToken::new();
        let ctx = DriverContext {
            workspace: ws.path(),
            build_type: BuildType::Debug,
            cancel: &cancel,
            log: &log,
        };

        let err = driver().build(&ctx).await.unwrap_err();
        assert_eq!(err.category(), "output_missing");
        assert!(err.to_string().contains("bundle/debug/app-debug.aab"), "{err}");
    }

    #[tokio::test]
    async fn gradle_failure_is_a_tool_error() {
        let ws = tempfile::tempdir().unwrap();
        write_gradlew(
            &ws.path().join("android"),
            "echo 'FAILURE: Build failed with an exception.'\necho '* What went wrong:'\necho \"Execution failed for task ':app:processDebugResources'.\"\nexit 1",
        );
        let log = log().await;
        let cancel = CancellationToken::new();
        let ctx = DriverContext {
            workspace: ws.path(),
            build_type: BuildType::Debug,
            cancel: &cancel,
            log: &log,
        };

        let err = driver().build(&ctx).await.unwrap_err();
        assert_eq!(err.category(), "compile");
        assert!(err.to_string().contains(":app:processDebugResources"), "{err}");
    }

    #[tokio::test]
    async fn missing_android_project_fails_fast() {
        let ws = tempfile::tempdir().unwrap();
        let log = log().await;
        let cancel = CancellationToken::new();
        let ctx = DriverContext {
            workspace: ws.path(),
            build_type: BuildType::Debug,
            cancel: &cancel,
            log: &log,
        };

        let err = driver().build(&ctx).await.unwrap_err();
        assert!(matches!(err, DriverError::MissingProject(_)));
    }
}
