#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use appforge_builder::config::{EngineConfig, ToolCommands};
use appforge_builder::models::job::{
    BuildJob, BuildType, JobId, NewBuildJob, PlatformSelection,
};
use appforge_builder::models::snapshot::ConfigSnapshot;
use appforge_builder::services::artifact_service::ArtifactManager;
use appforge_builder::services::drivers::{AndroidDriver, IosDriver, PlatformDriver};
use appforge_builder::services::executor::JobExecutor;
use appforge_builder::services::process::ProcessRunner;
use appforge_builder::services::scheduler::Scheduler;
use appforge_builder::services::workspace::WorkspaceManager;
use appforge_builder::store::{MemoryStore, RecordStore};

/// Fake Gradle that produces a debug APK from the customized config.
pub const GRADLEW_OK: &str = "mkdir -p app/build/outputs/apk/debug\n\
cp ../capacitor.config.json app/build/outputs/apk/debug/app-debug.apk";

pub const GRADLEW_SLOW: &str = "sleep 30";

pub const GRADLEW_COMPILE_ERROR: &str = "echo 'FAILURE: Build failed with an exception.'\n\
echo '* What went wrong:'\n\
echo \"Execution failed for task ':app:compileDebugJavaWithJavac'.\"\n\
exit 1";

/// Fake xcodebuild that reports a version and produces `App.app`.
pub const XCODEBUILD_OK: &str = "case \"$1\" in -version) echo 'Xcode 16.0'; exit 0;; esac\n\
mkdir -p ios/build/Build/Products/Debug-iphoneos/App.app\n\
cp ios/App/App/Info.plist ios/build/Build/Products/Debug-iphoneos/App.app/Info.plist";

pub const XCODEBUILD_SIGNING_ERROR: &str = "case \"$1\" in -version) echo 'Xcode 16.0'; exit 0;; esac\n\
echo \"error: No profiles for 'com.example.shop' were found\"\n\
echo '** BUILD FAILED **'\n\
exit 65";

/// Hangs on every invocation, `-version` included.
pub const XCODEBUILD_HANGS: &str = "sleep 30";

/// Fake zip: `zip -qry <ipa> Payload` writes the payload listing into the IPA.
const FAKE_ZIP: &str = "shift\nipa=\"$1\"\nshift\nfind \"$@\" > \"$ipa\"";

/// Scratch directories for one engine instance.
pub struct Fixture {
    pub root: tempfile::TempDir,
    pub config: EngineConfig,
    pub ios_host: &'static str,
}

impl Fixture {
    pub fn new(gradlew: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let template = root.path().join("template");
        write_template(&template, gradlew);

        let config = EngineConfig {
            template_dir: template,
            jobs_dir: root.path().join("jobs"),
            artifacts_dir: root.path().join("artifacts"),
            max_concurrent_builds: 1,
            job_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(2),
            retain_workspaces: false,
            tools: ToolCommands {
                install: Vec::new(),
                android_sync: vec!["true".to_string()],
                ios_sync: vec!["true".to_string()],
                ..Default::default()
            },
        };
        Self {
            root,
            config,
            ios_host: "linux",
        }
    }

    /// Pretend to be a macOS host whose Xcode runs `xcodebuild`.
    pub fn with_ios(mut self, xcodebuild: &str) -> Self {
        let bin = self.root.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        self.config.tools.xcodebuild = write_script(&bin.join("xcodebuild"), xcodebuild);
        self.config.tools.zip = write_script(&bin.join("zip"), FAKE_ZIP);
        self.ios_host = "macos";
        self
    }

    pub fn template_dir(&self) -> &Path {
        &self.config.template_dir
    }

    pub fn workspace(&self, id: JobId) -> PathBuf {
        self.config.jobs_dir.join(id.to_string())
    }

    /// Start an engine whose iOS driver sees `ios_host`.
    pub fn start(&self) -> (Scheduler, Arc<dyn RecordStore>) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let runner = ProcessRunner::new(self.config.kill_grace);
        let drivers: Vec<Arc<dyn PlatformDriver>> = vec![
            Arc::new(AndroidDriver::new(runner.clone(), &self.config.tools)),
            Arc::new(IosDriver::new(runner.clone(), &self.config.tools).with_host_os(self.ios_host)),
        ];
        let executor = JobExecutor::new(
            store.clone(),
            WorkspaceManager::new(
                &self.config.template_dir,
                &self.config.jobs_dir,
                self.config.tools.install.clone(),
                runner,
                self.config.retain_workspaces,
            ),
            ArtifactManager::new(&self.config.artifacts_dir),
            drivers,
            self.config.job_timeout,
        );
        (
            Scheduler::start(executor, self.config.max_concurrent_builds),
            store,
        )
    }
}

pub fn write_template(dir: &Path, gradlew: &str) {
    fs::create_dir_all(dir.join("www")).unwrap();
    fs::create_dir_all(dir.join("android/app/src/main/res/values")).unwrap();
    fs::write(
        dir.join("capacitor.config.json"),
        r#"{"appId":"{{PACKAGE_ID}}","appName":"{{APP_NAME}}","server":{"url":"{{WEBSITE_URL}}"}}"#,
    )
    .unwrap();
    fs::write(
        dir.join("www/index.html"),
        "<html><head><title>{{APP_NAME}}</title>\
         {{#ATTRIBUTION}}<script>init('{{ATTRIBUTION_DEV_KEY}}')</script>{{/ATTRIBUTION}}\
         </head></html>\n",
    )
    .unwrap();
    fs::write(
        dir.join("android/app/src/main/res/values/strings.xml"),
        "<resources><string name=\"app_name\">{{APP_NAME}}</string></resources>\n",
    )
    .unwrap();

    fs::create_dir_all(dir.join("ios/App/App")).unwrap();
    fs::write(
        dir.join("ios/App/App/Info.plist"),
        "<plist><dict><key>CFBundleIdentifier</key><string>{{BUNDLE_ID}}</string></dict></plist>\n",
    )
    .unwrap();

    write_script(&dir.join("android/gradlew"), gradlew);
}

fn write_script(path: &Path, body: &str) -> String {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

pub fn snapshot() -> ConfigSnapshot {
    ConfigSnapshot {
        app_name: "Corner Shop".to_string(),
        website_url: "https://shop.example.com".to_string(),
        package_id: Some("com.example.shop".to_string()),
        ..Default::default()
    }
}

pub fn new_job(platform: PlatformSelection) -> NewBuildJob {
    NewBuildJob {
        app_id: "app-1".to_string(),
        user_id: "user-1".to_string(),
        platform,
        build_type: BuildType::Debug,
        config_snapshot: snapshot(),
    }
}

pub async fn wait_until<F>(store: &Arc<dyn RecordStore>, id: JobId, what: &str, pred: F) -> BuildJob
where
    F: Fn(&BuildJob) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if let Some(job) = store.get_job(id).await.unwrap() {
            if pred(&job) {
                return job;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub async fn wait_terminal(store: &Arc<dyn RecordStore>, id: JobId) -> BuildJob {
    wait_until(store, id, "a terminal state", |job| job.status.is_terminal()).await
}

/// Wait until the Gradle step of a job has been launched.
pub async fn wait_for_gradle(store: &Arc<dyn RecordStore>, id: JobId) -> BuildJob {
    wait_until(store, id, "the gradle step", |job| {
        job.logs
            .iter()
            .any(|l| l.message.starts_with("Running:") && l.message.contains("gradlew"))
    })
    .await
}

pub fn messages(job: &BuildJob) -> Vec<&str> {
    job.logs.iter().map(|l| l.message.as_str()).collect()
}
