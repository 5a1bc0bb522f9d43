//! iOS driver: Capacitor sync, xcodebuild, then IPA packaging.
//!
//! Only macOS hosts with a working Xcode can build iOS. Everywhere else the
//! driver reports itself unavailable and the executor decides whether that
//! skips iOS or fails the job.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ToolCommands;
use crate::models::job::{BuildType, Platform};
use crate::services::drivers::{
    list_outputs, run_step, DriverContext, DriverError, PlatformDriver,
};
use crate::services::process::{ProcessError, ProcessRunner, ToolCommand};
use crate::services::workspace::copy_dir_recursive;

/// Derived data location relative to the workspace.
pub const DERIVED_DATA_DIR: &str = "ios/build";

pub fn configuration(build_type: BuildType) -> &'static str {
    match build_type {
        BuildType::Debug => "Debug",
        BuildType::Release => "Release",
    }
}

pub struct IosDriver {
    runner: ProcessRunner,
    sync: Vec<String>,
    xcodebuild: String,
    zip: String,
    scheme: String,
    host_os: &'static str,
}

impl IosDriver {
    pub fn new(runner: ProcessRunner, tools: &ToolCommands) -> Self {
        Self {
            runner,
            sync: tools.ios_sync.clone(),
            xcodebuild: tools.xcodebuild.clone(),
            zip: tools.zip.clone(),
            scheme: tools.ios_scheme.clone(),
            host_os: std::env::consts::OS,
        }
    }

    /// Override the detected host OS.
    pub fn with_host_os(mut self, host_os: &'static str) -> Self {
        self.host_os = host_os;
        self
    }

    fn xcodebuild_command(&self, workspace: &Path, build_type: BuildType) -> ToolCommand {
        let xcworkspace = format!("ios/App/{}.xcworkspace", self.scheme);
        ToolCommand::new(&self.xcodebuild)
            .args(["-workspace", xcworkspace.as_str()])
            .args(["-scheme", self.scheme.as_str()])
            .args(["-configuration", configuration(build_type)])
            .args(["-sdk", "iphoneos", "-derivedDataPath", DERIVED_DATA_DIR])
            .args(["CODE_SIGNING_ALLOWED=NO", "build"])
            .current_dir(workspace)
    }

    fn products_dir(&self, workspace: &Path, build_type: BuildType) -> PathBuf {
        workspace
            .join(DERIVED_DATA_DIR)
            .join("Build/Products")
            .join(format!("{}-iphoneos", configuration(build_type)))
    }

    /// Wrap the `.app` bundle as `Payload/<scheme>.app` and zip it into an IPA.
    async fn package_ipa(
        &self,
        app_path: &Path,
        workspace: &Path,
        ctx: &DriverContext<'_>,
    ) -> Result<PathBuf, DriverError> {
        let export_dir = workspace.join(DERIVED_DATA_DIR).join("ipa");
        let payload_dir = export_dir.join("Payload");
        let ipa_path = export_dir.join(format!("{}.ipa", self.scheme));

        let app = app_path.to_path_buf();
        let dest_app = payload_dir.join(format!("{}.app", self.scheme));
        let payload = payload_dir.clone();
        let ipa = ipa_path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if payload.exists() {
                std::fs::remove_dir_all(&payload)?;
            }
            if ipa.exists() {
                std::fs::remove_file(&ipa)?;
            }
            copy_dir_recursive(&app, &dest_app).map(|_| ())
        })
        .await
        .map_err(|e| DriverError::Io {
            path: payload_dir.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
        .map_err(|source| DriverError::Io {
            path: payload_dir.clone(),
            source,
        })?;

        let zip = ToolCommand::new(&self.zip)
            .args(["-qry"])
            .arg(&ipa_path)
            .arg("Payload")
            .current_dir(&export_dir);
        run_step(&self.runner, &zip, ctx).await?;

        if !ipa_path.is_file() {
            return Err(DriverError::OutputMissing {
                what: "IPA",
                searched: vec![ipa_path.to_string_lossy().into_owned()],
                listing: list_outputs(&export_dir),
                root: export_dir,
            });
        }
        Ok(ipa_path)
    }
}

#[async_trait]
impl PlatformDriver for IosDriver {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    async fn check_available(&self, cancel: &CancellationToken) -> Result<(), DriverError> {
        if self.host_os != "macos" {
            return Err(DriverError::Unavailable(format!(
                "iOS builds require macOS with Xcode; not available on {}",
                self.host_os
            )));
        }

        let version = ToolCommand::new(&self.xcodebuild).arg("-version");
        match self.runner.run(&version, cancel).await {
            Ok(output) => {
                tracing::debug!(version = %output.stdout.lines().next().unwrap_or(""), "xcodebuild available");
                Ok(())
            }
            Err(ProcessError::Cancelled { .. }) => Err(DriverError::Cancelled),
            Err(e) => Err(DriverError::Unavailable(format!(
                "iOS builds are not available: xcodebuild is not usable ({e})"
            ))),
        }
    }

    async fn build(&self, ctx: &DriverContext<'_>) -> Result<PathBuf, DriverError> {
        let ios_dir = ctx.workspace.join("ios");
        if !ios_dir.is_dir() {
            return Err(DriverError::MissingProject(ios_dir));
        }

        if let Some(sync) = ToolCommand::from_argv(&self.sync) {
            run_step(&self.runner, &sync.current_dir(ctx.workspace), ctx).await?;
        }

        run_step(
            &self.runner,
            &self.xcodebuild_command(ctx.workspace, ctx.build_type),
            ctx,
        )
        .await?;

        let products = self.products_dir(ctx.workspace, ctx.build_type);
        let app_path = products.join(format!("{}.app", self.scheme));
        if !app_path.is_dir() {
            return Err(DriverError::OutputMissing {
                what: "App bundle",
                searched: vec![app_path.to_string_lossy().into_owned()],
                listing: list_outputs(&products),
                root: products,
            });
        }

        ctx.log
            .info(format!("Packaging {} as IPA", app_path.display()))
            .await;
        self.package_ipa(&app_path, ctx.workspace, ctx).await
    }
}
