//! build.config_snapshot: Per-app configuration captured at submission time.
//!
//! The snapshot is copied into the job record once and never re-read from
//! the asset/config provider, so later edits to the app do not leak into
//! in-flight or historical builds.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::job::PlatformSelection;

static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z][A-Za-z0-9_-]*)+$").unwrap()
});

pub const DEFAULT_VERSION_NAME: &str = "1.0.0";
pub const DEFAULT_VERSION_CODE: u32 = 1;
pub const DEFAULT_THEME_COLOR: &str = "#ffffff";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigSnapshot {
    pub app_name: String,
    pub website_url: String,
    pub package_id: Option<String>,
    pub bundle_id: Option<String>,
    pub version_name: Option<String>,
    pub version_code: Option<u32>,
    pub theme_color: Option<String>,
    pub features: FeatureFlags,
    pub firebase: FirebaseSettings,
    pub attribution: AttributionSettings,
    pub icon_path: Option<String>,
    pub splash_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureFlags {
    pub pull_to_refresh: bool,
    pub push_notifications: bool,
    pub splash_screen: bool,
    pub offline_page: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FirebaseSettings {
    pub enabled: bool,
    pub project_id: Option<String>,
    /// Contents of `google-services.json`, written verbatim into the Android project.
    pub google_services: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttributionSettings {
    pub enabled: bool,
    pub dev_key: Option<String>,
    pub apple_app_id: Option<String>,
}

impl ConfigSnapshot {
    pub fn bundle_id(&self) -> Option<&str> {
        self.bundle_id
            .as_deref()
            .or(self.package_id.as_deref())
            .filter(|s| !s.is_empty())
    }

    pub fn version_name(&self) -> &str {
        self.version_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_VERSION_NAME)
    }

    pub fn version_code(&self) -> u32 {
        self.version_code.unwrap_or(DEFAULT_VERSION_CODE)
    }

    pub fn theme_color(&self) -> &str {
        self.theme_color
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_THEME_COLOR)
    }

    /// Check that every required token source is present and well-formed.
    ///
    /// Returns all problems at once so the job log names every missing field.
    pub fn validate(&self, platforms: PlatformSelection) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.app_name.trim().is_empty() {
            problems.push("appName is required".to_string());
        }

        if !(self.website_url.starts_with("https://") || self.website_url.starts_with("http://"))
        {
            problems.push(format!(
                "websiteUrl must be an http(s) URL, got '{}'",
                self.website_url
            ));
        }

        match self.package_id.as_deref() {
            None | Some("") => problems.push("packageId is required".to_string()),
            Some(id) if !IDENTIFIER_REGEX.is_match(id) => {
                problems.push(format!("packageId '{id}' is not a reverse-DNS identifier"))
            }
            Some(_) => {}
        }

        if platforms.includes(crate::models::job::Platform::Ios) {
            if let Some(id) = self.bundle_id.as_deref() {
                if !IDENTIFIER_REGEX.is_match(id) {
                    problems.push(format!("bundleId '{id}' is not a reverse-DNS identifier"));
                }
            }
        }

        if self.attribution.enabled
            && self.attribution.dev_key.as_deref().unwrap_or("").is_empty()
        {
            problems.push("attribution is enabled but devKey is missing".to_string());
        }

        for (field, value) in self.text_values() {
            if value.contains("{{") {
                problems.push(format!("{field} may not contain '{{{{'"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    fn text_values(&self) -> Vec<(&'static str, &str)> {
        let mut values = vec![
            ("appName", self.app_name.as_str()),
            ("websiteUrl", self.website_url.as_str()),
        ];
        let optional = [
            ("packageId", &self.package_id),
            ("bundleId", &self.bundle_id),
            ("versionName", &self.version_name),
            ("themeColor", &self.theme_color),
            ("firebase.projectId", &self.firebase.project_id),
            ("attribution.devKey", &self.attribution.dev_key),
            ("attribution.appleAppId", &self.attribution.apple_app_id),
        ];
        for (field, value) in optional {
            if let Some(v) = value {
                values.push((field, v.as_str()));
            }
        }
        values
    }
}
