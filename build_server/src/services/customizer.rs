//! Template customization.
//!
//! Rewrites a known set of project files in a job workspace from the job's
//! config snapshot. Placeholders are `{{NAME}}`; conditional blocks are
//! `{{#FLAG}}...{{/FLAG}}`. Values are escaped for the file they land in.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::models::snapshot::ConfigSnapshot;

static TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{[#/]?[A-Z][A-Z0-9_]*\}\}").unwrap());
static BLOCK_OPEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{#[A-Z][A-Z0-9_]*\}\}").unwrap());

/// How substituted values are escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Inside a JSON string literal.
    Json,
    /// XML text or attribute value (plists included).
    Xml,
    /// Android string resources: XML plus aapt's quote escaping.
    AndroidStrings,
    Html,
    /// Inside a double-quoted Groovy string.
    Gradle,
}

/// Files rewritten in every workspace, relative to its root.
pub const KNOWN_FILES: &[(&str, FileKind)] = &[
    ("capacitor.config.json", FileKind::Json),
    ("www/index.html", FileKind::Html),
    ("android/app/src/main/res/values/strings.xml", FileKind::AndroidStrings),
    ("android/app/build.gradle", FileKind::Gradle),
    ("ios/App/App/Info.plist", FileKind::Xml),
];

pub const GOOGLE_SERVICES_PATH: &str = "android/app/google-services.json";
pub const ICON_PATH: &str = "resources/icon.png";
pub const SPLASH_PATH: &str = "resources/splash.png";

#[derive(Debug, thiserror::Error)]
pub enum CustomizeError {
    #[error("Required configuration value missing: {0}")]
    MissingValue(&'static str),

    #[error("Unresolved placeholder {token} in {}", file.display())]
    UnresolvedToken { file: PathBuf, token: String },

    #[error("Unknown conditional block {{{{#{flag}}}}} in {}", file.display())]
    UnknownBlock { file: PathBuf, flag: String },

    #[error("Conditional block {{{{#{flag}}}}} in {} is never closed", file.display())]
    UnbalancedBlock { file: PathBuf, flag: String },

    #[error("Failed to serialize {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a customization pass did, for the job log.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CustomizeReport {
    pub rewritten: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub written: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Substitution inputs derived from a snapshot.
#[derive(Debug, Clone)]
pub struct TemplateValues {
    values: Vec<(&'static str, String)>,
    flags: Vec<(&'static str, bool)>,
}

impl TemplateValues {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Result<Self, CustomizeError> {
        if snapshot.app_name.trim().is_empty() {
            return Err(CustomizeError::MissingValue("appName"));
        }
        if snapshot.website_url.is_empty() {
            return Err(CustomizeError::MissingValue("websiteUrl"));
        }
        let package_id = snapshot
            .package_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(CustomizeError::MissingValue("packageId"))?;
        let bundle_id = snapshot.bundle_id().unwrap_or(package_id);

        let features = &snapshot.features;
        let firebase = &snapshot.firebase;
        let attribution = &snapshot.attribution;

        // Disabled integrations substitute empty strings.
        let optional = |enabled: bool, value: &Option<String>| {
            if enabled {
                value.clone().unwrap_or_default()
            } else {
                String::new()
            }
        };

        let values = vec![
            ("APP_NAME", snapshot.app_name.trim().to_string()),
            ("WEBSITE_URL", snapshot.website_url.clone()),
            ("PACKAGE_ID", package_id.to_string()),
            ("BUNDLE_ID", bundle_id.to_string()),
            ("VERSION_NAME", snapshot.version_name().to_string()),
            ("VERSION_CODE", snapshot.version_code().to_string()),
            ("THEME_COLOR", snapshot.theme_color().to_string()),
            ("PULL_TO_REFRESH", features.pull_to_refresh.to_string()),
            ("PUSH_NOTIFICATIONS", features.push_notifications.to_string()),
            ("SPLASH_SCREEN", features.splash_screen.to_string()),
            ("OFFLINE_PAGE", features.offline_page.to_string()),
            (
                "FIREBASE_PROJECT_ID",
                optional(firebase.enabled, &firebase.project_id),
            ),
            (
                "ATTRIBUTION_DEV_KEY",
                optional(attribution.enabled, &attribution.dev_key),
            ),
            (
                "ATTRIBUTION_APPLE_APP_ID",
                optional(attribution.enabled, &attribution.apple_app_id),
            ),
        ];

        let flags = vec![
            ("PULL_TO_REFRESH", features.pull_to_refresh),
            ("PUSH_NOTIFICATIONS", features.push_notifications),
            ("SPLASH_SCREEN", features.splash_screen),
            ("OFFLINE_PAGE", features.offline_page),
            ("FIREBASE", firebase.enabled),
            ("ATTRIBUTION", attribution.enabled),
        ];

        Ok(Self { values, flags })
    }

    fn flag(&self, name: &str) -> Option<bool> {
        self.flags.iter().find(|(f, _)| *f == name).map(|(_, on)| *on)
    }
}

/// Customize the workspace at `workspace` from `snapshot`.
pub async fn customize(
    workspace: &Path,
    snapshot: &ConfigSnapshot,
) -> Result<CustomizeReport, CustomizeError> {
    let workspace = workspace.to_path_buf();
    let snapshot = snapshot.clone();
    tokio::task::spawn_blocking(move || customize_blocking(&workspace, &snapshot))
        .await
        .map_err(|e| CustomizeError::Io {
            path: PathBuf::new(),
            source: io::Error::new(io::ErrorKind::Other, e),
        })?
}

pub fn customize_blocking(
    workspace: &Path,
    snapshot: &ConfigSnapshot,
) -> Result<CustomizeReport, CustomizeError> {
    let values = TemplateValues::from_snapshot(snapshot)?;
    let mut report = CustomizeReport::default();

    for (relative, kind) in KNOWN_FILES {
        let path = workspace.join(relative);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.skipped.push(PathBuf::from(relative));
                continue;
            }
            Err(source) => return Err(CustomizeError::Io { path, source }),
        };

        let rendered = render(&content, *kind, &values, Path::new(relative))?;
        if rendered != content {
            fs::write(&path, rendered).map_err(|source| CustomizeError::Io {
                path: path.clone(),
                source,
            })?;
            report.rewritten.push(PathBuf::from(relative));
        }
    }

    write_google_services(workspace, snapshot, &mut report)?;
    copy_asset(workspace, snapshot.icon_path.as_deref(), ICON_PATH, "icon", &mut report)?;
    copy_asset(
        workspace,
        snapshot.splash_path.as_deref(),
        SPLASH_PATH,
        "splash",
        &mut report,
    )?;

    Ok(report)
}

/// Render one file: resolve conditional blocks, substitute escaped values,
/// then reject anything still shaped like a placeholder.
pub fn render(
    content: &str,
    kind: FileKind,
    values: &TemplateValues,
    file: &Path,
) -> Result<String, CustomizeError> {
    let mut output = apply_blocks(content, values, file)?;

    for (name, value) in &values.values {
        output = output.replace(&format!("{{{{{name}}}}}"), &escape(kind, value));
    }

    if let Some(leftover) = TOKEN_REGEX.find(&output) {
        return Err(CustomizeError::UnresolvedToken {
            file: file.to_path_buf(),
            token: leftover.as_str().to_string(),
        });
    }

    Ok(output)
}

fn apply_blocks(
    content: &str,
    values: &TemplateValues,
    file: &Path,
) -> Result<String, CustomizeError> {
    let mut output = content.to_string();

    // Outermost first; kept blocks expose their nested blocks to the next pass.
    while let Some(open) = BLOCK_OPEN_REGEX.find(&output) {
        let (start, open_end) = (open.start(), open.end());
        let flag = output[start + 3..open_end - 2].to_string();

        let enabled = values
            .flag(&flag)
            .ok_or_else(|| CustomizeError::UnknownBlock {
                file: file.to_path_buf(),
                flag: flag.clone(),
            })?;

        let close = format!("{{{{/{flag}}}}}");
        let close_start = output[open_end..]
            .find(&close)
            .map(|i| open_end + i)
            .ok_or_else(|| CustomizeError::UnbalancedBlock {
                file: file.to_path_buf(),
                flag: flag.clone(),
            })?;

        let inner = if enabled {
            output[open_end..close_start].to_string()
        } else {
            String::new()
        };
        output.replace_range(start..close_start + close.len(), &inner);
    }

    Ok(output)
}

pub fn escape(kind: FileKind, value: &str) -> String {
    match kind {
        FileKind::Json => {
            let quoted = serde_json::Value::String(value.to_string()).to_string();
            quoted[1..quoted.len() - 1].to_string()
        }
        FileKind::Xml | FileKind::Html => escape_markup(value),
        FileKind::AndroidStrings => escape_markup(value)
            .replace("&apos;", "\\'")
            .replace("&quot;", "\\\""),
        FileKind::Gradle => value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$"),
    }
}

fn escape_markup(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn write_google_services(
    workspace: &Path,
    snapshot: &ConfigSnapshot,
    report: &mut CustomizeReport,
) -> Result<(), CustomizeError> {
    let firebase = &snapshot.firebase;
    if !firebase.enabled {
        return Ok(());
    }
    let Some(ref services) = firebase.google_services else {
        report
            .warnings
            .push("Firebase is enabled but no google-services.json was provided".to_string());
        return Ok(());
    };

    let path = workspace.join(GOOGLE_SERVICES_PATH);
    let mut body = serde_json::to_string_pretty(services).map_err(|source| {
        CustomizeError::Serialize {
            path: path.clone(),
            source,
        }
    })?;
    body.push('\n');

    write_file(&path, body.as_bytes())?;
    report.written.push(PathBuf::from(GOOGLE_SERVICES_PATH));
    Ok(())
}

fn copy_asset(
    workspace: &Path,
    source: Option<&str>,
    target: &str,
    label: &str,
    report: &mut CustomizeReport,
) -> Result<(), CustomizeError> {
    let Some(source) = source.filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let bytes = match fs::read(source) {
        Ok(bytes) => bytes,
        Err(e) => {
            report
                .warnings
                .push(format!("Could not read {label} asset {source}: {e}"));
            return Ok(());
        }
    };
    write_file(&workspace.join(target), &bytes)?;
    report.written.push(PathBuf::from(target));
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), CustomizeError> {
    let io_err = |source| CustomizeError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, bytes).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::snapshot::{AttributionSettings, FeatureFlags, FirebaseSettings};

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            app_name: "Tom's \"Shop\" & Co".to_string(),
            website_url: "https://shop.example.com/?a=1&b=2".to_string(),
            package_id: Some("com.example.shop".to_string()),
            features: FeatureFlags {
                pull_to_refresh: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn values() -> TemplateValues {
        TemplateValues::from_snapshot(&snapshot()).unwrap()
    }

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("www")).unwrap();
        fs::create_dir_all(root.join("android/app/src/main/res/values")).unwrap();
        fs::write(
            root.join("capacitor.config.json"),
            r#"{"appId":"{{PACKAGE_ID}}","appName":"{{APP_NAME}}","server":{"url":"{{WEBSITE_URL}}"}}"#,
        )
        .unwrap();
        fs::write(
            root.join("www/index.html"),
            "<title>{{APP_NAME}}</title>\n{{#ATTRIBUTION}}<script>init('{{ATTRIBUTION_DEV_KEY}}')</script>{{/ATTRIBUTION}}\n",
        )
        .unwrap();
        fs::write(
            root.join("android/app/src/main/res/values/strings.xml"),
            "<resources><string name=\"app_name\">{{APP_NAME}}</string></resources>\n",
        )
        .unwrap();
        fs::write(
            root.join("android/app/build.gradle"),
            "applicationId \"{{PACKAGE_ID}}\"\nversionCode {{VERSION_CODE}}\nversionName \"{{VERSION_NAME}}\"\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn escapes_per_file_kind() {
        let value = "Tom's \"Shop\" & <Co> $x";
        assert_eq!(escape(FileKind::Json, value), r#"Tom's \"Shop\" & <Co> $x"#);
        assert_eq!(
            escape(FileKind::Xml, value),
            "Tom&apos;s &quot;Shop&quot; &amp; &lt;Co&gt; $x"
        );
        assert_eq!(
            escape(FileKind::AndroidStrings, value),
            "Tom\\'s \\\"Shop\\\" &amp; &lt;Co&gt; $x"
        );
        assert_eq!(escape(FileKind::Gradle, value), "Tom's \\\"Shop\\\" & <Co> \\$x");
    }

    #[test]
    fn blocks_follow_flags() {
        let rendered = render(
            "a{{#PULL_TO_REFRESH}}[ptr]{{/PULL_TO_REFRESH}}b{{#FIREBASE}}[fb]{{/FIREBASE}}c",
            FileKind::Html,
            &values(),
            Path::new("www/index.html"),
        )
        .unwrap();
        assert_eq!(rendered, "a[ptr]bc");
    }

    #[test]
    fn nested_blocks_resolve() {
        let rendered = render(
            "{{#PULL_TO_REFRESH}}x{{#FIREBASE}}y{{/FIREBASE}}z{{/PULL_TO_REFRESH}}",
            FileKind::Html,
            &values(),
            Path::new("www/index.html"),
        )
        .unwrap();
        assert_eq!(rendered, "xz");
    }

    #[test]
    fn disabled_attribution_leaves_no_token() {
        let rendered = render(
            "key={{ATTRIBUTION_DEV_KEY}};",
            FileKind::Html,
            &values(),
            Path::new("www/index.html"),
        )
        .unwrap();
        assert_eq!(rendered, "key=;");
    }

    #[test]
    fn unknown_token_names_file_and_token() {
        let err = render(
            "{{APP_NAME}} {{MYSTERY}}",
            FileKind::Html,
            &values(),
            Path::new("www/index.html"),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("{{MYSTERY}}"), "{msg}");
        assert!(msg.contains("www/index.html"), "{msg}");
    }

    #[test]
    fn unbalanced_and_unknown_blocks_fail() {
        let file = Path::new("www/index.html");
        assert!(matches!(
            render("{{#FIREBASE}}open", FileKind::Html, &values(), file),
            Err(CustomizeError::UnbalancedBlock { .. })
        ));
        assert!(matches!(
            render("{{#NOPE}}x{{/NOPE}}", FileKind::Html, &values(), file),
            Err(CustomizeError::UnknownBlock { .. })
        ));
        assert!(matches!(
            render("stray {{/FIREBASE}}", FileKind::Html, &values(), file),
            Err(CustomizeError::UnresolvedToken { .. })
        ));
    }

    #[test]
    fn lowercase_braces_are_not_placeholders() {
        let content = "<script>const t = `{{ user }}`; x = \"${{name}}\";</script>";
        let rendered = render(content, FileKind::Html, &values(), Path::new("www/index.html"));
        assert_eq!(rendered.unwrap(), content);
    }

    #[test]
    fn missing_package_id_is_reported() {
        let mut snap = snapshot();
        snap.package_id = None;
        assert!(matches!(
            TemplateValues::from_snapshot(&snap),
            Err(CustomizeError::MissingValue("packageId"))
        ));
    }

    #[test]
    fn customizes_known_files() {
        let ws = workspace();
        let report = customize_blocking(ws.path(), &snapshot()).unwrap();

        assert_eq!(report.rewritten.len(), 4);
        assert_eq!(report.skipped, vec![PathBuf::from("ios/App/App/Info.plist")]);

        let config: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(ws.path().join("capacitor.config.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(config["appName"], "Tom's \"Shop\" & Co");
        assert_eq!(config["server"]["url"], "https://shop.example.com/?a=1&b=2");

        let gradle = fs::read_to_string(ws.path().join("android/app/build.gradle")).unwrap();
        assert!(gradle.contains("applicationId \"com.example.shop\""));
        assert!(gradle.contains("versionCode 1\n"));

        let html = fs::read_to_string(ws.path().join("www/index.html")).unwrap();
        assert!(!html.contains("script"));
    }

    #[test]
    fn customization_is_idempotent() {
        let ws = workspace();
        let mut snap = snapshot();
        snap.attribution = AttributionSettings {
            enabled: true,
            dev_key: Some("dev-123".to_string()),
            apple_app_id: None,
        };

        customize_blocking(ws.path(), &snap).unwrap();
        let first: Vec<String> = KNOWN_FILES
            .iter()
            .filter_map(|(f, _)| fs::read_to_string(ws.path().join(f)).ok())
            .collect();

        let second_report = customize_blocking(ws.path(), &snap).unwrap();
        let second: Vec<String> = KNOWN_FILES
            .iter()
            .filter_map(|(f, _)| fs::read_to_string(ws.path().join(f)).ok())
            .collect();

        assert_eq!(first, second);
        assert!(second_report.rewritten.is_empty());
        assert!(first[1].contains("init('dev-123')"));
    }

    #[test]
    fn firebase_and_assets_are_written() {
        let ws = workspace();
        let assets = tempfile::tempdir().unwrap();
        let icon = assets.path().join("icon.png");
        fs::write(&icon, b"\x89PNG icon").unwrap();

        let mut snap = snapshot();
        snap.firebase = FirebaseSettings {
            enabled: true,
            project_id: Some("shop-prod".to_string()),
            google_services: Some(serde_json::json!({"project_info": {"project_id": "shop-prod"}})),
        };
        snap.icon_path = Some(icon.to_string_lossy().into_owned());
        snap.splash_path = Some(assets.path().join("missing.png").to_string_lossy().into_owned());

        let report = customize_blocking(ws.path(), &snap).unwrap();

        let services: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(ws.path().join(GOOGLE_SERVICES_PATH)).unwrap(),
        )
        .unwrap();
        assert_eq!(services["project_info"]["project_id"], "shop-prod");
        assert_eq!(fs::read(ws.path().join(ICON_PATH)).unwrap(), b"\x89PNG icon");
        assert!(!ws.path().join(SPLASH_PATH).exists());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("splash"));
    }
}
