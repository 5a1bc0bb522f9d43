//! Failure classification for native tool output.
//!
//! Gradle and xcodebuild bury the useful line deep in a wall of output. This
//! module pulls that line out, classifies the failure, and ranks failures so
//! a job that fails on every platform reports the most actionable one.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::job::Platform;

static ERROR_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(e: |error: |error:|fatal error:|failure: |npm err!|\*\* build failed \*\*|execution failed for task|could not resolve|.*: error: )",
    )
    .unwrap()
});
static WHAT_WENT_WRONG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\s*What went wrong:").unwrap());

/// Maximum length of an extracted headline.
const MAX_HEADLINE: usize = 300;

/// Pull the most actionable line out of tool output.
///
/// Gradle's `* What went wrong:` block wins, then the first line that looks
/// like a compiler or tool error.
pub fn extract_error_line(output: &str) -> Option<String> {
    let lines: Vec<&str> = output.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        if WHAT_WENT_WRONG_REGEX.is_match(line.trim()) {
            if let Some(next) = lines[i + 1..].iter().find(|l| !l.trim().is_empty()) {
                return Some(headline(next));
            }
        }
    }

    lines
        .iter()
        .find(|line| ERROR_LINE_REGEX.is_match(line))
        .map(|line| headline(line))
}

fn headline(line: &str) -> String {
    let line = line.trim();
    if line.len() <= MAX_HEADLINE {
        return line.to_string();
    }
    let mut end = MAX_HEADLINE;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

/// Classify error category from text.
pub fn classify_category(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    if lower.contains("not available") || lower.contains("requires macos") {
        "unavailable"
    } else if lower.contains("failed to start") || lower.contains("no such file or directory") {
        "tool_missing"
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "timeout"
    } else if lower.contains("signing") || lower.contains("provisioning") || lower.contains("keystore") {
        "signing"
    } else if lower.contains("could not resolve") || lower.contains("npm err!") {
        "dependency"
    } else if lower.contains("not found") && (lower.contains(".apk") || lower.contains(".app") || lower.contains("package")) {
        "output_missing"
    } else if lower.contains("compil")
        || lower.contains("error:")
        || lower.contains("e: ")
        || lower.contains("execution failed for task")
        || lower.contains("build failed")
    {
        "compile"
    } else {
        "runtime"
    }
}

/// Rank a category: higher is more actionable for the person reading the job.
pub fn specificity(category: &str) -> u8 {
    match category {
        "compile" | "signing" | "dependency" => 5,
        "output_missing" => 4,
        "timeout" => 3,
        "tool_missing" => 2,
        "runtime" => 1,
        _ => 0,
    }
}

/// One platform's failure, as recorded for the terminal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformFailure {
    pub platform: Platform,
    pub category: &'static str,
    pub message: String,
}

impl PlatformFailure {
    pub fn new(platform: Platform, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            platform,
            category: classify_category(&message),
            message,
        }
    }

    pub fn describe(&self) -> String {
        format!("{} build failed: {}", self.platform, self.message)
    }
}

/// Pick the failure that should become the job's `error`.
///
/// Ties keep the earlier failure, i.e. build order.
pub fn most_specific(failures: &[PlatformFailure]) -> Option<&PlatformFailure> {
    failures.iter().fold(None, |best: Option<&PlatformFailure>, f| match best {
        Some(b) if specificity(b.category) >= specificity(f.category) => Some(b),
        _ => Some(f),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRADLE_OUTPUT: &str = "\
> Task :app:compileDebugJavaWithJavac FAILED

FAILURE: Build failed with an exception.

* What went wrong:
Execution failed for task ':app:compileDebugJavaWithJavac'.
> Compilation failed; see the compiler error output for details.
";

    #[test]
    fn gradle_what_went_wrong_wins() {
        assert_eq!(
            extract_error_line(GRADLE_OUTPUT).as_deref(),
            Some("Execution failed for task ':app:compileDebugJavaWithJavac'.")
        );
    }

    #[test]
    fn falls_back_to_first_error_line() {
        let output = "Compiling...\nMainActivity.kt:12: error: unresolved reference: foo\nmore";
        assert_eq!(
            extract_error_line(output).as_deref(),
            Some("MainActivity.kt:12: error: unresolved reference: foo")
        );
        assert_eq!(extract_error_line("all good\nnothing here"), None);
    }

    #[test]
    fn long_lines_are_shortened() {
        let long = format!("error: {}", "x".repeat(1000));
        let line = extract_error_line(&long).unwrap();
        assert!(line.len() <= MAX_HEADLINE + 3);
        assert!(line.ends_with("..."));
    }

    #[test]
    fn classifies_common_failures() {
        assert_eq!(classify_category("Execution failed for task ':app:assembleDebug'"), "compile");
        assert_eq!(classify_category("Failed to start ./gradlew: No such file or directory"), "tool_missing");
        assert_eq!(classify_category("Keystore was tampered with"), "signing");
        assert_eq!(classify_category("iOS builds are not available on linux"), "unavailable");
        assert_eq!(classify_category("Build timed out after 30s"), "timeout");
        assert_eq!(classify_category("something odd"), "runtime");
    }

    #[test]
    fn native_tool_error_beats_generic_one() {
        let failures = vec![
            PlatformFailure::new(Platform::Android, "./gradlew assembleDebug failed: Execution failed for task ':app:mergeDebugResources'"),
            PlatformFailure::new(Platform::Ios, "iOS builds require macOS with Xcode; not available on linux"),
        ];
        let best = most_specific(&failures).unwrap();
        assert_eq!(best.platform, Platform::Android);

        let reversed: Vec<_> = failures.into_iter().rev().collect();
        assert_eq!(most_specific(&reversed).unwrap().platform, Platform::Android);
    }

    #[test]
    fn ties_keep_build_order() {
        let failures = vec![
            PlatformFailure::new(Platform::Android, "error: one"),
            PlatformFailure::new(Platform::Ios, "error: two"),
        ];
        assert_eq!(most_specific(&failures).unwrap().platform, Platform::Android);
        assert!(most_specific(&[]).is_none());
    }
}
