//! External tool invocation.
//!
//! Tools are spawned from explicit argv vectors, never through a shell, and
//! each one leads its own process group so cancellation can take down the
//! whole tree (Gradle daemons, npm lifecycle scripts, xcodebuild helpers).

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Captured output kept per stream, from the end.
pub const MAX_OUTPUT_BYTES: usize = 65536;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed with {}", exit_label(.code))]
    Failed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("{command} was terminated by cancellation")]
    Cancelled { command: String },

    #[error("I/O error while waiting for {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    /// Whether the tool binary itself could not be found.
    pub fn is_missing_tool(&self) -> bool {
        matches!(self, ProcessError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

/// A structured tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    /// Build from a configured argv; `None` when the argv is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self::new(program.clone()).args(rest))
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Human-readable command line for logs and error messages.
    pub fn describe(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Spawns tool processes and tears them down on cancellation.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Run to completion and return the output regardless of exit status.
    pub async fn output(
        &self,
        cmd: &ToolCommand,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ProcessError> {
        let description = cmd.describe();
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled {
                command: description,
            });
        }

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = cmd.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &cmd.envs {
            command.env(key, value);
        }
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: description.clone(),
            source,
        })?;
        let pid = child.id();

        tracing::debug!(command = %description, pid, "Spawned tool process");

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        tokio::select! {
            biased;
            result = &mut wait => {
                let output = result.map_err(|source| ProcessError::Io {
                    command: description.clone(),
                    source,
                })?;
                Ok(ToolOutput {
                    status: output.status,
                    stdout: truncate_tail(&String::from_utf8_lossy(&output.stdout), MAX_OUTPUT_BYTES),
                    stderr: truncate_tail(&String::from_utf8_lossy(&output.stderr), MAX_OUTPUT_BYTES),
                })
            }
            _ = cancel.cancelled() => {
                tracing::info!(command = %description, pid, "Terminating tool process group");
                signal_group(pid, GroupSignal::Terminate);
                if tokio::time::timeout(self.kill_grace, &mut wait).await.is_err() {
                    tracing::warn!(
                        command = %description,
                        pid,
                        grace_secs = self.kill_grace.as_secs(),
                        "Tool ignored SIGTERM, killing process group"
                    );
                    signal_group(pid, GroupSignal::Kill);
                    let _ = tokio::time::timeout(self.kill_grace, &mut wait).await;
                }
                Err(ProcessError::Cancelled { command: description })
            }
        }
    }

    /// Run to completion and fail on a non-zero exit.
    pub async fn run(
        &self,
        cmd: &ToolCommand,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ProcessError> {
        let output = self.output(cmd, cancel).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ProcessError::Failed {
                command: cmd.describe(),
                code: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    // Spawned with process_group(0): the pid is also the group id.
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        tracing::debug!(pid, signal = ?signal, "killpg failed: {e}");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) {}

/// Keep the last `max_bytes` of `text`, on a char boundary.
pub fn truncate_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...truncated...\n{}", &text[start..])
}
