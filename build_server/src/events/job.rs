//! Job event definitions and the log entry each one produces.

use serde::{Deserialize, Serialize};

use crate::models::job::{JobStatus, LogEntry, Platform};

/// Why a running job was stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelReason {
    /// Cancellation requested by a caller.
    User,
    /// The job overran the configured wall-clock limit.
    Timeout,
    /// The engine is shutting down.
    Shutdown,
}

/// Events that can happen to a build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// Job was admitted to the queue.
    JobQueued { position: usize },
    /// A worker picked the job up.
    JobStarted { worker: usize },
    /// At least one platform produced an artifact.
    JobCompleted {
        succeeded: Vec<Platform>,
        failed: Vec<Platform>,
    },
    /// Job failed with a human-readable error.
    JobFailed { error: String },
    /// Job was cancelled, either while queued or while building.
    JobCancelled { reason: CancelReason, was_running: bool },
}

impl JobEvent {
    /// Status the job moves to when this event is applied.
    pub fn status(&self) -> JobStatus {
        match self {
            JobEvent::JobQueued { .. } => JobStatus::Queued,
            JobEvent::JobStarted { .. } => JobStatus::Building,
            JobEvent::JobCompleted { .. } => JobStatus::Completed,
            JobEvent::JobFailed { .. } => JobStatus::Failed,
            JobEvent::JobCancelled { .. } => JobStatus::Cancelled,
        }
    }

    /// Error stored on the record. Only `failed` carries one.
    pub fn error(&self) -> Option<String> {
        match self {
            JobEvent::JobFailed { error } => Some(error.clone()),
            _ => None,
        }
    }

    /// The one log entry describing this transition.
    pub fn log_entry(&self) -> LogEntry {
        match self {
            JobEvent::JobQueued { position } => {
                LogEntry::info(format!("Build queued (position {position})"))
            }
            JobEvent::JobStarted { worker } => {
                LogEntry::info(format!("Build started on worker {worker}"))
            }
            JobEvent::JobCompleted { succeeded, failed } => {
                let ok = join_platforms(succeeded);
                if failed.is_empty() {
                    LogEntry::info(format!("Build completed: {ok}"))
                } else {
                    LogEntry::warn(format!(
                        "Build completed with partial success: {ok} succeeded, {} failed",
                        join_platforms(failed)
                    ))
                }
            }
            JobEvent::JobFailed { error } => LogEntry::error(format!("Build failed: {error}")),
            JobEvent::JobCancelled {
                reason,
                was_running,
            } => {
                let phase = if *was_running { "while building" } else { "while queued" };
                let cause = match reason {
                    CancelReason::User => "by request",
                    CancelReason::Timeout => "after timeout",
                    CancelReason::Shutdown => "by engine shutdown",
                };
                LogEntry::info(format!("Build cancelled {cause} {phase}"))
            }
        }
    }
}

fn join_platforms(platforms: &[Platform]) -> String {
    platforms
        .iter()
        .map(Platform::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::LogLevel;

    #[test]
    fn events_map_to_statuses() {
        assert_eq!(JobEvent::JobQueued { position: 1 }.status(), JobStatus::Queued);
        assert_eq!(JobEvent::JobStarted { worker: 0 }.status(), JobStatus::Building);
        let completed = JobEvent::JobCompleted {
            succeeded: vec![Platform::Android],
            failed: vec![],
        };
        assert_eq!(completed.status(), JobStatus::Completed);
        assert_eq!(completed.log_entry().message, "Build completed: android");
    }

    #[test]
    fn cancellation_names_its_cause() {
        let entry = JobEvent::JobCancelled {
            reason: CancelReason::Shutdown,
            was_running: true,
        }
        .log_entry();
        assert_eq!(entry.message, "Build cancelled by engine shutdown while building");
        assert_eq!(entry.level, LogLevel::Info);
    }

    #[test]
    fn only_failed_carries_error() {
        let failed = JobEvent::JobFailed {
            error: "gradle exited 1".into(),
        };
        assert_eq!(failed.error().as_deref(), Some("gradle exited 1"));
        let cancelled = JobEvent::JobCancelled {
            reason: CancelReason::User,
            was_running: true,
        };
        assert_eq!(cancelled.error(), None);
        assert_eq!(cancelled.status(), JobStatus::Cancelled);
    }

    #[test]
    fn partial_success_logs_a_warning() {
        let entry = JobEvent::JobCompleted {
            succeeded: vec![Platform::Android],
            failed: vec![Platform::Ios],
        }
        .log_entry();
        assert_eq!(entry.level, LogLevel::Warn);
        assert!(entry.message.contains("android succeeded"));
        assert!(entry.message.contains("ios failed"));
    }
}
