use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::series::SeriesKey;

/// Deterministic task identifier: digest of `(series_key, as_of)`.
///
/// Re-planning the same evaluation always yields the same ID, which is what
/// makes duplicate submissions and retries idempotent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn derive(series_key: &SeriesKey, as_of: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        series_key.hash_into(&mut hasher);
        hasher.update(as_of.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
        TaskId(hex)
    }

    /// Wrap an ID read back from a cache or broker.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        TaskId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The slice of a series a task scores.
///
/// Training uses observations at or before `start`; observations in
/// `(start, as_of]` are scored. An absent `start` resolves to the
/// `min_points`-th observation of the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationWindow {
    pub start: Option<DateTime<Utc>>,
    pub as_of: DateTime<Utc>,
}

/// Immutable work item placed on the task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub series_key: SeriesKey,
    pub window: EvaluationWindow,
}

impl TaskDescriptor {
    pub fn new(series_key: SeriesKey, window: EvaluationWindow) -> Self {
        Self {
            task_id: TaskId::derive(&series_key, window.as_of),
            series_key,
            window,
        }
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.window.as_of
    }
}

/// Lifecycle status of a task as mirrored in the result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Skipped,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses are never executed again under the same task ID.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Skipped | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Skipped => "SKIPPED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "DONE" => Ok(TaskStatus::Done),
            "SKIPPED" => Ok(TaskStatus::Skipped),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(PipelineError::Config(format!("unknown task status '{other}'"))),
        }
    }
}

/// Task record held by the result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub descriptor: TaskDescriptor,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Submissions rejected because this task was already in flight.
    #[serde(default)]
    pub duplicate_submissions: u32,
}

impl TaskState {
    pub fn pending(descriptor: TaskDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            descriptor,
            status: TaskStatus::Pending,
            attempt_count: 0,
            last_error: None,
            started_at: None,
            updated_at: now,
            duplicate_submissions: 0,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.descriptor.task_id
    }

    /// RUNNING for longer than `stall_timeout`.
    pub fn is_stalled(&self, now: DateTime<Utc>, stall_timeout: Duration) -> bool {
        self.status == TaskStatus::Running
            && self
                .started_at
                .is_some_and(|started| now - started > stall_timeout)
    }
}

/// Counts reported by a successful evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub scored: usize,
    pub anomalies: usize,
    pub cleared: usize,
}

/// Result of one task execution, consumed by the worker's state transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(EvaluationSummary),
    Skip(String),
    Retryable(PipelineError),
    Fatal(PipelineError),
    /// Another execution owns this task; nothing to do.
    Duplicate,
}

/// How the last evaluation of a series ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Completed,
    Skipped,
}

impl EvaluationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationOutcome::Completed => "completed",
            EvaluationOutcome::Skipped => "skipped",
        }
    }
}

/// Persisted per-series scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationMark {
    pub series_key: SeriesKey,
    pub as_of: DateTime<Utc>,
    pub window_start: Option<DateTime<Utc>>,
    pub evaluated_at: DateTime<Utc>,
    pub outcome: EvaluationOutcome,
}
