use chrono::{DateTime, Utc};
use serde::Serialize;

use geoanomaly_core::{SeriesKey, TaskDescriptor, TaskId, TaskStatus};
use geoanomaly_queue::QueueHealth;

/// Lifecycle of one series evaluation as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationState {
    Due,
    Submitted,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl From<TaskStatus> for EvaluationState {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => EvaluationState::Submitted,
            TaskStatus::Running => EvaluationState::Running,
            TaskStatus::Done => EvaluationState::Completed,
            TaskStatus::Skipped => EvaluationState::Skipped,
            TaskStatus::Failed => EvaluationState::Failed,
        }
    }
}

/// Newest data point known for a series at sweep time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesActivity {
    pub key: SeriesKey,
    pub latest_timestamp: DateTime<Utc>,
}

/// Why a series was planned in a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    NeverEvaluated,
    NewData,
    /// Interval elapsed with no new data; the previous window is scored again.
    Rescore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTask {
    pub descriptor: TaskDescriptor,
    pub reason: PlanReason,
}

/// What happened to one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Submission {
    Accepted,
    /// Same task ID already submitted within the dedup window.
    Duplicate,
    /// The task ID ended FAILED and is not retried.
    PreviouslyFailed,
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// False when another sweep held the lease.
    pub ran: bool,
    pub series_seen: usize,
    pub planned: usize,
    pub submitted: usize,
    pub duplicates: usize,
    pub previously_failed: usize,
    pub stalled_recovered: usize,
    /// Submissions the queue or cache refused; retried next sweep.
    pub submit_errors: usize,
    pub task_ids: Vec<TaskId>,
}

impl SweepReport {
    pub(crate) fn record(&mut self, task_id: &TaskId, submission: Submission) {
        match submission {
            Submission::Accepted => self.submitted += 1,
            Submission::Duplicate => self.duplicates += 1,
            Submission::PreviouslyFailed => self.previously_failed += 1,
        }
        self.task_ids.push(task_id.clone());
    }
}

/// Status breakdown of the tasks of one sweep or backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SweepProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    /// (done + skipped) / total, 0 when empty.
    pub success_ratio: f64,
}

impl SweepProgress {
    pub fn from_statuses(statuses: impl IntoIterator<Item = Option<TaskStatus>>) -> Self {
        let mut progress = SweepProgress::default();
        for status in statuses {
            progress.total += 1;
            match status {
                // Expired or never written counts as outstanding.
                None | Some(TaskStatus::Pending) => progress.pending += 1,
                Some(TaskStatus::Running) => progress.running += 1,
                Some(TaskStatus::Done) => progress.done += 1,
                Some(TaskStatus::Skipped) => progress.skipped += 1,
                Some(TaskStatus::Failed) => progress.failed += 1,
            }
        }
        if progress.total > 0 {
            progress.success_ratio =
                (progress.done + progress.skipped) as f64 / progress.total as f64;
        }
        progress
    }

    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

/// Operator view of the queue and the cached task states.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub queue: QueueHealth,
    /// Messages parked in the dead-letter queue, when one is configured.
    pub dead_letters: Option<u64>,
    pub tasks: SweepProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_counts_and_ratio() {
        let p = SweepProgress::from_statuses([
            Some(TaskStatus::Done),
            Some(TaskStatus::Skipped),
            Some(TaskStatus::Failed),
            None,
        ]);
        assert_eq!(p.total, 4);
        assert_eq!(p.pending, 1);
        assert_eq!(p.failed, 1);
        assert_eq!(p.success_ratio, 0.5);
        assert!(!p.is_settled());
    }

    #[test]
    fn empty_progress_has_zero_ratio() {
        let p = SweepProgress::from_statuses(std::iter::empty());
        assert_eq!(p.success_ratio, 0.0);
        assert!(p.is_settled());
    }

    #[test]
    fn status_maps_to_lifecycle() {
        assert_eq!(EvaluationState::from(TaskStatus::Pending), EvaluationState::Submitted);
        assert_eq!(EvaluationState::from(TaskStatus::Done), EvaluationState::Completed);
        assert_eq!(EvaluationState::from(TaskStatus::Failed), EvaluationState::Failed);
    }
}
