//! Periodic job scheduler for series evaluations.
//!
//! A sweep finds series that are due (never evaluated, or last evaluated
//! more than `reevaluation_interval` ago), plans one task per series with a
//! deterministic ID and submits it through the result-cache dedup claim.
//! Only one sweep runs at a time; the sweep lease makes overlapping sweeps
//! no-ops.

pub mod plan;
pub mod retry;
pub mod runner;
pub mod types;

pub use plan::{backfill_boundaries, plan_sweep};
pub use retry::RetryPolicy;
pub use runner::Scheduler;
pub use types::{
    EvaluationState, PlanReason, PlannedTask, SeriesActivity, Submission, SweepProgress,
    SweepReport, SystemStatus,
};

/// Config durations are `std`; task timestamps are `chrono`.
pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
