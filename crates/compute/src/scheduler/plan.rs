//! Sweep planning: which series are due and which window each task scores.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use geoanomaly_core::{EvaluationMark, EvaluationOutcome, EvaluationWindow, SeriesKey, TaskDescriptor};

use super::types::{PlanReason, PlannedTask, SeriesActivity};

/// Decide the tasks for one sweep. Pure; output is sorted by series key.
///
/// A series with no mark is due with an open window. A marked series is due
/// once `interval` has passed since its last evaluation. New data extends
/// the window from the last completed `as_of` (or from the previous start
/// when the last run was skipped); no new data scores the same window again,
/// which yields the same task ID.
pub fn plan_sweep(
    activity: &[SeriesActivity],
    marks: &[EvaluationMark],
    now: DateTime<Utc>,
    interval: Duration,
) -> Vec<PlannedTask> {
    let marks: HashMap<&SeriesKey, &EvaluationMark> =
        marks.iter().map(|m| (&m.series_key, m)).collect();

    let mut planned: Vec<PlannedTask> = activity
        .iter()
        .filter_map(|series| {
            let latest = series.latest_timestamp;
            let (window, reason) = match marks.get(&series.key) {
                None => (
                    EvaluationWindow { start: None, as_of: latest },
                    PlanReason::NeverEvaluated,
                ),
                Some(mark) if now - mark.evaluated_at < interval => return None,
                Some(mark) if latest > mark.as_of => {
                    let start = match mark.outcome {
                        EvaluationOutcome::Completed => Some(mark.as_of),
                        EvaluationOutcome::Skipped => mark.window_start,
                    };
                    (EvaluationWindow { start, as_of: latest }, PlanReason::NewData)
                }
                Some(mark) => (
                    EvaluationWindow {
                        start: mark.window_start,
                        as_of: mark.as_of,
                    },
                    PlanReason::Rescore,
                ),
            };
            Some(PlannedTask {
                descriptor: TaskDescriptor::new(series.key.clone(), window),
                reason,
            })
        })
        .collect();

    planned.sort_by(|a, b| a.descriptor.series_key.cmp(&b.descriptor.series_key));
    planned
}

/// Step boundaries in `(from, until]`, always ending at `until`.
pub fn backfill_boundaries(
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    step: Duration,
) -> Vec<DateTime<Utc>> {
    let mut boundaries = Vec::new();
    if until <= from || step <= Duration::zero() {
        return boundaries;
    }
    let mut at = from + step;
    while at < until {
        boundaries.push(at);
        at += step;
    }
    boundaries.push(until);
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use geoanomaly_core::TaskId;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn activity(entity: &str, latest: u32) -> SeriesActivity {
        SeriesActivity {
            key: SeriesKey::entity(entity),
            latest_timestamp: ts(latest),
        }
    }

    fn mark(entity: &str, as_of: u32, evaluated: u32, outcome: EvaluationOutcome) -> EvaluationMark {
        EvaluationMark {
            series_key: SeriesKey::entity(entity),
            as_of: ts(as_of),
            window_start: Some(ts(as_of - 1)),
            evaluated_at: ts(evaluated),
            outcome,
        }
    }

    #[test]
    fn never_evaluated_series_is_due_with_open_window() {
        let plan = plan_sweep(&[activity("E1", 4)], &[], ts(5), Duration::days(1));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].reason, PlanReason::NeverEvaluated);
        assert_eq!(plan[0].descriptor.window, EvaluationWindow { start: None, as_of: ts(4) });
        assert_eq!(
            plan[0].descriptor.task_id,
            TaskId::derive(&SeriesKey::entity("E1"), ts(4))
        );
    }

    #[test]
    fn recently_evaluated_series_is_not_due() {
        let marks = [mark("E1", 4, 5, EvaluationOutcome::Completed)];
        let now = ts(5) + Duration::hours(23);
        assert!(plan_sweep(&[activity("E1", 6)], &marks, now, Duration::days(1)).is_empty());
    }

    #[test]
    fn interval_boundary_is_due() {
        let marks = [mark("E1", 4, 5, EvaluationOutcome::Completed)];
        let plan = plan_sweep(&[activity("E1", 6)], &marks, ts(6), Duration::days(1));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].reason, PlanReason::NewData);
        assert_eq!(
            plan[0].descriptor.window,
            EvaluationWindow { start: Some(ts(4)), as_of: ts(6) }
        );
    }

    #[test]
    fn skipped_series_keeps_its_previous_start() {
        let marks = [mark("E1", 4, 5, EvaluationOutcome::Skipped)];
        let plan = plan_sweep(&[activity("E1", 8)], &marks, ts(9), Duration::days(1));
        assert_eq!(plan[0].descriptor.window.start, Some(ts(3)));
        assert_eq!(plan[0].descriptor.window.as_of, ts(8));
    }

    #[test]
    fn no_new_data_rescores_the_same_task() {
        let marks = [mark("E1", 4, 5, EvaluationOutcome::Completed)];
        let plan = plan_sweep(&[activity("E1", 4)], &marks, ts(9), Duration::days(1));
        assert_eq!(plan[0].reason, PlanReason::Rescore);
        assert_eq!(
            plan[0].descriptor.task_id,
            TaskId::derive(&SeriesKey::entity("E1"), ts(4))
        );
    }

    #[test]
    fn plan_is_sorted_by_series_key() {
        let plan = plan_sweep(
            &[activity("E3", 4), activity("E1", 4), activity("E2", 4)],
            &[],
            ts(5),
            Duration::days(1),
        );
        let keys: Vec<String> = plan.iter().map(|p| p.descriptor.series_key.to_string()).collect();
        assert_eq!(keys, vec!["E1", "E2", "E3"]);
    }

    #[test]
    fn backfill_boundaries_end_at_until() {
        assert_eq!(
            backfill_boundaries(ts(1), ts(4), Duration::days(1)),
            vec![ts(2), ts(3), ts(4)]
        );
        assert_eq!(
            backfill_boundaries(ts(1), ts(4), Duration::days(2)),
            vec![ts(3), ts(4)]
        );
        assert!(backfill_boundaries(ts(4), ts(4), Duration::days(1)).is_empty());
        assert!(backfill_boundaries(ts(1), ts(4), Duration::zero()).is_empty());
    }
}
