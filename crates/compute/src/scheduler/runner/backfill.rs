use chrono::{DateTime, Duration, Utc};
use tracing::info;

use geoanomaly_core::{EvaluationWindow, PipelineError, TaskDescriptor};

use crate::scheduler::plan::backfill_boundaries;
use crate::scheduler::types::SweepReport;

use super::Scheduler;

impl Scheduler {
    /// Re-score history: one task per series and step boundary in
    /// `(from, until]`, each window starting at the previous boundary.
    ///
    /// Submissions go through the regular dedup path, so a backfill that
    /// overlaps a sweep does not double-submit. Refused submissions are
    /// counted in `submit_errors` and the backfill carries on.
    pub async fn backfill(
        &self,
        entity_id: Option<&str>,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        step: Duration,
    ) -> Result<SweepReport, PipelineError> {
        if step <= Duration::zero() {
            return Err(PipelineError::Config("backfill step must be positive".into()));
        }
        let boundaries = backfill_boundaries(from, until, step);

        let mut series = self.series_activity().await?;
        if let Some(entity) = entity_id {
            series.retain(|s| s.key.entity_id == entity);
        }
        series.sort_by(|a, b| a.key.cmp(&b.key));

        let mut report = SweepReport {
            ran: true,
            series_seen: series.len(),
            ..SweepReport::default()
        };

        for activity in &series {
            let mut start = from;
            for &as_of in &boundaries {
                let descriptor = TaskDescriptor::new(
                    activity.key.clone(),
                    EvaluationWindow {
                        start: Some(start),
                        as_of,
                    },
                );
                report.planned += 1;
                self.submit_into(&descriptor, &mut report).await;
                start = as_of;
            }
        }

        info!(
            series = report.series_seen,
            planned = report.planned,
            submitted = report.submitted,
            duplicates = report.duplicates,
            submit_errors = report.submit_errors,
            %from,
            %until,
            "Backfill submitted"
        );
        Ok(report)
    }
}
