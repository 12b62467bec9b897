use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{error, info, warn};

use geoanomaly_core::{PipelineError, SeriesKey, TaskDescriptor, TaskStatus};
use geoanomaly_queue::{codec, ClaimKey};

use crate::partition::partition;
use crate::scheduler::plan::plan_sweep;
use crate::scheduler::to_chrono;
use crate::scheduler::types::{SeriesActivity, SweepReport};

use super::Scheduler;

impl Scheduler {
    /// Run one sweep under the sweep lease.
    ///
    /// A sweep started while another holds the lease returns a report with
    /// `ran == false`. Store reads all happen before the first submission,
    /// so a failing store aborts the sweep without scheduling anything.
    pub async fn sweep(&self) -> Result<SweepReport, PipelineError> {
        let cache = &self.backends.cache;
        let lease = ClaimKey::SweepLease;
        if !cache
            .try_claim(&lease, &self.instance_id, self.config.sweep_lease())
            .await?
        {
            info!("Sweep lease held by another sweep, skipping");
            if let Ok(mut m) = self.metrics.write() {
                m.sweeps_skipped += 1;
            }
            return Ok(SweepReport::default());
        }

        let started = Instant::now();
        let result = self.sweep_locked().await;

        if let Err(e) = cache.release(&lease, &self.instance_id).await {
            warn!(error = %e, "Failed to release sweep lease");
        }

        match &result {
            Ok(report) => {
                if let Ok(mut m) = self.metrics.write() {
                    m.record_sweep(started.elapsed());
                }
                info!(
                    series = report.series_seen,
                    planned = report.planned,
                    submitted = report.submitted,
                    duplicates = report.duplicates,
                    previously_failed = report.previously_failed,
                    stalled = report.stalled_recovered,
                    submit_errors = report.submit_errors,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Sweep complete"
                );
            }
            Err(e) => {
                if let Ok(mut m) = self.metrics.write() {
                    m.sweeps_aborted += 1;
                }
                warn!(error = %e, "Sweep aborted");
            }
        }
        result
    }

    async fn sweep_locked(&self) -> Result<SweepReport, PipelineError> {
        let activity = self.series_activity().await?;
        let marks = self.backends.ledger.evaluation_marks().await?;
        let now = self.backends.clock.now();
        let plan = plan_sweep(
            &activity,
            &marks,
            now,
            to_chrono(self.pipeline.reevaluation_interval()),
        );

        let mut report = SweepReport {
            ran: true,
            series_seen: activity.len(),
            planned: plan.len(),
            ..SweepReport::default()
        };
        report.stalled_recovered = self.recover_stalled().await?;

        for task in &plan {
            self.submit_into(&task.descriptor, &mut report).await;
        }
        Ok(report)
    }

    /// Submit one planned task and record the result. A refused submission
    /// is logged and counted; it does not stop the remaining series.
    pub(super) async fn submit_into(&self, descriptor: &TaskDescriptor, report: &mut SweepReport) {
        match self.submit(descriptor).await {
            Ok(submission) => report.record(&descriptor.task_id, submission),
            Err(e) => {
                error!(
                    task_id = %descriptor.task_id,
                    series = %descriptor.series_key,
                    error = %e,
                    "Submission failed, series left for the next sweep"
                );
                report.submit_errors += 1;
                if let Ok(mut m) = self.metrics.write() {
                    m.submit_errors += 1;
                }
            }
        }
    }

    /// Latest timestamp of every series the stores know about.
    pub(super) async fn series_activity(&self) -> Result<Vec<SeriesActivity>, PipelineError> {
        if !self.partition.spatial_grouping {
            let entities = self.backends.observations.entity_activity().await?;
            return Ok(entities
                .into_iter()
                .map(|e| SeriesActivity {
                    key: SeriesKey::entity(e.entity_id),
                    latest_timestamp: e.latest_timestamp,
                })
                .collect());
        }

        let observations = self
            .backends
            .observations
            .fetch_observations(None, None, None)
            .await?;
        Ok(partition(observations, &self.partition)
            .summaries()
            .into_iter()
            .map(|s| SeriesActivity {
                key: s.key,
                latest_timestamp: s.latest_timestamp,
            })
            .collect())
    }

    /// Reset RUNNING tasks older than the stall timeout to PENDING and put
    /// them back on the queue. Returns how many were recovered.
    pub async fn recover_stalled(&self) -> Result<usize, PipelineError> {
        let cache = &self.backends.cache;
        let now = self.backends.clock.now();
        let timeout = to_chrono(self.config.stall_timeout());

        let mut recovered = 0;
        for stalled in cache.snapshot().await? {
            if !stalled.is_stalled(now, timeout) {
                continue;
            }
            let mut state = stalled.clone();
            warn!(
                task_id = %state.task_id(),
                series = %state.descriptor.series_key,
                attempt = state.attempt_count,
                started_at = ?state.started_at,
                "Recovering stalled task"
            );
            state.status = TaskStatus::Pending;
            state.started_at = None;
            state.last_error = Some("stalled: worker stopped reporting".to_string());
            state.updated_at = now;
            cache.set_status(&state).await?;

            // A duplicate here means the broker still holds the message and
            // will redeliver it once its visibility timeout lapses.
            let payload = codec::encode(&state.descriptor)?;
            if let Err(e) = self.backends.queue.submit(state.task_id(), payload).await {
                // Left RUNNING so the next sweep tries again.
                warn!(task_id = %state.task_id(), error = %e, "Stalled task resubmission failed");
                cache.set_status(&stalled).await?;
                continue;
            }
            recovered += 1;
        }

        if recovered > 0 {
            if let Ok(mut m) = self.metrics.write() {
                m.stalled_recovered += recovered as u64;
            }
        }
        Ok(recovered)
    }

    /// Run sweeps every `sweep_interval` until shutdown is signaled.
    pub async fn run(&self) {
        info!(
            instance = %self.instance_id,
            interval_secs = self.config.sweep_interval_secs,
            reevaluation_secs = self.pipeline.reevaluation_interval_secs,
            "Scheduler starting"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Sweep failed, retrying next tick");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval()) => {}
                _ = self.wake.notified() => {}
            }
        }

        info!("Scheduler stopped");
    }
}
