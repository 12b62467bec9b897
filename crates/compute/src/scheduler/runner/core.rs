use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use geoanomaly_core::config::{PipelineConfig, SchedulerConfig};
use geoanomaly_core::{PipelineError, TaskDescriptor, TaskId, TaskState, TaskStatus};
use geoanomaly_queue::{codec, ClaimKey, SubmitOutcome};

use crate::backends::Backends;
use crate::metrics::SchedulerMetrics;
use crate::partition::PartitionConfig;
use crate::scheduler::types::{Submission, SweepProgress, SweepReport, SystemStatus};

/// The job scheduler. Plans due series, submits deterministic task IDs to
/// the queue and guards every submission with a result-cache claim.
pub struct Scheduler {
    pub(super) backends: Backends,
    pub(super) pipeline: PipelineConfig,
    pub(super) config: SchedulerConfig,
    pub(super) partition: PartitionConfig,
    /// Holder name for cache claims taken by this instance.
    pub(super) instance_id: String,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    pub(super) shutdown: Arc<AtomicBool>,
    pub(super) wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        backends: Backends,
        pipeline: PipelineConfig,
        config: SchedulerConfig,
    ) -> Result<Self, PipelineError> {
        pipeline.validate()?;
        Ok(Self {
            backends,
            partition: PartitionConfig::from(&pipeline),
            pipeline,
            config,
            instance_id: format!("scheduler-{}", uuid::Uuid::new_v4()),
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Submit one task unless it failed before or is already in flight.
    ///
    /// The submission claim lives for the dedup window. A status that is
    /// terminal (or absent) is reset to PENDING before the queue sees the
    /// task, so a worker never mistakes a re-score for a stale redelivery.
    pub async fn submit(&self, descriptor: &TaskDescriptor) -> Result<Submission, PipelineError> {
        let cache = &self.backends.cache;
        let task_id = &descriptor.task_id;

        let previous = cache.get_status(task_id).await?;
        if previous
            .as_ref()
            .is_some_and(|s| s.status == TaskStatus::Failed)
        {
            debug!(task_id = %task_id, series = %descriptor.series_key, "Not resubmitting failed task");
            if let Ok(mut m) = self.metrics.write() {
                m.previously_failed += 1;
            }
            return Ok(Submission::PreviouslyFailed);
        }

        let claim = ClaimKey::Submission(task_id.clone());
        if !cache
            .try_claim(&claim, &self.instance_id, self.config.dedup_window())
            .await?
        {
            return self.reject_duplicate(task_id).await;
        }

        let overwrite = previous.as_ref().is_none_or(|s| s.status.is_terminal());
        if overwrite {
            let mut pending = TaskState::pending(descriptor.clone(), self.backends.clock.now());
            if let Some(prev) = &previous {
                pending.duplicate_submissions = prev.duplicate_submissions;
            }
            cache.set_status(&pending).await?;
        }

        let payload = codec::encode(descriptor)?;
        match self.backends.queue.submit(task_id, payload).await {
            Ok(SubmitOutcome::Accepted) => {
                debug!(task_id = %task_id, series = %descriptor.series_key, "Task submitted");
                if let Ok(mut m) = self.metrics.write() {
                    m.tasks_submitted += 1;
                }
                Ok(Submission::Accepted)
            }
            Ok(SubmitOutcome::Duplicate) => {
                if let (true, Some(prev)) = (overwrite, &previous) {
                    cache.set_status(prev).await?;
                }
                self.reject_duplicate(task_id).await
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Queue rejected submission");
                if let Err(release) = cache.release(&claim, &self.instance_id).await {
                    warn!(task_id = %task_id, error = %release, "Failed to release submission claim");
                }
                if let (true, Some(prev)) = (overwrite, &previous) {
                    cache.set_status(prev).await?;
                }
                Err(e.into())
            }
        }
    }

    async fn reject_duplicate(&self, task_id: &TaskId) -> Result<Submission, PipelineError> {
        debug!(task_id = %task_id, "{}", PipelineError::DuplicateTask(task_id.to_string()));
        self.backends.cache.note_duplicate(task_id).await?;
        if let Ok(mut m) = self.metrics.write() {
            m.duplicates_rejected += 1;
        }
        Ok(Submission::Duplicate)
    }

    /// Remove a task no worker has claimed yet and mark it SKIPPED.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<bool, PipelineError> {
        let removed = self.backends.queue.cancel(task_id).await?;
        if !removed {
            debug!(task_id = %task_id, "Task not cancellable (claimed or unknown)");
            return Ok(false);
        }

        let cache = &self.backends.cache;
        cache
            .release(&ClaimKey::Submission(task_id.clone()), &self.instance_id)
            .await?;
        if let Some(mut state) = cache.get_status(task_id).await? {
            state.status = TaskStatus::Skipped;
            state.last_error = Some("cancelled".to_string());
            state.updated_at = self.backends.clock.now();
            cache.set_status(&state).await?;
        }
        info!(task_id = %task_id, "Task cancelled");
        Ok(true)
    }

    /// Current status breakdown of the tasks a sweep or backfill touched.
    pub async fn progress(&self, report: &SweepReport) -> Result<SweepProgress, PipelineError> {
        let mut statuses = Vec::with_capacity(report.task_ids.len());
        for task_id in &report.task_ids {
            let state = self.backends.cache.get_status(task_id).await?;
            statuses.push(state.map(|s| s.status));
        }
        Ok(SweepProgress::from_statuses(statuses))
    }

    /// Cached task states, optionally filtered by status.
    pub async fn tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskState>, PipelineError> {
        let states = self.backends.cache.snapshot().await?;
        Ok(states
            .into_iter()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .collect())
    }

    /// Queue health, dead-letter depth and a status breakdown of every
    /// cached task.
    pub async fn status(&self) -> Result<SystemStatus, PipelineError> {
        let queue = self.backends.queue.health_check().await?;
        let dead_letters = self.backends.queue.dlq_depth().await?;
        let states = self.backends.cache.snapshot().await?;
        Ok(SystemStatus {
            queue,
            dead_letters,
            tasks: SweepProgress::from_statuses(states.iter().map(|s| Some(s.status))),
        })
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Signal the scheduler to stop after the current sweep.
    pub fn shutdown(&self) {
        info!("Scheduler shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    /// Get an Arc to the shutdown flag (for external shutdown signaling).
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}
