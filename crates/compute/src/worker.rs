//! Worker pool: claims deliveries, runs the evaluator and applies the
//! resulting status transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use geoanomaly_core::config::{PipelineConfig, SchedulerConfig, WorkerConfig};
use geoanomaly_core::{PipelineError, TaskId, TaskOutcome, TaskState, TaskStatus};
use geoanomaly_queue::{codec, ClaimKey, Delivery};

use crate::backends::Backends;
use crate::metrics::WorkerMetrics;
use crate::pipeline::Evaluator;
use crate::scheduler::RetryPolicy;

/// What a worker did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerDisposition {
    Done,
    Skipped,
    /// Handed back to the queue with a backoff delay.
    Retrying,
    Failed,
    /// Already finished or running elsewhere; acknowledged without work.
    Duplicate,
    /// Undecodable message, dropped.
    Rejected,
}

impl WorkerDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerDisposition::Done => "done",
            WorkerDisposition::Skipped => "skipped",
            WorkerDisposition::Retrying => "retrying",
            WorkerDisposition::Failed => "failed",
            WorkerDisposition::Duplicate => "duplicate",
            WorkerDisposition::Rejected => "rejected",
        }
    }
}

pub struct WorkerPool {
    backends: Backends,
    evaluator: Arc<Evaluator>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    concurrency: usize,
    batch_size: u32,
    poll_interval: Duration,
    /// TTL of the execution claim; a claim older than this is treated as stalled.
    claim_ttl: Duration,
    worker_id: String,
    metrics: Arc<RwLock<WorkerMetrics>>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(
        backends: Backends,
        pipeline: &PipelineConfig,
        worker: &WorkerConfig,
        scheduler: &SchedulerConfig,
    ) -> Result<Self, PipelineError> {
        let evaluator = Evaluator::new(&backends, pipeline)?;
        let concurrency = worker.resolved_concurrency().max(1);
        Ok(Self {
            backends,
            evaluator: Arc::new(evaluator),
            retry: RetryPolicy::from_config(pipeline, worker),
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            batch_size: worker.batch_size.max(1),
            poll_interval: worker.poll_interval(),
            claim_ttl: scheduler.stall_timeout(),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            metrics: Arc::new(RwLock::new(WorkerMetrics::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Handle one delivery end to end and record it in the metrics.
    pub async fn process_delivery(&self, delivery: Delivery) -> WorkerDisposition {
        let started = Instant::now();
        if let Ok(mut m) = self.metrics.write() {
            m.in_flight += 1;
        }

        let disposition = self.handle(delivery).await;

        if let Ok(mut m) = self.metrics.write() {
            m.in_flight = m.in_flight.saturating_sub(1);
            m.record_execution(disposition.as_str(), started.elapsed());
        }
        disposition
    }

    async fn handle(&self, delivery: Delivery) -> WorkerDisposition {
        let descriptor = match codec::decode(&delivery.body) {
            Ok(d) => d,
            Err(e) => {
                error!(task_id = %delivery.task_id, error = %e, "Dropping undecodable task");
                if let Err(e) = self.backends.queue.nack(&delivery.task_id, false).await {
                    warn!(task_id = %delivery.task_id, error = %e, "Failed to drop message");
                }
                return WorkerDisposition::Rejected;
            }
        };
        let task_id = descriptor.task_id.clone();
        let cache = &self.backends.cache;

        let current = match cache.get_status(&task_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Result cache unavailable");
                self.requeue(&task_id, delivery.attempt).await;
                return WorkerDisposition::Retrying;
            }
        };
        if let Some(state) = current.as_ref().filter(|s| s.status.is_terminal()) {
            debug!(task_id = %task_id, status = state.status.as_str(), "Task already finished");
            self.ack(&task_id).await;
            return WorkerDisposition::Duplicate;
        }

        let claim = ClaimKey::Execution(task_id.clone());
        match cache.try_claim(&claim, &self.worker_id, self.claim_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %task_id, "{}", PipelineError::DuplicateTask(task_id.to_string()));
                self.ack(&task_id).await;
                return WorkerDisposition::Duplicate;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to claim task");
                self.requeue(&task_id, delivery.attempt).await;
                return WorkerDisposition::Retrying;
            }
        }

        let now = self.backends.clock.now();
        let mut running = current.unwrap_or_else(|| TaskState::pending(descriptor.clone(), now));
        let attempt = delivery.attempt.max(running.attempt_count + 1);
        running.status = TaskStatus::Running;
        running.attempt_count = attempt;
        running.started_at = Some(now);
        running.updated_at = now;
        if let Err(e) = cache.set_status(&running).await {
            warn!(task_id = %task_id, error = %e, "Failed to mark task running");
            self.release(&claim).await;
            self.requeue(&task_id, attempt).await;
            return WorkerDisposition::Retrying;
        }

        debug!(task_id = %task_id, series = %descriptor.series_key, attempt, "Evaluating");
        let outcome = self.evaluator.evaluate(&descriptor).await;

        let (status, last_error, disposition) = match outcome {
            TaskOutcome::Success(summary) => {
                debug!(
                    task_id = %task_id,
                    scored = summary.scored,
                    anomalies = summary.anomalies,
                    cleared = summary.cleared,
                    "Task done"
                );
                (TaskStatus::Done, None, WorkerDisposition::Done)
            }
            TaskOutcome::Skip(reason) => {
                debug!(task_id = %task_id, %reason, "Task skipped");
                (TaskStatus::Skipped, Some(reason), WorkerDisposition::Skipped)
            }
            TaskOutcome::Duplicate => (TaskStatus::Done, None, WorkerDisposition::Duplicate),
            TaskOutcome::Retryable(e) if self.retry.exhausted(attempt) => {
                error!(task_id = %task_id, attempt, error = %e, "Task failed after final attempt");
                (TaskStatus::Failed, Some(e.to_string()), WorkerDisposition::Failed)
            }
            TaskOutcome::Retryable(e) => {
                warn!(task_id = %task_id, attempt, error = %e, "Task will be retried");
                (TaskStatus::Pending, Some(e.to_string()), WorkerDisposition::Retrying)
            }
            TaskOutcome::Fatal(e) => {
                error!(task_id = %task_id, error = %e, "Task failed");
                (TaskStatus::Failed, Some(e.to_string()), WorkerDisposition::Failed)
            }
        };

        self.finish(&task_id, running, status, last_error).await;
        self.release(&claim).await;
        if disposition == WorkerDisposition::Retrying {
            self.requeue(&task_id, attempt).await;
        } else {
            self.ack(&task_id).await;
        }
        disposition
    }

    /// Write the final status on top of the latest cached state, keeping
    /// counters the scheduler updated while the task ran.
    async fn finish(
        &self,
        task_id: &TaskId,
        running: TaskState,
        status: TaskStatus,
        last_error: Option<String>,
    ) {
        let cache = &self.backends.cache;
        let mut state = match cache.get_status(task_id).await {
            Ok(Some(latest)) => TaskState {
                duplicate_submissions: latest.duplicate_submissions,
                ..running
            },
            _ => running,
        };
        state.status = status;
        state.last_error = last_error;
        state.updated_at = self.backends.clock.now();
        if status == TaskStatus::Pending {
            state.started_at = None;
        }
        if let Err(e) = cache.set_status(&state).await {
            warn!(task_id = %task_id, status = status.as_str(), error = %e, "Failed to record task status");
        }
    }

    async fn ack(&self, task_id: &TaskId) {
        if let Err(e) = self.backends.queue.ack(task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to ack task");
        }
    }

    async fn requeue(&self, task_id: &TaskId, attempt: u32) {
        let delay = self.retry.backoff(attempt);
        if let Err(e) = self.backends.queue.nack_after(task_id, delay).await {
            warn!(task_id = %task_id, error = %e, "Failed to requeue task");
        }
    }

    async fn release(&self, claim: &ClaimKey) {
        if let Err(e) = self.backends.cache.release(claim, &self.worker_id).await {
            warn!(claim = %claim, error = %e, "Failed to release claim");
        }
    }

    /// Poll the queue and process deliveries until shutdown is signaled.
    pub async fn run(self: Arc<Self>) {
        info!(
            worker = %self.worker_id,
            concurrency = self.concurrency,
            batch_size = self.batch_size,
            "Worker pool starting"
        );

        let mut tasks = JoinSet::new();
        while !self.shutdown.load(Ordering::Relaxed) {
            while tasks.try_join_next().is_some() {}

            let available = self.permits.available_permits();
            if available == 0 {
                tasks.join_next().await;
                continue;
            }

            let max = (available as u32).min(self.batch_size);
            match self.backends.queue.receive(max).await {
                Ok(deliveries) if !deliveries.is_empty() => {
                    for delivery in deliveries {
                        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                            break;
                        };
                        let pool = Arc::clone(&self);
                        tasks.spawn(async move {
                            let _permit = permit;
                            pool.process_delivery(delivery).await
                        });
                    }
                }
                Ok(_) => self.idle().await,
                Err(e) => {
                    warn!(error = %e, "Failed to receive tasks");
                    self.idle().await;
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        info!(worker = %self.worker_id, "Worker pool stopped");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.wake.notified() => {}
        }
    }

    /// Process deliveries until the queue is empty, including tasks waiting
    /// out a retry delay. Returns how many deliveries were handled.
    pub async fn drain(self: &Arc<Self>) -> Result<usize, PipelineError> {
        let mut processed = 0;
        loop {
            let deliveries = self.backends.queue.receive(self.batch_size).await?;
            if deliveries.is_empty() {
                if self.backends.queue.depth().await? == 0 {
                    break;
                }
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            let mut batch = JoinSet::new();
            for delivery in deliveries {
                let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                    break;
                };
                let pool = Arc::clone(self);
                batch.spawn(async move {
                    let _permit = permit;
                    pool.process_delivery(delivery).await
                });
            }
            while let Some(joined) = batch.join_next().await {
                match joined {
                    Ok(_) => processed += 1,
                    Err(e) => warn!(error = %e, "Worker task panicked"),
                }
            }
        }
        Ok(processed)
    }

    pub fn metrics(&self) -> WorkerMetrics {
        self.metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn shutdown(&self) {
        info!("Worker pool shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}
