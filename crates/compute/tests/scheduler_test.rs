//! Scheduler and worker-pool state transitions on the in-memory stack.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use common::{daily, ts, Harness};
use geoanomaly_compute::scheduler::Submission;
use geoanomaly_compute::{Backends, Scheduler, WorkerDisposition};
use geoanomaly_core::{
    AnomalyRecord, EvaluationWindow, SeriesKey, TaskDescriptor, TaskId, TaskState, TaskStatus,
};
use geoanomaly_queue::{
    ClaimKey, Delivery, InMemoryTaskQueue, QueueError, QueueHealth, ResultCache, SubmitOutcome,
    TaskPayload, TaskQueue,
};
use geoanomaly_storage::{AnomalyQuery, AnomalyStore, MemoryStore, StoreError};

/// Anomaly store that counts writes and makes each one slow.
struct SlowAnomalies {
    inner: Arc<MemoryStore>,
    upserts: AtomicUsize,
    delay: StdDuration,
}

#[async_trait]
impl AnomalyStore for SlowAnomalies {
    async fn upsert_anomaly(&self, record: &AnomalyRecord) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert_anomaly(record).await
    }

    async fn clear_anomaly(
        &self,
        entity_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.clear_anomaly(entity_id, timestamp).await
    }

    async fn query_anomalies(
        &self,
        query: &AnomalyQuery,
    ) -> Result<Vec<AnomalyRecord>, StoreError> {
        self.inner.query_anomalies(query).await
    }

    async fn latest_anomaly_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.latest_anomaly_timestamp().await
    }
}

/// Queue that refuses every message for one series while `rejecting` is set.
struct RejectingQueue {
    inner: Arc<InMemoryTaskQueue>,
    group: String,
    rejecting: AtomicBool,
}

#[async_trait]
impl TaskQueue for RejectingQueue {
    async fn submit(
        &self,
        task_id: &TaskId,
        payload: TaskPayload,
    ) -> Result<SubmitOutcome, QueueError> {
        if self.rejecting.load(Ordering::SeqCst) && payload.group == self.group {
            return Err(QueueError::Provider("InvalidParameterValue".into()));
        }
        self.inner.submit(task_id, payload).await
    }

    async fn receive(&self, max: u32) -> Result<Vec<Delivery>, QueueError> {
        self.inner.receive(max).await
    }

    async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError> {
        self.inner.ack(task_id).await
    }

    async fn nack(&self, task_id: &TaskId, requeue: bool) -> Result<(), QueueError> {
        self.inner.nack(task_id, requeue).await
    }

    async fn nack_after(&self, task_id: &TaskId, delay: StdDuration) -> Result<(), QueueError> {
        self.inner.nack_after(task_id, delay).await
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        self.inner.cancel(task_id).await
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        self.inner.depth().await
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        self.inner.health_check().await
    }
}

fn e1_task(as_of: DateTime<Utc>) -> TaskDescriptor {
    TaskDescriptor::new(SeriesKey::entity("E1"), EvaluationWindow { start: None, as_of })
}

#[tokio::test]
async fn second_submission_while_running_is_a_duplicate() {
    let h = Harness::new(daily("E1", &[10.0, 10.5, 11.0, 55.0]), ts(5)).await;
    let slow = Arc::new(SlowAnomalies {
        inner: h.store.clone(),
        upserts: AtomicUsize::new(0),
        delay: StdDuration::from_millis(100),
    });
    let backends = Backends {
        anomalies: slow.clone(),
        ..h.backends.clone()
    };
    let scheduler = h.scheduler();
    let workers = h.workers_with(backends);

    let task = e1_task(ts(4));
    assert_eq!(scheduler.submit(&task).await.unwrap(), Submission::Accepted);

    let delivery = h.queue.receive(1).await.unwrap().pop().unwrap();
    let pool = workers.clone();
    let running = tokio::spawn(async move { pool.process_delivery(delivery).await });

    loop {
        let state = h.cache.get_status(&task.task_id).await.unwrap();
        if state.is_some_and(|s| s.status == TaskStatus::Running) {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(1)).await;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
    assert_eq!(scheduler.submit(&task).await.unwrap(), Submission::Duplicate);

    assert_eq!(running.await.unwrap(), WorkerDisposition::Done);
    assert_eq!(slow.upserts.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.anomaly_count().await, 1);

    let state = h.cache.get_status(&task.task_id).await.unwrap().unwrap();
    assert_eq!(state.status, TaskStatus::Done);
    assert_eq!(state.duplicate_submissions, 1);
    assert_eq!(scheduler.metrics().duplicates_rejected, 1);
}

#[tokio::test]
async fn concurrent_submissions_run_once() {
    let h = Harness::new(daily("E1", &[10.0, 10.5, 11.0, 55.0]), ts(5)).await;
    // Two instances, as with overlapping sweeps from separate processes.
    let first = h.scheduler();
    let second = h.scheduler();
    let workers = h.workers();

    let task = e1_task(ts(4));
    let (a, b) = tokio::join!(first.submit(&task), second.submit(&task));
    let outcomes = [a.unwrap(), b.unwrap()];
    let accepted = outcomes.iter().filter(|o| **o == Submission::Accepted).count();
    let duplicates = outcomes.iter().filter(|o| **o == Submission::Duplicate).count();
    assert_eq!((accepted, duplicates), (1, 1));
    assert_eq!(h.queue.depth().await.unwrap(), 1);

    assert_eq!(workers.drain().await.unwrap(), 1);
    assert_eq!(h.store.anomaly_count().await, 1);
    let state = h.cache.get_status(&task.task_id).await.unwrap().unwrap();
    assert_eq!(state.status, TaskStatus::Done);
    assert_eq!(state.attempt_count, 1);
}

#[tokio::test]
async fn refused_submission_does_not_stop_the_sweep() {
    let mut observations = daily("E1", &[10.0, 10.5, 11.0, 55.0]);
    observations.extend(daily("Los Angeles", &[5.0, 5.5, 6.0, 6.5]));
    let h = Harness::new(observations, ts(5)).await;

    let queue = Arc::new(RejectingQueue {
        inner: h.queue.clone(),
        group: SeriesKey::entity("Los Angeles").digest(),
        rejecting: AtomicBool::new(true),
    });
    let backends = Backends {
        queue: queue.clone(),
        ..h.backends.clone()
    };
    let scheduler = Scheduler::new(
        backends,
        h.pipeline.clone(),
        h.scheduler_config.clone(),
    )
    .unwrap();

    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.planned, 2);
    assert_eq!(report.submitted, 1);
    assert_eq!(report.submit_errors, 1);
    assert_eq!(
        report.task_ids,
        vec![TaskId::derive(&SeriesKey::entity("E1"), ts(4))]
    );
    assert_eq!(h.queue.depth().await.unwrap(), 1);
    assert_eq!(scheduler.metrics().submit_errors, 1);
    assert_eq!(scheduler.metrics().sweeps_aborted, 0);

    // Once the broker accepts it, the next sweep picks the series up.
    queue.rejecting.store(false, Ordering::SeqCst);
    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.submit_errors, 0);
    assert_eq!(h.queue.depth().await.unwrap(), 2);
}

#[tokio::test]
async fn finished_task_redelivery_is_a_no_op() {
    let h = Harness::new(daily("E1", &[10.0, 10.5, 11.0, 55.0]), ts(5)).await;
    let scheduler = h.scheduler();
    let workers = h.workers();

    let task = e1_task(ts(4));
    scheduler.submit(&task).await.unwrap();
    workers.drain().await.unwrap();

    // Broker-level duplicate delivery after completion.
    h.queue
        .submit(&task.task_id, geoanomaly_queue::encode(&task).unwrap())
        .await
        .unwrap();
    let delivery = h.queue.receive(1).await.unwrap().pop().unwrap();
    assert_eq!(workers.process_delivery(delivery).await, WorkerDisposition::Duplicate);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(h.store.anomaly_count().await, 1);
}

#[tokio::test]
async fn unavailable_store_retries_then_fails() {
    let h = Harness::new(daily("E1", &[10.0, 10.5, 11.0, 55.0]), ts(5)).await;
    let scheduler = h.scheduler();
    let workers = h.workers();

    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.submitted, 1);

    h.store.set_available(false);
    workers.drain().await.unwrap();

    let task_id = TaskId::derive(&SeriesKey::entity("E1"), ts(4));
    let state = h.cache.get_status(&task_id).await.unwrap().unwrap();
    assert_eq!(state.status, TaskStatus::Failed);
    assert_eq!(state.attempt_count, h.pipeline.max_attempts);
    assert!(state.last_error.unwrap().contains("Store unavailable"));

    let metrics = workers.metrics();
    assert_eq!(metrics.tasks_processed["retrying"], 2);
    assert_eq!(metrics.tasks_processed["failed"], 1);

    let failed = scheduler.tasks(Some(TaskStatus::Failed)).await.unwrap();
    assert_eq!(failed.len(), 1);

    // Failed tasks are never resubmitted under the same ID.
    h.store.set_available(true);
    h.clock.advance(Duration::days(1));
    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.previously_failed, 1);
    assert_eq!(report.submitted, 0);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn sweep_aborts_when_observations_are_unreadable() {
    let h = Harness::new(daily("E1", &[10.0, 10.5, 11.0, 55.0]), ts(5)).await;
    let scheduler = h.scheduler();

    h.store.set_available(false);
    assert!(scheduler.sweep().await.is_err());
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(scheduler.metrics().sweeps_aborted, 1);

    // The lease was released, so the next tick runs normally.
    h.store.set_available(true);
    assert_eq!(scheduler.sweep().await.unwrap().submitted, 1);
}

#[tokio::test]
async fn sweep_is_a_no_op_while_the_lease_is_held() {
    let h = Harness::new(daily("E1", &[10.0, 10.5, 11.0, 55.0]), ts(5)).await;
    let scheduler = h.scheduler();

    assert!(h
        .cache
        .try_claim(&ClaimKey::SweepLease, "other-scheduler", StdDuration::from_secs(60))
        .await
        .unwrap());

    let report = scheduler.sweep().await.unwrap();
    assert!(!report.ran);
    assert_eq!(report.planned, 0);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(scheduler.metrics().sweeps_skipped, 1);
}

#[tokio::test]
async fn stalled_tasks_are_resubmitted() {
    let h = Harness::new(daily("E1", &[10.0, 10.5, 11.0, 55.0]), ts(5)).await;
    let scheduler = h.scheduler();
    let workers = h.workers();

    let task = e1_task(ts(4));
    let stall = Duration::seconds(h.scheduler_config.stall_timeout_secs as i64);
    let mut state = TaskState::pending(task.clone(), ts(5) - stall * 2);
    state.status = TaskStatus::Running;
    state.attempt_count = 1;
    state.started_at = Some(ts(5) - stall * 2);
    h.cache.set_status(&state).await.unwrap();

    assert_eq!(scheduler.recover_stalled().await.unwrap(), 1);
    let state = h.cache.get_status(&task.task_id).await.unwrap().unwrap();
    assert_eq!(state.status, TaskStatus::Pending);
    assert_eq!(h.queue.depth().await.unwrap(), 1);

    workers.drain().await.unwrap();
    let state = h.cache.get_status(&task.task_id).await.unwrap().unwrap();
    assert_eq!(state.status, TaskStatus::Done);
    assert_eq!(state.attempt_count, 2);
    assert_eq!(scheduler.metrics().stalled_recovered, 1);
}

#[tokio::test]
async fn cancel_removes_only_unclaimed_tasks() {
    let h = Harness::new(daily("E1", &[10.0, 10.5, 11.0, 55.0]), ts(5)).await;
    let scheduler = h.scheduler();

    let task = e1_task(ts(4));
    scheduler.submit(&task).await.unwrap();
    assert!(scheduler.cancel(&task.task_id).await.unwrap());
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    let state = h.cache.get_status(&task.task_id).await.unwrap().unwrap();
    assert_eq!(state.status, TaskStatus::Skipped);
    assert_eq!(state.last_error.as_deref(), Some("cancelled"));

    // The submission claim was released, so it can be submitted again.
    assert_eq!(scheduler.submit(&task).await.unwrap(), Submission::Accepted);
    let _claimed = h.queue.receive(1).await.unwrap();
    assert!(!scheduler.cancel(&task.task_id).await.unwrap());
}

#[tokio::test]
async fn backfill_chains_windows_and_reports_progress() {
    let values = [10.0, 10.5, 11.0, 11.5, 12.0, 60.0, 13.0];
    let h = Harness::new(daily("E1", &values), ts(8)).await;
    let scheduler = h.scheduler();
    let workers = h.workers();

    let report = scheduler
        .backfill(Some("E1"), ts(4), ts(7), Duration::days(1))
        .await
        .unwrap();
    assert_eq!(report.planned, 3);
    assert_eq!(report.submitted, 3);
    assert_eq!(
        report.task_ids,
        vec![
            TaskId::derive(&SeriesKey::entity("E1"), ts(5)),
            TaskId::derive(&SeriesKey::entity("E1"), ts(6)),
            TaskId::derive(&SeriesKey::entity("E1"), ts(7)),
        ]
    );

    let before = scheduler.progress(&report).await.unwrap();
    assert_eq!(before.pending, 3);
    assert_eq!(before.success_ratio, 0.0);

    workers.drain().await.unwrap();
    let after = scheduler.progress(&report).await.unwrap();
    assert!(after.is_settled());
    assert_eq!(after.done, 3);
    assert_eq!(after.success_ratio, 1.0);

    let records = h.store.query_anomalies(&AnomalyQuery::default()).await.unwrap();
    assert!(records.iter().any(|r| r.timestamp == ts(6)));
    assert!(records.iter().all(|r| r.timestamp > ts(4)));

    // Same range again: every task is still inside its dedup window.
    let again = scheduler
        .backfill(Some("E1"), ts(4), ts(7), Duration::days(1))
        .await
        .unwrap();
    assert_eq!(again.duplicates, 3);
    assert_eq!(again.submitted, 0);
}

#[tokio::test]
async fn backfill_rejects_non_positive_step() {
    let h = Harness::new(daily("E1", &[1.0, 2.0, 3.0]), ts(5)).await;
    let err = h
        .scheduler()
        .backfill(None, ts(1), ts(3), Duration::zero())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("step"));
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let h = Harness::new(daily("E1", &[10.0, 10.5, 11.0, 55.0]), ts(5)).await;
    let scheduler = Arc::new(h.scheduler());
    let workers = h.workers();

    let sched = scheduler.clone();
    let sched_loop = tokio::spawn(async move { sched.run().await });
    let pool_loop = tokio::spawn(workers.clone().run());

    let task_id = TaskId::derive(&SeriesKey::entity("E1"), ts(4));
    for _ in 0..500 {
        let done = h
            .cache
            .get_status(&task_id)
            .await
            .unwrap()
            .is_some_and(|s| s.status == TaskStatus::Done);
        if done {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }

    scheduler.shutdown();
    workers.shutdown();
    sched_loop.await.unwrap();
    pool_loop.await.unwrap();

    assert_eq!(h.store.anomaly_count().await, 1);
    assert!(scheduler.metrics().sweeps_run >= 1);
}
