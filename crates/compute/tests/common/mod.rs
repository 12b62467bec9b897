#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use geoanomaly_compute::{Backends, Scheduler, WorkerPool};
use geoanomaly_core::config::{PipelineConfig, SchedulerConfig, WorkerConfig};
use geoanomaly_core::{Clock, FixedClock, Observation};
use geoanomaly_queue::{InMemoryResultCache, InMemoryTaskQueue};
use geoanomaly_storage::MemoryStore;

pub fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
}

pub fn daily(entity: &str, values: &[f64]) -> Vec<Observation> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| Observation::new(entity, ts(i as u32 + 1), *v))
        .collect()
}

/// In-memory stack with a fixed clock and fast retries.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub cache: Arc<InMemoryResultCache>,
    pub clock: Arc<FixedClock>,
    pub backends: Backends,
    pub pipeline: PipelineConfig,
    pub scheduler_config: SchedulerConfig,
    pub worker_config: WorkerConfig,
}

impl Harness {
    pub async fn new(observations: Vec<Observation>, now: DateTime<Utc>) -> Self {
        Self::with_pipeline(
            observations,
            now,
            PipelineConfig {
                min_points: 3,
                ..PipelineConfig::default()
            },
        )
        .await
    }

    pub async fn with_pipeline(
        observations: Vec<Observation>,
        now: DateTime<Utc>,
        pipeline: PipelineConfig,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.insert_observations(observations).await;

        let clock = Arc::new(FixedClock::new(now));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let queue = Arc::new(InMemoryTaskQueue::new(Duration::from_secs(60)));
        let cache = Arc::new(InMemoryResultCache::new(
            dyn_clock.clone(),
            Duration::from_secs(86_400),
        ));
        let backends = Backends::with_store(store.clone(), queue.clone(), cache.clone(), dyn_clock);

        let scheduler_config = SchedulerConfig {
            dedup_window_secs: pipeline.reevaluation_interval_secs,
            ..SchedulerConfig::default()
        };
        let worker_config = WorkerConfig {
            concurrency: 4,
            batch_size: 10,
            poll_interval_ms: 5,
            retry_base_ms: 1,
            retry_max_ms: 5,
        };

        Self {
            store,
            queue,
            cache,
            clock,
            backends,
            pipeline,
            scheduler_config,
            worker_config,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.backends.clone(),
            self.pipeline.clone(),
            self.scheduler_config.clone(),
        )
        .unwrap()
    }

    pub fn workers(&self) -> Arc<WorkerPool> {
        self.workers_with(self.backends.clone())
    }

    pub fn workers_with(&self, backends: Backends) -> Arc<WorkerPool> {
        Arc::new(
            WorkerPool::new(
                backends,
                &self.pipeline,
                &self.worker_config,
                &self.scheduler_config,
            )
            .unwrap(),
        )
    }
}
