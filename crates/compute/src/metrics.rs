use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Incremental mean: new_avg = prev_avg + (sample - prev_avg) / count
fn running_mean(prev: Duration, sample: Duration, count: u64) -> Duration {
    if count <= 1 {
        return sample;
    }
    let prev_nanos = prev.as_nanos() as f64;
    let cur_nanos = sample.as_nanos() as f64;
    let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
    Duration::from_nanos(avg_nanos as u64)
}

/// Scheduler operational counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    pub sweeps_run: u64,
    /// Sweeps that found the lease held and did nothing.
    pub sweeps_skipped: u64,
    /// Sweeps aborted because a store could not be read.
    pub sweeps_aborted: u64,
    pub tasks_submitted: u64,
    pub duplicates_rejected: u64,
    pub previously_failed: u64,
    pub stalled_recovered: u64,
    /// Planned tasks the queue or cache refused.
    pub submit_errors: u64,
    pub last_sweep: Option<DateTime<Utc>>,
    pub avg_sweep_duration: Duration,
}

impl SchedulerMetrics {
    pub fn record_sweep(&mut self, duration: Duration) {
        self.sweeps_run += 1;
        self.last_sweep = Some(Utc::now());
        self.avg_sweep_duration = running_mean(self.avg_sweep_duration, duration, self.sweeps_run);
    }
}

/// Worker pool counters, keyed by disposition label.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerMetrics {
    pub tasks_processed: HashMap<String, u64>,
    pub avg_task_duration: HashMap<String, Duration>,
    pub last_run: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

impl WorkerMetrics {
    /// Record a finished delivery.
    pub fn record_execution(&mut self, disposition: &str, duration: Duration) {
        let count = {
            let c = self.tasks_processed.entry(disposition.to_string()).or_default();
            *c += 1;
            *c
        };
        self.last_run = Some(Utc::now());

        let prev_avg = self
            .avg_task_duration
            .get(disposition)
            .copied()
            .unwrap_or_default();
        self.avg_task_duration
            .insert(disposition.to_string(), running_mean(prev_avg, duration, count));
    }

    pub fn total_processed(&self) -> u64 {
        self.tasks_processed.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = WorkerMetrics::default();
        m.record_execution("done", Duration::from_millis(100));

        assert_eq!(m.tasks_processed["done"], 1);
        assert!(m.last_run.is_some());
        assert_eq!(m.avg_task_duration["done"], Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut m = WorkerMetrics::default();
        m.record_execution("done", Duration::from_millis(100));
        m.record_execution("done", Duration::from_millis(200));
        m.record_execution("failed", Duration::from_millis(5));

        assert_eq!(m.tasks_processed["done"], 2);
        assert_eq!(m.total_processed(), 3);
        let avg = m.avg_task_duration["done"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn sweep_durations_average() {
        let mut m = SchedulerMetrics::default();
        m.record_sweep(Duration::from_millis(10));
        m.record_sweep(Duration::from_millis(30));
        assert_eq!(m.sweeps_run, 2);
        assert_eq!(m.avg_sweep_duration, Duration::from_millis(20));
        assert!(m.last_sweep.is_some());
    }
}
