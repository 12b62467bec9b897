use std::time::Duration;

use geoanomaly_core::config::{PipelineConfig, WorkerConfig};

/// Exponential backoff for retryable task failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(pipeline: &PipelineConfig, worker: &WorkerConfig) -> Self {
        Self {
            max_attempts: pipeline.max_attempts,
            base: Duration::from_millis(worker.retry_base_ms),
            max: Duration::from_millis(worker.retry_max_ms),
        }
    }

    /// Delay before the next delivery after `attempt` failed:
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// No attempts left after `attempt` failed.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(5), Duration::from_secs(10));
        assert_eq!(p.backoff(200), Duration::from_secs(10));
    }

    #[test]
    fn exhausted_at_max_attempts() {
        let p = policy();
        assert!(!p.exhausted(2));
        assert!(p.exhausted(3));
    }
}
