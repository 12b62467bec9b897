//! Task queue trait and types.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use geoanomaly_core::TaskId;

use crate::codec::TaskPayload;
use crate::error::QueueError;

/// Result of placing a task on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted,
    /// A task with the same ID is already queued or in flight.
    Duplicate,
}

/// A task handed to a worker. Stays invisible to other workers until it is
/// acked, nacked, or its visibility timeout lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub task_id: TaskId,
    pub body: String,
    /// How many times this task has been delivered, this delivery included.
    pub attempt: u32,
}

/// Health status of a queue connection.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    /// Whether the queue is reachable.
    pub connected: bool,
    /// Approximate number of messages waiting in the queue.
    pub approximate_message_count: Option<u64>,
    /// Queue provider name (e.g., "sqs", "memory").
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueHealth {{ connected: {}, messages: {:?}, provider: {} }}",
            self.connected, self.approximate_message_count, self.provider
        )
    }
}

/// Broker contract: at-least-once delivery with explicit acknowledgment.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(
        &self,
        task_id: &TaskId,
        payload: TaskPayload,
    ) -> Result<SubmitOutcome, QueueError>;

    /// Claim up to `max` visible tasks. Returns an empty vec if none are ready.
    async fn receive(&self, max: u32) -> Result<Vec<Delivery>, QueueError>;

    /// Processing finished; remove the task.
    async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError>;

    /// Give the task back. `requeue = false` drops it instead.
    async fn nack(&self, task_id: &TaskId, requeue: bool) -> Result<(), QueueError>;

    /// Give the task back, visible again after `delay`.
    async fn nack_after(&self, task_id: &TaskId, delay: Duration) -> Result<(), QueueError>;

    /// Remove a task no worker has claimed. Returns whether it was removed.
    async fn cancel(&self, task_id: &TaskId) -> Result<bool, QueueError>;

    /// Tasks waiting for a worker, including delayed ones.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<QueueHealth, QueueError>;

    /// Get approximate depth of the dead-letter queue (if configured).
    async fn dlq_depth(&self) -> Result<Option<u64>, QueueError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_health_display() {
        let health = QueueHealth {
            connected: true,
            approximate_message_count: Some(42),
            provider: "sqs".to_string(),
        };
        let display = format!("{}", health);
        assert!(display.contains("connected: true"));
        assert!(display.contains("42"));
    }

    #[test]
    fn submit_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&SubmitOutcome::Duplicate).unwrap();
        assert_eq!(json, "\"duplicate\"");
    }
}
