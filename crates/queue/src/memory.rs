//! In-process task queue with broker-like delivery semantics.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use geoanomaly_core::TaskId;

use crate::codec::TaskPayload;
use crate::error::QueueError;
use crate::queue::{Delivery, QueueHealth, SubmitOutcome, TaskQueue};

struct Message {
    seq: u64,
    payload: TaskPayload,
    receive_count: u32,
    visible_at: Instant,
    in_flight: bool,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    messages: HashMap<TaskId, Message>,
}

/// Single-process broker: FIFO by submission, visibility-timeout redelivery,
/// delayed requeue, and rejection of IDs already queued or in flight.
pub struct InMemoryTaskQueue {
    state: Mutex<State>,
    visibility_timeout: Duration,
}

impl InMemoryTaskQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            visibility_timeout,
        }
    }

    /// Tasks currently claimed by a worker.
    pub async fn in_flight(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .messages
            .values()
            .filter(|m| m.in_flight && m.visible_at > now)
            .count()
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn submit(
        &self,
        task_id: &TaskId,
        payload: TaskPayload,
    ) -> Result<SubmitOutcome, QueueError> {
        let mut state = self.state.lock().await;
        if state.messages.contains_key(task_id) {
            debug!(task_id = %task_id, "Rejected duplicate submission");
            return Ok(SubmitOutcome::Duplicate);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.messages.insert(
            task_id.clone(),
            Message {
                seq,
                payload,
                receive_count: 0,
                visible_at: Instant::now(),
                in_flight: false,
            },
        );
        Ok(SubmitOutcome::Accepted)
    }

    async fn receive(&self, max: u32) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let mut ready: Vec<(u64, TaskId)> = state
            .messages
            .iter()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(id, m)| (m.seq, id.clone()))
            .collect();
        ready.sort();
        ready.truncate(max as usize);

        let mut deliveries = Vec::with_capacity(ready.len());
        for (_, task_id) in ready {
            if let Some(msg) = state.messages.get_mut(&task_id) {
                if msg.in_flight {
                    debug!(task_id = %task_id, "Visibility timeout lapsed, redelivering");
                }
                msg.receive_count += 1;
                msg.in_flight = true;
                msg.visible_at = now + self.visibility_timeout;
                deliveries.push(Delivery {
                    task_id,
                    body: msg.payload.body.clone(),
                    attempt: msg.receive_count,
                });
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        match state.messages.remove(task_id) {
            Some(_) => Ok(()),
            None => Err(QueueError::Ack(format!("unknown task {task_id}"))),
        }
    }

    async fn nack(&self, task_id: &TaskId, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            return self.nack_after(task_id, Duration::ZERO).await;
        }
        let mut state = self.state.lock().await;
        state.messages.remove(task_id);
        Ok(())
    }

    async fn nack_after(&self, task_id: &TaskId, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let msg = state
            .messages
            .get_mut(task_id)
            .ok_or_else(|| QueueError::Ack(format!("unknown task {task_id}")))?;
        msg.in_flight = false;
        msg.visible_at = Instant::now() + delay;
        Ok(())
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let claimed = match state.messages.get(task_id) {
            None => return Ok(false),
            Some(m) => m.in_flight && m.visible_at > now,
        };
        if claimed {
            debug!(task_id = %task_id, "Task already claimed; not cancelled");
            return Ok(false);
        }
        state.messages.remove(task_id);
        Ok(true)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let now = Instant::now();
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .filter(|m| !(m.in_flight && m.visible_at > now))
            .count() as u64)
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: Some(self.depth().await?),
            provider: "memory".to_string(),
        })
    }
}
