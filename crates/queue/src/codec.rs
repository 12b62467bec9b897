//! JSON wire format of task descriptors.

use serde::{Deserialize, Serialize};

use geoanomaly_core::{TaskDescriptor, TaskId};

use crate::error::QueueError;

/// What goes on the broker: the encoded descriptor plus its ordering group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Digest of the series key; FIFO brokers order deliveries within a
    /// group and only accept a restricted character set for it.
    pub group: String,
    pub body: String,
}

pub fn encode(descriptor: &TaskDescriptor) -> Result<TaskPayload, QueueError> {
    let body = serde_json::to_string(descriptor)
        .map_err(|e| QueueError::Parse(format!("encode {}: {e}", descriptor.task_id)))?;
    Ok(TaskPayload {
        group: descriptor.series_key.digest(),
        body,
    })
}

/// Decode a delivered body and check that its ID matches its contents.
pub fn decode(body: &str) -> Result<TaskDescriptor, QueueError> {
    let descriptor: TaskDescriptor =
        serde_json::from_str(body).map_err(|e| QueueError::Parse(e.to_string()))?;
    let expected = TaskId::derive(&descriptor.series_key, descriptor.window.as_of);
    if expected != descriptor.task_id {
        return Err(QueueError::Parse(format!(
            "task id {} does not match series {} as of {}",
            descriptor.task_id, descriptor.series_key, descriptor.window.as_of
        )));
    }
    Ok(descriptor)
}
