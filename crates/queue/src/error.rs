//! Queue and result-cache error types.

use thiserror::Error;

use geoanomaly_core::PipelineError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("result cache error: {0}")]
    Cache(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Cache(e.to_string())
    }
}

impl From<QueueError> for PipelineError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Parse(msg) => PipelineError::FatalComputation(msg),
            other => PipelineError::StoreUnavailable(other.to_string()),
        }
    }
}
