use thiserror::Error;

use geoanomaly_core::PipelineError;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached or timed out. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Decode(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => StoreError::Corrupt(e.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => PipelineError::StoreUnavailable(msg),
            StoreError::Corrupt(msg) => PipelineError::FatalComputation(msg),
        }
    }
}
