use thiserror::Error;

use crate::task::TaskOutcome;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Insufficient data for series {series}: need {required} points, have {available}")]
    InsufficientData {
        series: String,
        required: usize,
        available: usize,
    },

    #[error("Transient computation error: {0}")]
    TransientComputation(String),

    #[error("Fatal computation error: {0}")]
    FatalComputation(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether a retry of the same task can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientComputation(_) | PipelineError::StoreUnavailable(_)
        )
    }

    /// Classify the error at the task boundary.
    ///
    /// `InsufficientData` skips, transient failures retry, `DuplicateTask`
    /// is a successful no-op, everything else is fatal.
    pub fn into_outcome(self) -> TaskOutcome {
        match self {
            PipelineError::InsufficientData { .. } => TaskOutcome::Skip(self.to_string()),
            PipelineError::DuplicateTask(_) => TaskOutcome::Duplicate,
            e if e.is_retryable() => TaskOutcome::Retryable(e),
            e => TaskOutcome::Fatal(e),
        }
    }
}
