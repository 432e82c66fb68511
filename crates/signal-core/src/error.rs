use thiserror::Error;

use crate::types::SignalStatus;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: SignalStatus, to: SignalStatus },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Execution timed out after {}ms", .0.as_millis())]
    ExecutionTimeout(std::time::Duration),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Insufficient sample: {have} < {need}")]
    InsufficientSample { have: usize, need: usize },

    #[error("A cycle is already running for account {0}")]
    CycleInProgress(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl SignalError {
    /// Wrap a collaborator (store/broker) failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}
