use thiserror::Error;

pub type ExperimentResult<T> = Result<T, ExperimentError>;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ExperimentError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        ExperimentError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Storage outages and timeouts may succeed on retry; nothing else will.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExperimentError::StorageUnavailable(_) | ExperimentError::Timeout(_)
        )
    }
}
