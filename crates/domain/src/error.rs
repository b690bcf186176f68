use thiserror::Error;

use crate::ports::cache::CacheError;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("unexpected failure: {0}")]
    Unexpected(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl DomainError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn task_not_found(task_id: i64) -> Self {
        Self::NotFound(format!("moderation task {task_id}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Connectivity, timeouts and "not ready" conditions are worth another attempt;
    /// everything else is terminal for the message that hit it.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Cache(err) => err.is_transient(),
            Self::NotFound(_) | Self::Unexpected(_) => false,
        }
    }
}
