use shared::error::ApiError;
use thiserror::Error;

// Expected no-ops such as duplicate events are reported as
// `Mutation::Unchanged`, never as errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("transient fetch failure for {key}: {source}")]
    TransientFetch { key: String, source: ApiError },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{operation} rolled back: {source}")]
    OptimisticRollback {
        operation: &'static str,
        source: ApiError,
    },
    #[error("{operation} failed: {source}")]
    Request { operation: String, source: ApiError },
}

impl SyncError {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn from_fetch(key: impl Into<String>, source: ApiError) -> Self {
        let key = key.into();
        if source.is_transient() {
            Self::TransientFetch { key, source }
        } else {
            Self::Request {
                operation: key,
                source,
            }
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
