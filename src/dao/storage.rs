use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised by store backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network or backend failure. Callers log it; nothing is retried here.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// Human readable summary of the failed operation.
        message: String,
        /// Backend error that caused the failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// Merge-update targeted a document that does not exist.
    #[error("document `{id}` not found")]
    NotFound {
        /// Identifier of the missing document.
        id: String,
    },
    /// A field precondition attached to an update did not hold.
    #[error("precondition on field `{field}` of `{id}` failed")]
    PreconditionFailed {
        /// Identifier of the targeted document.
        id: String,
        /// First field whose precondition did not hold.
        field: String,
    },
}

impl StoreError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StoreError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Whether the error reports a missing document.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
