//! Resource layer error types
//!
//! Errors raised by a [`ResourceHandle`](super::ResourceHandle) implementation.
//! We use `thiserror` for ergonomic error definition and better error messages

use thiserror::Error;

/// boxed error for backends that bring their own error type
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// the main error type for resource operations
#[derive(Debug, Error)]
pub enum ResourceError {
    /// commit rejected because of a concurrent write (serialization conflict)
    #[error("commit conflict: {reason}")]
    Conflict { reason: String },

    /// an operation that needs an open transaction ran outside one
    #[error("no transaction in progress")]
    NoTransaction,

    /// `begin` called on a resource that already has an open transaction
    #[error("transaction already in progress")]
    AlreadyInTransaction,

    /// the nested checkpoint was already released or rolled back underneath us
    #[error("nested checkpoint not found: {0}")]
    CheckpointNotFound(u64),

    /// write attempted on a read-only transaction
    #[error("resource is read-only")]
    ReadOnly,

    /// the connection could not be opened or was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// value could not be encoded or decoded by the store
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// any other backend specific failure
    #[error("backend error: {0}")]
    Backend(#[source] BackendError),
}

impl ResourceError {
    /// wrap a backend specific error
    pub fn backend(err: impl Into<BackendError>) -> Self {
        Self::Backend(err.into())
    }

    /// check if this error is a write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, ResourceError::Conflict { .. })
    }

    /// check if this error is recoverable by retrying the whole transaction
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ResourceError::Conflict { .. } | ResourceError::Connection(_)
        )
    }
}

/// result type alias for resource operations
pub type ResourceResult<T> = Result<T, ResourceError>;
