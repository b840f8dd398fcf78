//! Transaction error types.

use std::error::Error as StdError;

use thiserror::Error;

use crate::resource::ResourceError;
use crate::transaction::hooks::HookPhase;
use crate::transaction::propagation::PropagationBehavior;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Boxed error carried through hooks and chained failures.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Underlying resource error (commit conflict, lost connection, ...).
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Operation requires an active transaction.
    #[error("transaction {tx_id} is not active (state: {state})")]
    NotActive { tx_id: String, state: String },

    /// A joined scope rolled the transaction back, yet its owner finished
    /// normally. Nothing the owner wrote was committed.
    #[error("transaction {tx_id} was rolled back by an inner scope; nothing was committed")]
    RolledBackByInnerScope { tx_id: String },

    /// The requested propagation is incompatible with the ambient transaction.
    #[error("propagation {propagation} rejected: {reason}")]
    Propagation {
        propagation: PropagationBehavior,
        reason: &'static str,
    },

    /// No open savepoint carries this name.
    #[error("savepoint not found: {0}")]
    SavepointNotFound(String),

    /// Savepoints must be released innermost first.
    #[error("savepoint {name} released out of order ({open_above} savepoint(s) still open above it)")]
    SavepointOutOfOrder { name: String, open_above: usize },

    /// A fatal hook failed.
    #[error("{phase} hook '{hook}' failed: {source}")]
    HookFailed {
        hook: String,
        phase: HookPhase,
        #[source]
        source: BoxError,
    },

    /// The primary failure triggered a rollback which failed as well.
    #[error("{source}; rollback also failed: {rollback}")]
    RollbackFailed {
        #[source]
        source: BoxError,
        rollback: Box<TransactionError>,
    },

    /// Data bag value could not be converted.
    #[error("data bag error: {0}")]
    Data(#[from] serde_json::Error),

    /// Invalid operation for current transaction state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl TransactionError {
    /// Check if this error is retryable.
    ///
    /// A chained rollback failure is judged by the failure that caused it.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::Resource(err) => err.is_retriable(),
            TransactionError::RollbackFailed { source, .. } => source
                .downcast_ref::<TransactionError>()
                .is_some_and(TransactionError::is_retryable),
            _ => false,
        }
    }

    /// Chain a rollback failure onto the error that caused the rollback.
    pub fn rollback_failed(source: impl Into<BoxError>, rollback: TransactionError) -> Self {
        Self::RollbackFailed {
            source: source.into(),
            rollback: Box::new(rollback),
        }
    }

    pub(crate) fn not_active(tx_id: &str, state: impl ToString) -> Self {
        Self::NotActive {
            tx_id: tx_id.to_string(),
            state: state.to_string(),
        }
    }
}

/// Find a [`TransactionError`] anywhere on an error's source chain.
pub fn find_transaction_error<'a>(
    err: &'a (dyn StdError + 'static),
) -> Option<&'a TransactionError> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(found) = err.downcast_ref::<TransactionError>() {
            return Some(found);
        }
        current = err.source();
    }
    None
}
