//! The contract the coordinator drives.
//!
//! A resource is anything with physical transaction control: a database
//! connection, a session object, or the in-memory store shipped with this
//! crate. The coordinator never looks at the data, only at these calls.

use crate::resource::error::ResourceResult;

/// One underlying transactional connection.
///
/// Implementations are driven by exactly one
/// [`TransactionContext`](crate::transaction::TransactionContext) at a time,
/// so none of these methods need to be reentrant.
pub trait ResourceHandle: Send + 'static {
    /// Handle for a nested checkpoint (savepoint) opened by [`begin_nested`].
    ///
    /// [`begin_nested`]: ResourceHandle::begin_nested
    type Nested: NestedHandle;

    /// Start the physical transaction.
    fn begin(&mut self) -> ResourceResult<()>;

    /// Durably commit everything written since `begin`.
    ///
    /// Fails with [`ResourceError::Conflict`](super::ResourceError::Conflict)
    /// when the store rejects the write set.
    fn commit(&mut self) -> ResourceResult<()>;

    /// Discard everything written since `begin`.
    fn rollback(&mut self) -> ResourceResult<()>;

    /// Open a nested checkpoint inside the current transaction.
    fn begin_nested(&mut self) -> ResourceResult<Self::Nested>;

    /// Make pending writes visible inside the transaction without ending it.
    fn flush(&mut self) -> ResourceResult<()>;

    /// Mark the next transaction as read-only. Backends without the notion
    /// can ignore it.
    fn set_read_only(&mut self, read_only: bool) -> ResourceResult<()> {
        let _ = read_only;
        Ok(())
    }
}

/// A nested checkpoint returned by [`ResourceHandle::begin_nested`].
///
/// The context calls these methods only while it holds the lock on the
/// resource that opened the checkpoint, so a handle that talks to the same
/// connection needs no synchronization of its own.
pub trait NestedHandle: Send + 'static {
    /// Fold the checkpoint into the enclosing transaction scope.
    fn commit(&mut self) -> ResourceResult<()>;

    /// Undo everything written since the checkpoint was opened.
    fn rollback(&mut self) -> ResourceResult<()>;
}

/// Opens fresh resources for new top-level transactions.
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: ResourceHandle;

    /// Open a resource with no transaction in progress.
    fn open(&self) -> ResourceResult<Self::Resource>;
}
