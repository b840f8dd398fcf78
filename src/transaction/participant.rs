//! Participants: extension point for coordinating outside resources.
//!
//! A participant is enlisted on a context and told when the transaction is
//! about to commit (`prepare`), has committed, or has rolled back. No
//! protocol is implemented here; a distributed layer can build one on top.

use crate::transaction::hooks::HookResult;

/// Something that must follow the outcome of a transaction.
pub trait Participant: Send + Sync {
    /// Identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Called after the BeforeCommit hooks. An error aborts the commit.
    fn prepare(&self) -> HookResult {
        Ok(())
    }

    /// Called once the resource has committed. Errors are only logged.
    fn commit(&self) -> HookResult {
        Ok(())
    }

    /// Called once the resource has rolled back. Errors are only logged.
    fn rollback(&self) -> HookResult {
        Ok(())
    }
}
