//! Transaction lifecycle state.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of a [`TransactionContext`](super::TransactionContext).
///
/// ```text
/// Inactive ──begin──► Active ──commit──► Committed
///                       │
///                       ├──rollback──► RolledBack
///                       └──failure───► Failed ──rollback──► RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum TransactionState {
    #[default]
    Inactive,
    Active,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionState {
    /// Whether the transaction has ended. A terminal context is never reused.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed
        )
    }

    /// Whether `rollback` has anything to undo.
    pub fn can_roll_back(&self) -> bool {
        matches!(self, TransactionState::Active | TransactionState::Failed)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Inactive => "inactive",
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
