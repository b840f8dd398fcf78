//! Savepoints: nested checkpoints inside one physical transaction.

use std::fmt;

use serde::Serialize;

use crate::resource::{NestedHandle, ResourceResult};

/// Lifecycle state of a savepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SavepointState {
    Open,
    Released,
    RolledBack,
}

impl SavepointState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SavepointState::Open)
    }
}

impl fmt::Display for SavepointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SavepointState::Open => "open",
            SavepointState::Released => "released",
            SavepointState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// Handle to a savepoint opened on a
/// [`TransactionContext`](super::TransactionContext).
///
/// This is only a reference; the savepoint itself stays on the context's
/// stack. A reference whose savepoint is gone (released, or discarded by an
/// outer rollback) is stale and operations on it are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SavepointRef {
    pub(crate) id: u64,
    pub(crate) name: String,
}

impl SavepointRef {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for SavepointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One nested checkpoint. Release and rollback each take effect at most once.
pub struct SavepointContext<N: NestedHandle> {
    id: u64,
    name: String,
    state: SavepointState,
    handle: N,
}

impl<N: NestedHandle> SavepointContext<N> {
    pub fn new(id: u64, name: impl Into<String>, handle: N) -> Self {
        Self {
            id,
            name: name.into(),
            state: SavepointState::Open,
            handle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SavepointState {
        self.state
    }

    pub fn to_ref(&self) -> SavepointRef {
        SavepointRef {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// Fold the savepoint into the enclosing scope. No-op once terminal.
    pub fn release(&mut self) -> ResourceResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.handle.commit()?;
        self.state = SavepointState::Released;
        Ok(())
    }

    /// Undo the writes made since the savepoint opened. No-op once terminal.
    pub fn rollback(&mut self) -> ResourceResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.handle.rollback()?;
        self.state = SavepointState::RolledBack;
        Ok(())
    }

    /// Mark the savepoint rolled back without touching the resource, for
    /// when the whole transaction is being discarded anyway.
    pub(crate) fn discard(&mut self) {
        self.state = SavepointState::RolledBack;
    }
}

impl<N: NestedHandle> fmt::Debug for SavepointContext<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavepointContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}
