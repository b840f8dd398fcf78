//! In-memory reference resource.
//!
//! `MemoryStore` plays the role of the database: it holds the durably
//! committed rows and hands out `MemoryConnection`s. Each connection keeps
//! its uncommitted writes in an overlay that is applied to the store on
//! commit. Nested checkpoints snapshot the overlay, so rolling one back only
//! undoes the writes made after it was opened.
//!
//! Every call made against the store is appended to a journal, which makes
//! it easy to assert exactly which physical operations the coordinator
//! issued.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;

use crate::resource::error::{ResourceError, ResourceResult};
use crate::resource::handle::{NestedHandle, ResourceFactory, ResourceHandle};

type RowPath = (String, String);

/// Uncommitted writes; `None` marks a delete.
type Overlay = BTreeMap<RowPath, Option<Value>>;

/// A physical operation recorded in the store journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceCall {
    Open,
    Begin,
    Commit,
    Rollback,
    BeginNested,
    ReleaseNested,
    RollbackNested,
    Flush,
}

/// Shared in-memory store. Clone it to share; it uses Arc internally.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    committed: RwLock<BTreeMap<RowPath, Value>>,
    journal: Mutex<Vec<ResourceCall>>,
    failing_commits: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a committed row.
    pub fn get(&self, table: &str, key: &str) -> Option<Value> {
        self.inner
            .committed
            .read()
            .get(&(table.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of committed rows across all tables.
    pub fn len(&self) -> usize {
        self.inner.committed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All calls made against this store, in order.
    pub fn calls(&self) -> Vec<ResourceCall> {
        self.inner.journal.lock().clone()
    }

    /// How many times a given call was made.
    pub fn call_count(&self, call: ResourceCall) -> usize {
        self.inner
            .journal
            .lock()
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    pub fn clear_calls(&self) {
        self.inner.journal.lock().clear();
    }

    /// Make the next `n` commits fail with a conflict.
    pub fn fail_next_commits(&self, n: usize) {
        self.inner.failing_commits.store(n, Ordering::SeqCst);
    }

    fn record(&self, call: ResourceCall) {
        self.inner.journal.lock().push(call);
    }

    fn take_commit_failure(&self) -> bool {
        self.inner
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply(&self, overlay: Overlay) {
        let mut committed = self.inner.committed.write();
        for (path, value) in overlay {
            match value {
                Some(value) => {
                    committed.insert(path, value);
                }
                None => {
                    committed.remove(&path);
                }
            }
        }
    }
}

impl ResourceFactory for MemoryStore {
    type Resource = MemoryConnection;

    fn open(&self) -> ResourceResult<MemoryConnection> {
        self.record(ResourceCall::Open);
        Ok(MemoryConnection {
            store: self.clone(),
            state: Arc::new(Mutex::new(ConnectionState::default())),
        })
    }
}

#[derive(Default)]
struct ConnectionState {
    pending: Option<Overlay>,
    checkpoints: Vec<Checkpoint>,
    next_checkpoint: u64,
    read_only: bool,
}

struct Checkpoint {
    id: u64,
    snapshot: Overlay,
}

/// A connection to a [`MemoryStore`].
pub struct MemoryConnection {
    store: MemoryStore,
    state: Arc<Mutex<ConnectionState>>,
}

impl MemoryConnection {
    /// Write a row inside the current transaction.
    pub fn put(&mut self, table: &str, key: &str, value: impl Serialize) -> ResourceResult<()> {
        let value = serde_json::to_value(value)?;
        self.write(table, key, Some(value))
    }

    /// Delete a row inside the current transaction.
    pub fn delete(&mut self, table: &str, key: &str) -> ResourceResult<()> {
        self.write(table, key, None)
    }

    /// Read a row, seeing this connection's own uncommitted writes.
    pub fn get(&self, table: &str, key: &str) -> Option<Value> {
        let path = (table.to_string(), key.to_string());
        let state = self.state.lock();
        if let Some(pending) = state.pending.as_ref() {
            if let Some(value) = pending.get(&path) {
                return value.clone();
            }
        }
        drop(state);
        self.store.get(table, key)
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// The store this connection writes to.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn write(&mut self, table: &str, key: &str, value: Option<Value>) -> ResourceResult<()> {
        let mut state = self.state.lock();
        if state.read_only {
            return Err(ResourceError::ReadOnly);
        }
        let pending = state.pending.as_mut().ok_or(ResourceError::NoTransaction)?;
        pending.insert((table.to_string(), key.to_string()), value);
        Ok(())
    }
}

impl ResourceHandle for MemoryConnection {
    type Nested = MemoryCheckpoint;

    fn begin(&mut self) -> ResourceResult<()> {
        self.store.record(ResourceCall::Begin);
        let mut state = self.state.lock();
        if state.pending.is_some() {
            return Err(ResourceError::AlreadyInTransaction);
        }
        state.pending = Some(Overlay::new());
        Ok(())
    }

    fn commit(&mut self) -> ResourceResult<()> {
        self.store.record(ResourceCall::Commit);
        let mut state = self.state.lock();
        if state.pending.is_none() {
            return Err(ResourceError::NoTransaction);
        }
        if self.store.take_commit_failure() {
            return Err(ResourceError::Conflict {
                reason: "injected commit failure".to_string(),
            });
        }
        let overlay = state.pending.take().unwrap_or_default();
        state.checkpoints.clear();
        drop(state);
        self.store.apply(overlay);
        Ok(())
    }

    fn rollback(&mut self) -> ResourceResult<()> {
        self.store.record(ResourceCall::Rollback);
        let mut state = self.state.lock();
        if state.pending.take().is_none() {
            return Err(ResourceError::NoTransaction);
        }
        state.checkpoints.clear();
        Ok(())
    }

    fn begin_nested(&mut self) -> ResourceResult<MemoryCheckpoint> {
        self.store.record(ResourceCall::BeginNested);
        let mut state = self.state.lock();
        let snapshot = state.pending.clone().ok_or(ResourceError::NoTransaction)?;
        state.next_checkpoint += 1;
        let id = state.next_checkpoint;
        state.checkpoints.push(Checkpoint { id, snapshot });
        Ok(MemoryCheckpoint {
            id,
            store: self.store.clone(),
            state: Arc::clone(&self.state),
        })
    }

    fn flush(&mut self) -> ResourceResult<()> {
        self.store.record(ResourceCall::Flush);
        if self.in_transaction() {
            Ok(())
        } else {
            Err(ResourceError::NoTransaction)
        }
    }

    fn set_read_only(&mut self, read_only: bool) -> ResourceResult<()> {
        self.state.lock().read_only = read_only;
        Ok(())
    }
}

/// Nested checkpoint on a [`MemoryConnection`].
pub struct MemoryCheckpoint {
    id: u64,
    store: MemoryStore,
    state: Arc<Mutex<ConnectionState>>,
}

impl MemoryCheckpoint {
    fn position(&self, state: &ConnectionState) -> ResourceResult<usize> {
        state
            .checkpoints
            .iter()
            .position(|c| c.id == self.id)
            .ok_or(ResourceError::CheckpointNotFound(self.id))
    }
}

impl NestedHandle for MemoryCheckpoint {
    fn commit(&mut self) -> ResourceResult<()> {
        self.store.record(ResourceCall::ReleaseNested);
        let mut state = self.state.lock();
        let index = self.position(&state)?;
        state.checkpoints.truncate(index);
        Ok(())
    }

    fn rollback(&mut self) -> ResourceResult<()> {
        self.store.record(ResourceCall::RollbackNested);
        let mut state = self.state.lock();
        let index = self.position(&state)?;
        let checkpoint = state.checkpoints.swap_remove(index);
        state.checkpoints.truncate(index);
        state.pending = Some(checkpoint.snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connect() -> (MemoryStore, MemoryConnection) {
        let store = MemoryStore::new();
        let conn = store.open().unwrap();
        (store, conn)
    }

    #[test]
    fn test_commit_applies_writes() {
        let (store, mut conn) = connect();
        conn.begin().unwrap();
        conn.put("users", "1", json!({"name": "Alice"})).unwrap();

        // visible to the connection, not yet to the store
        assert_eq!(conn.get("users", "1"), Some(json!({"name": "Alice"})));
        assert_eq!(store.get("users", "1"), None);

        conn.commit().unwrap();
        assert_eq!(store.get("users", "1"), Some(json!({"name": "Alice"})));
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (store, mut conn) = connect();
        conn.begin().unwrap();
        conn.put("users", "1", "Alice").unwrap();
        conn.rollback().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_write_outside_transaction_fails() {
        let (_store, mut conn) = connect();
        let err = conn.put("users", "1", "Alice").unwrap_err();
        assert!(matches!(err, ResourceError::NoTransaction));
    }

    #[test]
    fn test_checkpoint_rollback_is_partial() {
        let (store, mut conn) = connect();
        conn.begin().unwrap();
        conn.put("t", "x", 1).unwrap();

        let mut cp = conn.begin_nested().unwrap();
        conn.put("t", "y", 2).unwrap();
        cp.rollback().unwrap();

        conn.put("t", "z", 3).unwrap();
        conn.commit().unwrap();

        assert_eq!(store.get("t", "x"), Some(json!(1)));
        assert_eq!(store.get("t", "y"), None);
        assert_eq!(store.get("t", "z"), Some(json!(3)));
    }

    #[test]
    fn test_outer_checkpoint_rollback_invalidates_inner() {
        let (_store, mut conn) = connect();
        conn.begin().unwrap();
        let mut outer = conn.begin_nested().unwrap();
        let mut inner = conn.begin_nested().unwrap();
        outer.rollback().unwrap();

        let err = inner.commit().unwrap_err();
        assert!(matches!(err, ResourceError::CheckpointNotFound(_)));
    }

    #[test]
    fn test_injected_commit_failure() {
        let (store, mut conn) = connect();
        store.fail_next_commits(1);
        conn.begin().unwrap();
        conn.put("t", "x", 1).unwrap();
        assert!(conn.commit().unwrap_err().is_conflict());

        // the transaction is still open and can be rolled back
        conn.rollback().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let (_store, mut conn) = connect();
        conn.set_read_only(true).unwrap();
        conn.begin().unwrap();
        assert!(matches!(
            conn.put("t", "x", 1).unwrap_err(),
            ResourceError::ReadOnly
        ));
    }

    #[test]
    fn test_journal_records_calls() {
        let (store, mut conn) = connect();
        conn.begin().unwrap();
        conn.flush().unwrap();
        conn.commit().unwrap();
        assert_eq!(
            store.calls(),
            vec![
                ResourceCall::Open,
                ResourceCall::Begin,
                ResourceCall::Flush,
                ResourceCall::Commit
            ]
        );
        assert_eq!(store.call_count(ResourceCall::Commit), 1);
    }
}
