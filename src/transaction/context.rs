//! Transaction context: the state machine for one logical transaction.
//!
//! A context owns one resource and drives it through
//! `Inactive → Active → {Committed | RolledBack | Failed}`. Re-entrant
//! callers join an active context by calling `begin` again, which only
//! bumps the nesting level; the physical commit happens when the outermost
//! caller commits.
//!
//! Contexts are shared (`Arc`) between the manager's current-context stack
//! and the code running inside the transaction, so all mutable state sits
//! behind locks. Locks are never held while hooks run, which lets hooks use
//! the context freely. Savepoint handles are only driven while the resource
//! lock is held (taken before the savepoint lock), so a nested handle never
//! runs concurrently with [`TransactionContext::with_resource`].

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, trace, warn};
use ulid::Ulid;

use crate::resource::{NestedHandle, ResourceHandle};
use crate::transaction::error::{BoxError, TransactionError, TransactionResult};
use crate::transaction::hooks::{Hook, HookFailure, HookId, HookPhase, HookRegistry};
use crate::transaction::participant::Participant;
use crate::transaction::savepoint::{SavepointContext, SavepointRef};
use crate::transaction::state::TransactionState;

/// Outcome of [`TransactionContext::request_commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitRequest {
    /// Commit was suppressed; pending writes were flushed only.
    Flushed,
    /// Commit was allowed and the resource committed.
    Committed,
}

/// Snapshot of a context for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub id: String,
    pub name: Option<String>,
    pub state: TransactionState,
    pub nesting_level: usize,
    pub open_savepoints: usize,
    pub read_only: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Lifecycle {
    state: TransactionState,
    nesting_level: usize,
}

struct SavepointStack<N: NestedHandle> {
    open: Vec<SavepointContext<N>>,
    next_id: u64,
}

impl<N: NestedHandle> SavepointStack<N> {
    fn position(&self, id: u64) -> Option<usize> {
        self.open.iter().position(|sp| sp.id() == id)
    }
}

/// One logical transaction over one resource.
pub struct TransactionContext<R: ResourceHandle> {
    id: String,
    name: Option<String>,
    started_at: DateTime<Utc>,
    read_only: bool,
    lifecycle: Mutex<Lifecycle>,
    resource: Mutex<R>,
    savepoints: Mutex<SavepointStack<R::Nested>>,
    hooks: HookRegistry<R>,
    global_hooks: Arc<HookRegistry<R>>,
    participants: Mutex<Vec<Arc<dyn Participant>>>,
    data: Mutex<HashMap<String, Value>>,
    suppress_commit: AtomicBool,
    allow_commit_depth: AtomicUsize,
    hook_failures: Mutex<Vec<HookFailure>>,
    /// Set when the rollback happened below the outermost scope.
    inner_rollback: AtomicBool,
    /// Message of the error the OnError hooks last saw.
    reported_error: Mutex<Option<String>>,
}

impl<R: ResourceHandle> TransactionContext<R> {
    /// Create an inactive context owning `resource`.
    pub fn new(resource: R) -> Self {
        Self {
            id: Ulid::new().to_string().to_lowercase(),
            name: None,
            started_at: Utc::now(),
            read_only: false,
            lifecycle: Mutex::new(Lifecycle::default()),
            resource: Mutex::new(resource),
            savepoints: Mutex::new(SavepointStack {
                open: Vec::new(),
                next_id: 0,
            }),
            hooks: HookRegistry::new(),
            global_hooks: Arc::new(HookRegistry::new()),
            participants: Mutex::new(Vec::new()),
            data: Mutex::new(HashMap::new()),
            suppress_commit: AtomicBool::new(true),
            allow_commit_depth: AtomicUsize::new(0),
            hook_failures: Mutex::new(Vec::new()),
            inner_rollback: AtomicBool::new(false),
            reported_error: Mutex::new(None),
        }
    }

    /// Give the transaction a name for logs and diagnostics.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Ask the resource for a read-only transaction on `begin`.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the initial commit suppression flag (default: on).
    pub fn suppress_commit(self, suppress: bool) -> Self {
        self.suppress_commit.store(suppress, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_global_hooks(mut self, global_hooks: Arc<HookRegistry<R>>) -> Self {
        self.global_hooks = global_hooks;
        self
    }

    // ==================== Accessors ====================

    /// Get the transaction ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn state(&self) -> TransactionState {
        self.lifecycle.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// How many scopes currently share this transaction (0 when not active).
    pub fn nesting_level(&self) -> usize {
        self.lifecycle.lock().nesting_level
    }

    /// Number of open savepoints.
    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.lock().open.len()
    }

    /// Names of the open savepoints, outermost first.
    pub fn savepoint_names(&self) -> Vec<String> {
        self.savepoints
            .lock()
            .open
            .iter()
            .map(|sp| sp.name().to_string())
            .collect()
    }

    pub fn info(&self) -> TransactionInfo {
        let lifecycle = self.lifecycle.lock();
        TransactionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            state: lifecycle.state,
            nesting_level: lifecycle.nesting_level,
            open_savepoints: self.savepoint_depth(),
            read_only: self.read_only,
            started_at: self.started_at,
        }
    }

    /// Run `f` with exclusive access to the resource.
    ///
    /// `f` must not call back into this context's transaction control
    /// (savepoints, commit, rollback); those need the resource too.
    pub fn with_resource<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        let mut resource = self.resource.lock();
        f(&mut resource)
    }

    // ==================== Transaction Control ====================

    /// Start the transaction, or join it if it is already active.
    ///
    /// Joining only increments the nesting level and runs no hooks.
    pub fn begin(&self) -> TransactionResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                TransactionState::Active => {
                    lifecycle.nesting_level += 1;
                    trace!(
                        tx_id = %self.id,
                        nesting_level = lifecycle.nesting_level,
                        "joined transaction"
                    );
                    return Ok(());
                }
                TransactionState::Inactive => {}
                state => return Err(TransactionError::not_active(&self.id, state)),
            }
        }

        self.run_fatal_hooks(HookPhase::BeforeBegin)?;

        let started = {
            let mut resource = self.resource.lock();
            resource
                .set_read_only(self.read_only)
                .and_then(|_| resource.begin())
        };
        if let Err(err) = started {
            self.set_state(TransactionState::Failed);
            return Err(err.into());
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = TransactionState::Active;
            lifecycle.nesting_level = 1;
        }
        debug!(tx_id = %self.id, name = ?self.name, "transaction started");

        self.run_logged_hooks(HookPhase::AfterBegin, None);
        Ok(())
    }

    /// Commit the transaction.
    ///
    /// An inner (joined) caller only leaves the transaction; the outermost
    /// caller runs the BeforeCommit hooks, prepares participants and commits
    /// the resource. A failure on that path rolls back before the error is
    /// returned. AfterCommit hook failures never undo the commit.
    pub fn commit(&self) -> TransactionResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != TransactionState::Active {
                return Err(TransactionError::not_active(&self.id, lifecycle.state));
            }
            if lifecycle.nesting_level > 1 {
                lifecycle.nesting_level -= 1;
                trace!(
                    tx_id = %self.id,
                    nesting_level = lifecycle.nesting_level,
                    "inner commit deferred to outermost scope"
                );
                return Ok(());
            }
        }

        if let Err(err) = self
            .run_fatal_hooks(HookPhase::BeforeCommit)
            .and_then(|_| self.prepare_participants())
        {
            return Err(self.abort(err));
        }

        if let Err(err) = self.commit_resource() {
            self.set_state(TransactionState::Failed);
            return Err(self.abort(err));
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = TransactionState::Committed;
            lifecycle.nesting_level = 0;
        }
        debug!(tx_id = %self.id, "transaction committed");

        self.run_logged_hooks(HookPhase::AfterCommit, None);
        self.notify_participants(true);
        Ok(())
    }

    /// Roll back the transaction.
    ///
    /// No-op unless the transaction is active or failed. Hook failures are
    /// logged and never stop the rollback.
    pub fn rollback(&self) -> TransactionResult<()> {
        let state = self.state();
        if !state.can_roll_back() {
            trace!(tx_id = %self.id, %state, "rollback ignored");
            return Ok(());
        }

        self.run_logged_hooks(HookPhase::BeforeRollback, None);

        {
            let mut stack = self.savepoints.lock();
            for savepoint in stack.open.iter_mut() {
                savepoint.discard();
            }
            stack.open.clear();
        }

        let result = self.resource.lock().rollback();

        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.nesting_level > 1 {
                self.inner_rollback.store(true, Ordering::SeqCst);
            }
            lifecycle.nesting_level = 0;
            if let Err(err) = result {
                lifecycle.state = TransactionState::Failed;
                drop(lifecycle);
                error!(tx_id = %self.id, error = %err, "resource rollback failed");
                return Err(err.into());
            }
            lifecycle.state = TransactionState::RolledBack;
        }
        debug!(tx_id = %self.id, "transaction rolled back");

        self.run_logged_hooks(HookPhase::AfterRollback, None);
        self.notify_participants(false);
        Ok(())
    }

    /// Flush and commit the resource right now while staying active.
    ///
    /// Everything written so far becomes durable and can no longer be rolled
    /// back by this transaction. Rejected while savepoints are open.
    pub fn force_flush_and_commit(&self) -> TransactionResult<()> {
        self.ensure_active()?;
        let open = self.savepoint_depth();
        if open > 0 {
            return Err(TransactionError::InvalidOperation(format!(
                "cannot force a commit with {} savepoint(s) open",
                open
            )));
        }

        warn!(
            tx_id = %self.id,
            "forcing intermediate commit; earlier writes are no longer atomic with the rest"
        );
        let result = {
            let mut resource = self.resource.lock();
            resource
                .flush()
                .and_then(|_| resource.commit())
                .and_then(|_| resource.begin())
        };
        if let Err(err) = result {
            self.set_state(TransactionState::Failed);
            return Err(err.into());
        }
        Ok(())
    }

    // ==================== Commit Suppression ====================

    /// Whether commit requests are currently downgraded to flushes.
    pub fn commit_suppressed(&self) -> bool {
        self.suppress_commit.load(Ordering::SeqCst)
            && self.allow_commit_depth.load(Ordering::SeqCst) == 0
    }

    pub fn set_suppress_commit(&self, suppress: bool) {
        self.suppress_commit.store(suppress, Ordering::SeqCst);
    }

    pub fn allow_commit_depth(&self) -> usize {
        self.allow_commit_depth.load(Ordering::SeqCst)
    }

    /// Lift commit suppression until the returned guard is dropped.
    ///
    /// Commits made under the guard still go through this transaction's
    /// resource. Pair with `RequiresNew` for work that must outlive a later
    /// rollback of the enclosing scope.
    pub fn allow_commit(&self) -> AllowCommitGuard<'_> {
        self.allow_commit_depth.fetch_add(1, Ordering::SeqCst);
        AllowCommitGuard {
            depth: &self.allow_commit_depth,
        }
    }

    /// Entry point for code that wants to "commit now".
    ///
    /// While suppressed the pending writes are only flushed, so they are
    /// visible inside the transaction but become durable with it. Otherwise
    /// this is [`force_flush_and_commit`](Self::force_flush_and_commit).
    pub fn request_commit(&self) -> TransactionResult<CommitRequest> {
        self.ensure_active()?;
        if self.commit_suppressed() {
            self.resource.lock().flush()?;
            trace!(tx_id = %self.id, "commit request downgraded to flush");
            return Ok(CommitRequest::Flushed);
        }
        self.force_flush_and_commit()?;
        Ok(CommitRequest::Committed)
    }

    // ==================== Savepoints ====================

    /// Open a savepoint. Without a name one is generated (`sp_<n>`), unique
    /// within this context.
    pub fn savepoint(&self, name: Option<&str>) -> TransactionResult<SavepointRef> {
        self.ensure_active()?;
        let handle = self.resource.lock().begin_nested()?;

        let mut stack = self.savepoints.lock();
        stack.next_id += 1;
        let id = stack.next_id;
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("sp_{}", id),
        };
        let savepoint = SavepointContext::new(id, name, handle);
        let reference = savepoint.to_ref();
        stack.open.push(savepoint);
        trace!(
            tx_id = %self.id,
            savepoint = %reference,
            depth = stack.open.len(),
            "savepoint opened"
        );
        Ok(reference)
    }

    /// Release a savepoint into the enclosing scope.
    ///
    /// Only the innermost savepoint can be released. A stale reference is a
    /// no-op.
    pub fn release_savepoint(&self, savepoint: &SavepointRef) -> TransactionResult<()> {
        let _resource = self.resource.lock();
        let mut stack = self.savepoints.lock();
        let index = match stack.position(savepoint.id) {
            Some(index) => index,
            None => {
                trace!(tx_id = %self.id, savepoint = %savepoint, "stale savepoint release ignored");
                return Ok(());
            }
        };

        let open_above = stack.open.len() - index - 1;
        if open_above > 0 {
            return Err(TransactionError::SavepointOutOfOrder {
                name: savepoint.name.clone(),
                open_above,
            });
        }

        stack.open[index].release()?;
        stack.open.pop();
        trace!(tx_id = %self.id, savepoint = %savepoint, "savepoint released");
        Ok(())
    }

    /// Roll back to a savepoint, discarding it and every savepoint opened
    /// after it. A stale reference is a no-op.
    pub fn rollback_savepoint(&self, savepoint: &SavepointRef) -> TransactionResult<()> {
        let _resource = self.resource.lock();
        let mut stack = self.savepoints.lock();
        let index = match stack.position(savepoint.id) {
            Some(index) => index,
            None => {
                trace!(tx_id = %self.id, savepoint = %savepoint, "stale savepoint rollback ignored");
                return Ok(());
            }
        };

        let mut first_error = None;
        while stack.open.len() > index {
            if let Some(mut inner) = stack.open.pop() {
                if let Err(err) = inner.rollback() {
                    first_error.get_or_insert(err);
                }
            }
        }
        trace!(tx_id = %self.id, savepoint = %savepoint, "rolled back to savepoint");

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Roll back to the most recent savepoint called `name`.
    pub fn rollback_to_savepoint(&self, name: &str) -> TransactionResult<()> {
        let reference = self
            .savepoints
            .lock()
            .open
            .iter()
            .rev()
            .find(|sp| sp.name() == name)
            .map(SavepointContext::to_ref)
            .ok_or_else(|| TransactionError::SavepointNotFound(name.to_string()))?;
        self.rollback_savepoint(&reference)
    }

    /// Run `f` inside a savepoint.
    ///
    /// The savepoint is released when `f` succeeds and rolled back when it
    /// fails or panics; the error is returned unchanged unless the rollback
    /// fails too, in which case both are reported.
    pub fn with_savepoint<T, E, F>(&self, name: Option<&str>, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<TransactionError> + StdError + Send + Sync + 'static,
    {
        let savepoint = self.savepoint(name)?;
        let result = {
            let _guard = UnwindGuard::savepoint(self, savepoint.clone());
            f(self)
        };

        match result {
            Ok(value) => {
                self.release_savepoint(&savepoint)?;
                Ok(value)
            }
            Err(err) => match self.rollback_savepoint(&savepoint) {
                Ok(()) => Err(err),
                Err(rollback) => Err(TransactionError::rollback_failed(err, rollback).into()),
            },
        }
    }

    // ==================== Hooks & Participants ====================

    /// Hooks local to this context.
    pub fn hooks(&self) -> &HookRegistry<R> {
        &self.hooks
    }

    /// Register a hook local to this context.
    pub fn register_hook(&self, hook: Hook<R>) -> HookId {
        self.hooks.register(hook)
    }

    /// Enlist a participant that follows this transaction's outcome.
    pub fn enlist(&self, participant: Arc<dyn Participant>) {
        debug!(tx_id = %self.id, participant = participant.name(), "participant enlisted");
        self.participants.lock().push(participant);
    }

    pub fn participant_count(&self) -> usize {
        self.participants.lock().len()
    }

    /// Non-fatal hook and participant failures collected so far.
    pub fn hook_failures(&self) -> Vec<HookFailure> {
        self.hook_failures.lock().clone()
    }

    pub fn take_hook_failures(&self) -> Vec<HookFailure> {
        std::mem::take(&mut *self.hook_failures.lock())
    }

    /// Run the OnError hooks for `error`.
    ///
    /// An error that propagates unchanged out of several scopes is reported
    /// once; [`clear_reported_error`](Self::clear_reported_error) re-arms
    /// reporting.
    pub(crate) fn notify_error(&self, error: &(dyn StdError + 'static)) {
        let message = error.to_string();
        {
            let mut reported = self.reported_error.lock();
            if reported.as_deref() == Some(message.as_str()) {
                trace!(tx_id = %self.id, error = %message, "error already reported");
                return;
            }
            *reported = Some(message);
        }
        self.run_logged_hooks(HookPhase::OnError, Some(error));
    }

    /// Forget the last reported error. Called when a scope starts or ends
    /// normally, since any error after that is a new one.
    pub(crate) fn clear_reported_error(&self) {
        *self.reported_error.lock() = None;
    }

    /// Whether the transaction was rolled back from a joined scope rather
    /// than by its outermost caller.
    pub fn rolled_back_by_inner_scope(&self) -> bool {
        self.inner_rollback.load(Ordering::SeqCst)
    }

    // ==================== Data Bag ====================

    /// Store a value for other hooks and scopes of this transaction.
    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> TransactionResult<()> {
        let value = serde_json::to_value(value)?;
        self.data.lock().insert(key.into(), value);
        Ok(())
    }

    /// Read a value back as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> TransactionResult<Option<T>> {
        match self.get_value(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.lock().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    // ==================== Internals ====================

    /// Leave a joined scope without committing.
    pub(crate) fn leave(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == TransactionState::Active && lifecycle.nesting_level > 1 {
            lifecycle.nesting_level -= 1;
        }
    }

    fn ensure_active(&self) -> TransactionResult<()> {
        let state = self.state();
        if state != TransactionState::Active {
            return Err(TransactionError::not_active(&self.id, state));
        }
        Ok(())
    }

    fn set_state(&self, state: TransactionState) {
        self.lifecycle.lock().state = state;
    }

    fn commit_resource(&self) -> TransactionResult<()> {
        let mut resource = self.resource.lock();
        {
            let mut stack = self.savepoints.lock();
            while let Some(mut savepoint) = stack.open.pop() {
                debug!(
                    tx_id = %self.id,
                    savepoint = savepoint.name(),
                    "releasing savepoint left open at commit"
                );
                savepoint.release()?;
            }
        }
        resource.commit()?;
        Ok(())
    }

    /// Roll back after a failed commit, keeping the original error in front.
    fn abort(&self, err: TransactionError) -> TransactionError {
        self.notify_error(&err);
        match self.rollback() {
            Ok(()) => err,
            Err(rollback) => {
                error!(
                    tx_id = %self.id,
                    error = %err,
                    rollback_error = %rollback,
                    "rollback after failed commit also failed"
                );
                TransactionError::rollback_failed(err, rollback)
            }
        }
    }

    fn phase_hooks(&self, phase: HookPhase) -> Vec<Hook<R>> {
        HookRegistry::merged(phase, &[&self.global_hooks, &self.hooks])
    }

    fn run_fatal_hooks(&self, phase: HookPhase) -> TransactionResult<()> {
        for hook in self.phase_hooks(phase) {
            if let Err(source) = hook.invoke(self, None) {
                warn!(
                    tx_id = %self.id,
                    hook = hook.name(),
                    %phase,
                    error = %source,
                    "hook failed; aborting"
                );
                return Err(TransactionError::HookFailed {
                    hook: hook.name().to_string(),
                    phase,
                    source,
                });
            }
        }
        Ok(())
    }

    fn run_logged_hooks(&self, phase: HookPhase, error: Option<&(dyn StdError + 'static)>) {
        for hook in self.phase_hooks(phase) {
            if let Err(err) = hook.invoke(self, error) {
                self.record_failure(hook.name(), phase, &err);
            }
        }
    }

    fn record_failure(&self, name: &str, phase: HookPhase, err: &BoxError) {
        warn!(tx_id = %self.id, hook = name, %phase, error = %err, "hook failed; continuing");
        self.hook_failures
            .lock()
            .push(HookFailure::new(name, phase, err));
    }

    fn participants_snapshot(&self) -> Vec<Arc<dyn Participant>> {
        self.participants.lock().clone()
    }

    fn prepare_participants(&self) -> TransactionResult<()> {
        for participant in self.participants_snapshot() {
            participant
                .prepare()
                .map_err(|source| TransactionError::HookFailed {
                    hook: participant.name().to_string(),
                    phase: HookPhase::BeforeCommit,
                    source,
                })?;
        }
        Ok(())
    }

    fn notify_participants(&self, committed: bool) {
        for participant in self.participants_snapshot() {
            let (phase, result) = if committed {
                (HookPhase::AfterCommit, participant.commit())
            } else {
                (HookPhase::AfterRollback, participant.rollback())
            };
            if let Err(err) = result {
                self.record_failure(participant.name(), phase, &err);
            }
        }
    }
}

impl<R: ResourceHandle> Drop for TransactionContext<R> {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut();
        if lifecycle.state == TransactionState::Active {
            warn!(tx_id = %self.id, "transaction dropped while active; rolling back");
            lifecycle.state = TransactionState::RolledBack;
            if let Err(err) = self.resource.get_mut().rollback() {
                error!(tx_id = %self.id, error = %err, "rollback on drop failed");
            }
        }
    }
}

impl<R: ResourceHandle> fmt::Debug for TransactionContext<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("nesting_level", &self.nesting_level())
            .field("savepoints", &self.savepoint_names())
            .finish()
    }
}

/// Keeps commit suppression lifted while alive.
#[must_use = "commit suppression is restored as soon as the guard is dropped"]
pub struct AllowCommitGuard<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for AllowCommitGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Rolls back a transaction or savepoint if the scope unwinds from a panic.
pub(crate) struct UnwindGuard<'a, R: ResourceHandle> {
    ctx: &'a TransactionContext<R>,
    savepoint: Option<SavepointRef>,
}

impl<'a, R: ResourceHandle> UnwindGuard<'a, R> {
    pub(crate) fn transaction(ctx: &'a TransactionContext<R>) -> Self {
        Self {
            ctx,
            savepoint: None,
        }
    }

    pub(crate) fn savepoint(ctx: &'a TransactionContext<R>, savepoint: SavepointRef) -> Self {
        Self {
            ctx,
            savepoint: Some(savepoint),
        }
    }
}

impl<R: ResourceHandle> Drop for UnwindGuard<'_, R> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        warn!(tx_id = %self.ctx.id, "scope panicked; rolling back");
        let result = match &self.savepoint {
            Some(savepoint) => self.ctx.rollback_savepoint(savepoint),
            None => self.ctx.rollback(),
        };
        if let Err(err) = result {
            error!(tx_id = %self.ctx.id, error = %err, "rollback during unwind failed");
        }
    }
}
