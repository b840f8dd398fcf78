//! Transaction manager - coordinates transactional scopes.
//!
//! The TransactionManager is the main entry point for transactions.
//! It handles:
//! - Resolving propagation against the thread's current transaction
//! - Opening, joining and isolating (savepoint) scopes
//! - Commit / rollback at scope exit, including rollback filters
//! - Global hooks shared by every transaction
//! - Tracking active transactions and spotting abandoned ones

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};
use ulid::Ulid;

use crate::resource::{ResourceFactory, ResourceHandle};
use crate::transaction::context::{TransactionContext, TransactionInfo, UnwindGuard};
use crate::transaction::current::{self, CurrentFrame};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::hooks::{Hook, HookId, HookRegistry};
use crate::transaction::options::{ManagerConfig, TransactionOptions};
use crate::transaction::propagation::{resolve, Resolution};
use crate::transaction::retry::RetryPolicy;
use crate::transaction::savepoint::SavepointRef;
use crate::transaction::state::TransactionState;

/// Transaction manager - coordinates all transaction operations.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
/// Each thread sees its own current transaction.
pub struct TransactionManager<F: ResourceFactory> {
    inner: Arc<TransactionManagerInner<F>>,
}

struct TransactionManagerInner<F: ResourceFactory> {
    /// Keys this manager's frames on the thread-local stack.
    id: Ulid,
    factory: F,
    config: ManagerConfig,
    global_hooks: Arc<HookRegistry<F::Resource>>,
    /// Top-level transactions by ID.
    active: RwLock<HashMap<String, Weak<TransactionContext<F::Resource>>>>,
}

impl<F: ResourceFactory> Clone for TransactionManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> TransactionManager<F> {
    /// Create a transaction manager opening resources from `factory`.
    pub fn new(factory: F) -> Self {
        Self::with_config(factory, ManagerConfig::default())
    }

    pub fn with_config(factory: F, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner {
                id: Ulid::new(),
                factory,
                config,
                global_hooks: Arc::new(HookRegistry::new()),
                active: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Get a reference to the resource factory.
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    // ==================== Hooks ====================

    /// Register a hook run for every transaction of this manager.
    pub fn register_global_hook(&self, hook: Hook<F::Resource>) -> HookId {
        debug!(hook = hook.name(), phase = %hook.phase(), "global hook registered");
        self.inner.global_hooks.register(hook)
    }

    pub fn unregister_global_hook(&self, id: HookId) -> bool {
        self.inner.global_hooks.unregister(id)
    }

    pub fn global_hooks(&self) -> &HookRegistry<F::Resource> {
        &self.inner.global_hooks
    }

    // ==================== Current Transaction ====================

    /// The transaction visible to this thread, if any.
    pub fn current(&self) -> Option<Arc<TransactionContext<F::Resource>>> {
        current::current(self.inner.id)
    }

    /// Whether this thread is inside an active transaction.
    pub fn in_transaction(&self) -> bool {
        self.current().is_some_and(|ctx| ctx.is_active())
    }

    // ==================== Scoped Transactions ====================

    /// Execute a function within a `Required` transaction.
    pub fn with_transaction<T, E, Func>(&self, f: Func) -> Result<T, E>
    where
        Func: FnOnce(Option<&TransactionContext<F::Resource>>) -> Result<T, E>,
        E: From<TransactionError> + StdError + Send + Sync + 'static,
    {
        self.transaction(&TransactionOptions::default(), f)
    }

    /// Run `f` as a transactional scope.
    ///
    /// The propagation behavior decides whether `f` gets a new transaction,
    /// joins the current one, runs in a savepoint of it, or runs without a
    /// transaction (`f` then receives `None`). Rejected propagation fails
    /// before anything is opened.
    ///
    /// On `Ok` the scope ends normally: an owned transaction commits (unless
    /// `auto_commit` is off, in which case uncommitted work is rolled back),
    /// a joined scope leaves, a savepoint is released. On `Err` the OnError
    /// hooks run, the scope is rolled back and the error is returned as is.
    /// Errors excluded by the rollback filters end the scope normally
    /// instead. A panic in `f` rolls the scope back while unwinding.
    pub fn transaction<T, E, Func>(&self, options: &TransactionOptions, f: Func) -> Result<T, E>
    where
        Func: FnOnce(Option<&TransactionContext<F::Resource>>) -> Result<T, E>,
        E: From<TransactionError> + StdError + Send + Sync + 'static,
    {
        match resolve(options.propagation, self.current())? {
            Resolution::CreateNew => self.run_new(options, f),
            Resolution::Join(ctx) => self.run_joined(options, &ctx, f),
            Resolution::Savepoint(ctx) => self.run_in_savepoint(options, &ctx, f),
            Resolution::Suspend(ctx) => {
                debug!(tx_id = %ctx.id(), "transaction suspended");
                let _frame = CurrentFrame::suspend(self.inner.id);
                f(None)
            }
            Resolution::RunWithout => {
                trace!(propagation = %options.propagation, "running without transaction");
                f(None)
            }
        }
    }

    /// Turn `func` into a function that always runs as a transactional scope.
    pub fn wrap<A, T, E, Func>(
        &self,
        options: TransactionOptions,
        func: Func,
    ) -> impl Fn(A) -> Result<T, E>
    where
        Func: Fn(Option<&TransactionContext<F::Resource>>, A) -> Result<T, E>,
        E: From<TransactionError> + StdError + Send + Sync + 'static,
    {
        let manager = self.clone();
        move |arg| manager.transaction(&options, |ctx| func(ctx, arg))
    }

    /// Run a transactional scope, rerunning it on transient failures.
    ///
    /// Each attempt is a complete scope. Inside an ambient transaction the
    /// scope runs once: retrying a joined scope cannot undo what the
    /// ambient transaction already did.
    pub fn transaction_with_retry<T, E, Func>(
        &self,
        options: &TransactionOptions,
        policy: &RetryPolicy,
        mut f: Func,
    ) -> Result<T, E>
    where
        Func: FnMut(Option<&TransactionContext<F::Resource>>) -> Result<T, E>,
        E: From<TransactionError> + StdError + Send + Sync + 'static,
    {
        if let Some(ambient) = self.current() {
            trace!(tx_id = %ambient.id(), "ambient transaction; retry disabled");
            return self.transaction(options, &mut f);
        }

        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transaction(options, &mut f) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && policy.is_transient(&err) => {
                    let backoff = policy.backoff_for(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient transaction failure; retrying"
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// [`transaction_with_retry`](Self::transaction_with_retry) with the
    /// configured retry policy.
    pub fn with_retry<T, E, Func>(&self, options: &TransactionOptions, f: Func) -> Result<T, E>
    where
        Func: FnMut(Option<&TransactionContext<F::Resource>>) -> Result<T, E>,
        E: From<TransactionError> + StdError + Send + Sync + 'static,
    {
        self.transaction_with_retry(options, &self.inner.config.retry, f)
    }

    /// Run a data-access helper against the current transaction's resource,
    /// joining or starting a `Required` transaction.
    ///
    /// With `commit_now` the helper asks for its work to be committed right
    /// away. While commit is suppressed (the default) that only flushes, so
    /// the work still commits or rolls back with the transaction.
    pub fn execute<T, E, Func>(&self, commit_now: bool, f: Func) -> Result<T, E>
    where
        Func: FnOnce(&mut F::Resource) -> Result<T, E>,
        E: From<TransactionError> + StdError + Send + Sync + 'static,
    {
        self.transaction(&TransactionOptions::default(), |ctx| -> Result<T, E> {
            let ctx = ctx.ok_or_else(|| {
                TransactionError::InvalidOperation("required scope without transaction".into())
            })?;
            let value = ctx.with_resource(f)?;
            if commit_now {
                ctx.request_commit()?;
            }
            Ok(value)
        })
    }

    fn run_new<T, E, Func>(&self, options: &TransactionOptions, f: Func) -> Result<T, E>
    where
        Func: FnOnce(Option<&TransactionContext<F::Resource>>) -> Result<T, E>,
        E: From<TransactionError> + StdError + Send + Sync + 'static,
    {
        let ctx = self.begin(options)?;
        let result = {
            let _frame = CurrentFrame::push(self.inner.id, Arc::clone(&ctx));
            let _unwind = UnwindGuard::transaction(&*ctx);
            f(Some(&*ctx))
        };
        let outcome = self.finish_owned(options, &ctx, result);
        self.mark_completed(ctx.id());
        outcome
    }

    fn finish_owned<T, E>(
        &self,
        options: &TransactionOptions,
        ctx: &TransactionContext<F::Resource>,
        result: Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<TransactionError> + StdError + Send + Sync + 'static,
    {
        match result {
            Ok(value) => {
                match ctx.state() {
                    TransactionState::Active if options.auto_commit => ctx.commit()?,
                    TransactionState::Active => {
                        debug!(tx_id = %ctx.id(), "auto-commit off; rolling back uncommitted work");
                        ctx.rollback()?;
                    }
                    TransactionState::Committed => {
                        trace!(tx_id = %ctx.id(), "transaction committed by its own scope");
                    }
                    TransactionState::RolledBack if !ctx.rolled_back_by_inner_scope() => {
                        trace!(tx_id = %ctx.id(), "transaction rolled back by its own scope");
                    }
                    state => {
                        warn!(tx_id = %ctx.id(), %state, "transaction ended under a scope that succeeded");
                        return Err(ended_under_scope(ctx).into());
                    }
                }
                Ok(value)
            }
            Err(err) => {
                ctx.notify_error(&err);
                if options.should_rollback(&err) {
                    let rollback = ctx.rollback();
                    return Err(chain_rollback(ctx.id(), err, rollback));
                }
                debug!(tx_id = %ctx.id(), error = %err, "error excluded from rollback; committing");
                if ctx.is_active() {
                    if let Err(commit) = ctx.commit() {
                        error!(tx_id = %ctx.id(), error = %commit, "commit after excluded error failed");
                    }
                }
                Err(err)
            }
        }
    }

    fn run_joined<T, E, Func>(
        &self,
        options: &TransactionOptions,
        ctx: &Arc<TransactionContext<F::Resource>>,
        f: Func,
    ) -> Result<T, E>
    where
        Func: FnOnce(Option<&TransactionContext<F::Resource>>) -> Result<T, E>,
        E: From<TransactionError> + StdError + Send + Sync + 'static,
    {
        ctx.begin()?;
        ctx.clear_reported_error();
        let result = {
            let _frame = CurrentFrame::push(self.inner.id, Arc::clone(ctx));
            let _unwind = UnwindGuard::transaction(&**ctx);
            f(Some(&**ctx))
        };

        match result {
            Ok(_) if !ctx.is_active() => Err(ended_under_scope(ctx).into()),
            Ok(value) => {
                ctx.leave();
                ctx.clear_reported_error();
                Ok(value)
            }
            Err(err) => {
                ctx.notify_error(&err);
                if options.should_rollback(&err) {
                    // A joined scope shares the physical transaction; failing
                    // it fails the whole transaction.
                    let rollback = ctx.rollback();
                    return Err(chain_rollback(ctx.id(), err, rollback));
                }
                debug!(tx_id = %ctx.id(), error = %err, "error excluded from rollback; leaving");
                ctx.leave();
                Err(err)
            }
        }
    }

    fn run_in_savepoint<T, E, Func>(
        &self,
        options: &TransactionOptions,
        ctx: &Arc<TransactionContext<F::Resource>>,
        f: Func,
    ) -> Result<T, E>
    where
        Func: FnOnce(Option<&TransactionContext<F::Resource>>) -> Result<T, E>,
        E: From<TransactionError> + StdError + Send + Sync + 'static,
    {
        let savepoint = ctx.savepoint(options.name.as_deref())?;
        debug!(
            tx_id = %ctx.id(),
            savepoint = %savepoint,
            propagation = %options.propagation,
            "scope isolated in savepoint"
        );
        ctx.clear_reported_error();
        let result = {
            let _frame = CurrentFrame::push(self.inner.id, Arc::clone(ctx));
            let _unwind = UnwindGuard::savepoint(&**ctx, savepoint.clone());
            f(Some(&**ctx))
        };

        match result {
            Ok(_) if !ctx.is_active() => Err(ended_under_scope(ctx).into()),
            Ok(value) => {
                ctx.release_savepoint(&savepoint)?;
                ctx.clear_reported_error();
                Ok(value)
            }
            Err(err) => {
                ctx.notify_error(&err);
                if options.should_rollback(&err) {
                    let rollback = ctx.rollback_savepoint(&savepoint);
                    return Err(chain_rollback(ctx.id(), err, rollback));
                }
                debug!(tx_id = %ctx.id(), error = %err, "error excluded from rollback; releasing savepoint");
                release_quietly(ctx, &savepoint);
                Err(err)
            }
        }
    }

    // ==================== Manual Control ====================

    /// Begin a new top-level transaction outside of any scope.
    ///
    /// The context is not made current; end it with
    /// [`commit_transaction`](Self::commit_transaction) or
    /// [`rollback_transaction`](Self::rollback_transaction). Dropping it
    /// while active rolls it back.
    pub fn begin(
        &self,
        options: &TransactionOptions,
    ) -> TransactionResult<Arc<TransactionContext<F::Resource>>> {
        let resource = self.inner.factory.open()?;
        let mut ctx = TransactionContext::new(resource)
            .read_only(options.read_only)
            .suppress_commit(self.inner.config.suppress_commit)
            .with_global_hooks(Arc::clone(&self.inner.global_hooks));
        if let Some(name) = &options.name {
            ctx = ctx.named(name.clone());
        }

        let ctx = Arc::new(ctx);
        ctx.begin()?;

        // Track in active transactions
        {
            let mut active = self.inner.active.write();
            active.retain(|_, tx| tx.strong_count() > 0);
            active.insert(ctx.id().to_string(), Arc::downgrade(&ctx));
        }
        Ok(ctx)
    }

    pub fn commit_transaction(&self, ctx: &TransactionContext<F::Resource>) -> TransactionResult<()> {
        let result = ctx.commit();
        if !ctx.is_active() {
            self.mark_completed(ctx.id());
        }
        result
    }

    pub fn rollback_transaction(
        &self,
        ctx: &TransactionContext<F::Resource>,
    ) -> TransactionResult<()> {
        let result = ctx.rollback();
        if !ctx.is_active() {
            self.mark_completed(ctx.id());
        }
        result
    }

    // ==================== Diagnostics ====================

    /// Get the number of active transactions.
    pub fn active_count(&self) -> usize {
        self.live().len()
    }

    /// Snapshot of every active top-level transaction.
    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        self.live().iter().map(|ctx| ctx.info()).collect()
    }

    /// Check if a transaction is active.
    pub fn is_active(&self, tx_id: &str) -> bool {
        self.get_transaction_info(tx_id).is_some()
    }

    pub fn get_transaction_info(&self, tx_id: &str) -> Option<TransactionInfo> {
        let ctx = self.inner.active.read().get(tx_id)?.upgrade()?;
        ctx.is_active().then(|| ctx.info())
    }

    /// Active transactions older than `max_age`, most likely leaked.
    pub fn stale_transactions(&self, max_age: chrono::Duration) -> Vec<TransactionInfo> {
        let now = Utc::now();
        self.live()
            .iter()
            .filter(|ctx| now - ctx.started_at() > max_age)
            .map(|ctx| ctx.info())
            .collect()
    }

    /// Roll back active transactions older than `max_age`.
    ///
    /// Returns how many were rolled back.
    pub fn cleanup_abandoned(&self, max_age: chrono::Duration) -> usize {
        let now = Utc::now();
        let mut cleaned = 0;
        for ctx in self.live() {
            if now - ctx.started_at() <= max_age {
                continue;
            }
            warn!(tx_id = %ctx.id(), started_at = %ctx.started_at(), "rolling back abandoned transaction");
            match ctx.rollback() {
                Ok(()) => cleaned += 1,
                Err(err) => error!(tx_id = %ctx.id(), error = %err, "abandoned rollback failed"),
            }
            self.mark_completed(ctx.id());
        }
        cleaned
    }

    /// Mark a transaction as completed (committed or aborted).
    pub(crate) fn mark_completed(&self, tx_id: &str) {
        self.inner.active.write().remove(tx_id);
    }

    fn live(&self) -> Vec<Arc<TransactionContext<F::Resource>>> {
        self.inner
            .active
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|ctx| ctx.is_active())
            .collect()
    }
}

impl<F: ResourceFactory> fmt::Debug for TransactionManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("active_count", &self.active_count())
            .field("global_hooks", &self.inner.global_hooks.len())
            .finish()
    }
}

/// Return `err`, chained with the rollback failure if there was one.
fn chain_rollback<E>(tx_id: &str, err: E, rollback: TransactionResult<()>) -> E
where
    E: From<TransactionError> + StdError + Send + Sync + 'static,
{
    match rollback {
        Ok(()) => err,
        Err(rollback) => {
            error!(tx_id, error = %err, rollback_error = %rollback, "rollback failed");
            E::from(TransactionError::rollback_failed(err, rollback))
        }
    }
}

/// Error for a scope that finished normally although its transaction had
/// already ended underneath it.
fn ended_under_scope<R: ResourceHandle>(ctx: &TransactionContext<R>) -> TransactionError {
    if ctx.rolled_back_by_inner_scope() {
        TransactionError::RolledBackByInnerScope {
            tx_id: ctx.id().to_string(),
        }
    } else {
        TransactionError::not_active(ctx.id(), ctx.state())
    }
}

fn release_quietly<R: ResourceHandle>(
    ctx: &TransactionContext<R>,
    savepoint: &SavepointRef,
) {
    if let Err(err) = ctx.release_savepoint(savepoint) {
        error!(tx_id = %ctx.id(), savepoint = %savepoint, error = %err, "savepoint release failed");
    }
}
