//! Lifecycle hooks.
//!
//! Hooks are callbacks attached to a [`HookPhase`]. They live either in the
//! manager's global registry (run for every transaction) or in a context's
//! local registry. At execution time both are merged and run in ascending
//! priority; hooks with equal priority run in registration order.

use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use ulid::Ulid;

use crate::resource::ResourceHandle;
use crate::transaction::context::TransactionContext;
use crate::transaction::error::BoxError;

/// What a hook body returns.
pub type HookResult = Result<(), BoxError>;

type LifecycleFn<R> = dyn Fn(&TransactionContext<R>) -> HookResult + Send + Sync;
type ErrorFn<R> =
    dyn Fn(&TransactionContext<R>, &(dyn StdError + 'static)) -> HookResult + Send + Sync;

/// Registration order across every registry in the process, so global and
/// local hooks with equal priority still run in the order they were added.
static REGISTRATION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Point in the transaction lifecycle at which a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HookPhase {
    BeforeBegin,
    AfterBegin,
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
    OnError,
}

impl HookPhase {
    /// Whether a failing hook aborts the operation. Every other phase only
    /// logs and collects the failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HookPhase::BeforeBegin | HookPhase::BeforeCommit)
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookPhase::BeforeBegin => "before_begin",
            HookPhase::AfterBegin => "after_begin",
            HookPhase::BeforeCommit => "before_commit",
            HookPhase::AfterCommit => "after_commit",
            HookPhase::BeforeRollback => "before_rollback",
            HookPhase::AfterRollback => "after_rollback",
            HookPhase::OnError => "on_error",
        };
        f.write_str(name)
    }
}

/// Unique hook identifier, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(Ulid);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum HookBody<R: ResourceHandle> {
    Lifecycle(Arc<LifecycleFn<R>>),
    Error(Arc<ErrorFn<R>>),
}

impl<R: ResourceHandle> Clone for HookBody<R> {
    fn clone(&self) -> Self {
        match self {
            HookBody::Lifecycle(f) => HookBody::Lifecycle(Arc::clone(f)),
            HookBody::Error(f) => HookBody::Error(Arc::clone(f)),
        }
    }
}

/// A lifecycle callback.
pub struct Hook<R: ResourceHandle> {
    id: HookId,
    name: String,
    phase: HookPhase,
    priority: i32,
    seq: u64,
    body: HookBody<R>,
}

impl<R: ResourceHandle> Hook<R> {
    /// Create a hook for `phase` with priority 0.
    ///
    /// An `OnError` hook created this way runs without seeing the error; use
    /// [`Hook::on_error`] to receive it.
    pub fn new<F>(phase: HookPhase, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&TransactionContext<R>) -> HookResult + Send + Sync + 'static,
    {
        Self {
            id: HookId(Ulid::new()),
            name: name.into(),
            phase,
            priority: 0,
            seq: 0,
            body: HookBody::Lifecycle(Arc::new(body)),
        }
    }

    /// Create an `OnError` hook receiving the triggering error.
    pub fn on_error<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&TransactionContext<R>, &(dyn StdError + 'static)) -> HookResult
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: HookId(Ulid::new()),
            name: name.into(),
            phase: HookPhase::OnError,
            priority: 0,
            seq: 0,
            body: HookBody::Error(Arc::new(body)),
        }
    }

    /// Set the priority. Lower runs first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> HookId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> HookPhase {
        self.phase
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub(crate) fn invoke(
        &self,
        ctx: &TransactionContext<R>,
        error: Option<&(dyn StdError + 'static)>,
    ) -> HookResult {
        match (&self.body, error) {
            (HookBody::Error(body), Some(error)) => body(ctx, error),
            (HookBody::Error(_), None) => Ok(()),
            (HookBody::Lifecycle(body), _) => body(ctx),
        }
    }
}

impl<R: ResourceHandle> Clone for Hook<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            phase: self.phase,
            priority: self.priority,
            seq: self.seq,
            body: self.body.clone(),
        }
    }
}

impl<R: ResourceHandle> fmt::Debug for Hook<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Ordered collection of hooks.
pub struct HookRegistry<R: ResourceHandle> {
    hooks: RwLock<Vec<Hook<R>>>,
}

impl<R: ResourceHandle> Default for HookRegistry<R> {
    fn default() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }
}

impl<R: ResourceHandle> HookRegistry<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook. Registration order breaks priority ties.
    pub fn register(&self, mut hook: Hook<R>) -> HookId {
        hook.seq = REGISTRATION_SEQ.fetch_add(1, Ordering::Relaxed);
        let id = hook.id;
        self.hooks.write().push(hook);
        id
    }

    /// Remove a hook. Returns false if it was not registered here.
    pub fn unregister(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|h| h.id != id);
        hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    pub fn clear(&self) {
        self.hooks.write().clear();
    }

    /// Hooks for `phase`, in execution order.
    pub fn hooks_for(&self, phase: HookPhase) -> Vec<Hook<R>> {
        Self::merged(phase, &[self])
    }

    /// Hooks for `phase` from several registries, in execution order.
    ///
    /// The result is a snapshot, so hooks may register or unregister hooks
    /// while it is being executed.
    pub(crate) fn merged(phase: HookPhase, registries: &[&HookRegistry<R>]) -> Vec<Hook<R>> {
        let mut hooks: Vec<Hook<R>> = registries
            .iter()
            .flat_map(|registry| {
                registry
                    .hooks
                    .read()
                    .iter()
                    .filter(|h| h.phase == phase)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        hooks.sort_by_key(|h| (h.priority, h.seq));
        hooks
    }
}

impl<R: ResourceHandle> fmt::Debug for HookRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &*self.hooks.read())
            .finish()
    }
}

/// A non-fatal hook failure, kept on the context after being logged.
#[derive(Debug, Clone, Serialize)]
pub struct HookFailure {
    pub hook: String,
    pub phase: HookPhase,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl HookFailure {
    pub(crate) fn new(hook: &str, phase: HookPhase, error: &BoxError) -> Self {
        Self {
            hook: hook.to_string(),
            phase,
            message: error.to_string(),
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MemoryConnection;

    fn noop(phase: HookPhase, name: &str, priority: i32) -> Hook<MemoryConnection> {
        Hook::new(phase, name, |_| Ok(())).with_priority(priority)
    }

    fn names(hooks: &[Hook<MemoryConnection>]) -> Vec<&str> {
        hooks.iter().map(|h| h.name()).collect()
    }

    #[test]
    fn test_priority_order() {
        let registry = HookRegistry::new();
        registry.register(noop(HookPhase::BeforeCommit, "thirty", 30));
        registry.register(noop(HookPhase::BeforeCommit, "ten", 10));
        registry.register(noop(HookPhase::BeforeCommit, "twenty", 20));

        let hooks = registry.hooks_for(HookPhase::BeforeCommit);
        assert_eq!(names(&hooks), vec!["ten", "twenty", "thirty"]);
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let registry = HookRegistry::new();
        registry.register(noop(HookPhase::AfterCommit, "first", 5));
        registry.register(noop(HookPhase::AfterCommit, "second", 5));
        registry.register(noop(HookPhase::AfterCommit, "early", 1));
        registry.register(noop(HookPhase::AfterCommit, "third", 5));

        let hooks = registry.hooks_for(HookPhase::AfterCommit);
        assert_eq!(names(&hooks), vec!["early", "first", "second", "third"]);
    }

    #[test]
    fn test_merged_interleaves_registries() {
        let global = HookRegistry::new();
        let local = HookRegistry::new();
        global.register(noop(HookPhase::AfterBegin, "global-late", 50));
        local.register(noop(HookPhase::AfterBegin, "local-early", 10));
        global.register(noop(HookPhase::AfterBegin, "global-early", 10));
        local.register(noop(HookPhase::BeforeRollback, "other-phase", 0));

        let hooks = HookRegistry::merged(HookPhase::AfterBegin, &[&global, &local]);
        assert_eq!(
            names(&hooks),
            vec!["local-early", "global-early", "global-late"]
        );
    }

    #[test]
    fn test_unregister() {
        let registry = HookRegistry::new();
        let id = registry.register(noop(HookPhase::AfterCommit, "audit", 0));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_fatal_phases() {
        assert!(HookPhase::BeforeBegin.is_fatal());
        assert!(HookPhase::BeforeCommit.is_fatal());
        assert!(!HookPhase::AfterCommit.is_fatal());
        assert!(!HookPhase::BeforeRollback.is_fatal());
        assert!(!HookPhase::OnError.is_fatal());
    }
}
