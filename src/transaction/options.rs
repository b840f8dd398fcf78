//! Per-call transaction options and manager configuration.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::transaction::propagation::PropagationBehavior;
use crate::transaction::retry::RetryPolicy;

/// Predicate over an error escaping a transactional scope.
pub type ErrorPredicate = dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync;

/// Options for one transactional scope.
#[derive(Clone)]
pub struct TransactionOptions {
    /// How the scope relates to the ambient transaction.
    pub propagation: PropagationBehavior,
    /// Commit automatically when the owning scope succeeds.
    pub auto_commit: bool,
    /// Ask the resource for a read-only transaction.
    pub read_only: bool,
    /// Name used in logs and diagnostics.
    pub name: Option<String>,
    rollback_for: Option<Arc<ErrorPredicate>>,
    no_rollback_for: Option<Arc<ErrorPredicate>>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            propagation: PropagationBehavior::default(),
            auto_commit: true,
            read_only: false,
            name: None,
            rollback_for: None,
            no_rollback_for: None,
        }
    }
}

impl TransactionOptions {
    /// Create options with the given propagation behavior.
    pub fn new(propagation: PropagationBehavior) -> Self {
        Self {
            propagation,
            ..Default::default()
        }
    }

    /// Set auto_commit flag.
    ///
    /// When off, the owning scope does not commit on success; whatever the
    /// body left uncommitted is rolled back when the scope exits.
    pub fn auto_commit(mut self, value: bool) -> Self {
        self.auto_commit = value;
        self
    }

    /// Set read_only flag.
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Name the transaction.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Roll back only for errors matching `predicate`. Errors that do not
    /// match end the scope as if it succeeded, then propagate.
    pub fn rollback_for<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.rollback_for = Some(Arc::new(predicate));
        self
    }

    /// Never roll back for errors matching `predicate`. Takes precedence over
    /// [`rollback_for`](Self::rollback_for).
    pub fn no_rollback_for<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.no_rollback_for = Some(Arc::new(predicate));
        self
    }

    /// Whether an error escaping the scope triggers a rollback.
    pub fn should_rollback(&self, error: &(dyn StdError + 'static)) -> bool {
        if let Some(no_rollback) = &self.no_rollback_for {
            if no_rollback(error) {
                return false;
            }
        }
        match &self.rollback_for {
            Some(rollback) => rollback(error),
            None => true,
        }
    }
}

impl From<PropagationBehavior> for TransactionOptions {
    fn from(propagation: PropagationBehavior) -> Self {
        Self::new(propagation)
    }
}

impl fmt::Debug for TransactionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionOptions")
            .field("propagation", &self.propagation)
            .field("auto_commit", &self.auto_commit)
            .field("read_only", &self.read_only)
            .field("name", &self.name)
            .field("rollback_for", &self.rollback_for.is_some())
            .field("no_rollback_for", &self.no_rollback_for.is_some())
            .finish()
    }
}

/// Transaction manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Initial commit suppression flag of every new context.
    pub suppress_commit: bool,
    /// Policy used by [`transaction_with_retry`] when none is given.
    ///
    /// [`transaction_with_retry`]: super::TransactionManager::transaction_with_retry
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            suppress_commit: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set suppress_commit flag.
    pub fn suppress_commit(mut self, value: bool) -> Self {
        self.suppress_commit = value;
        self
    }

    /// Set the default retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}
