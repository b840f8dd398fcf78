//! Retry policy for transient transaction failures.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::transaction::error::find_transaction_error;
use crate::transaction::options::ErrorPredicate;

/// How often and how patiently a failed transaction is rerun.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    transient: Option<Arc<ErrorPredicate>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            transient: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Decide which errors are transient. The default looks for a retryable
    /// [`TransactionError`](super::TransactionError) on the source chain.
    pub fn transient_when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.transient = Some(Arc::new(predicate));
        self
    }

    pub fn is_transient(&self, error: &(dyn StdError + 'static)) -> bool {
        match &self.transient {
            Some(predicate) => predicate(error),
            None => find_transaction_error(error).is_some_and(|err| err.is_retryable()),
        }
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let nanos = self.initial_backoff.as_nanos() as f64 * factor;
        if nanos >= self.max_backoff.as_nanos() as f64 || !nanos.is_finite() {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos as u64)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("multiplier", &self.multiplier)
            .field("custom_transient", &self.transient.is_some())
            .finish()
    }
}
