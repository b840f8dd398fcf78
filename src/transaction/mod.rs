//! Nested transaction coordination.
//!
//! Scopes are opened through the [`TransactionManager`]. The first scope on
//! a thread creates a [`TransactionContext`] over a fresh resource; scopes
//! opened inside it join that context, isolate themselves in a savepoint,
//! or step outside of it, depending on their [`PropagationBehavior`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionManager                        │
//! │  (resolves propagation, owns scopes, global hooks, tracking)│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │       │ Propagation │       │   Current   │
//!  │  Context    │       │  Resolver   │       │  (per thread)│
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!        │
//!        ├── Savepoint stack (LIFO)
//!        ├── Hook registry (+ global hooks)
//!        └── Participants
//! ```
//!
//! # Usage
//!
//! ```
//! use nestedtx::resource::MemoryStore;
//! use nestedtx::transaction::{
//!     PropagationBehavior, TransactionError, TransactionManager, TransactionOptions,
//! };
//!
//! let store = MemoryStore::new();
//! let manager = TransactionManager::new(store.clone());
//!
//! manager
//!     .with_transaction(|ctx| -> Result<(), TransactionError> {
//!         let ctx = ctx.expect("required scope has a transaction");
//!         ctx.with_resource(|conn| conn.put("orders", "1", "placed"))?;
//!
//!         // A failing step only undoes its own writes.
//!         let step: Result<(), TransactionError> = manager.transaction(
//!             &TransactionOptions::new(PropagationBehavior::Nested),
//!             |ctx| {
//!                 let ctx = ctx.expect("nested scope has a transaction");
//!                 ctx.with_resource(|conn| conn.put("orders", "2", "placed"))?;
//!                 Err(TransactionError::InvalidOperation("out of stock".into()))
//!             },
//!         );
//!         assert!(step.is_err());
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert!(store.get("orders", "1").is_some());
//! assert!(store.get("orders", "2").is_none());
//! ```

mod context;
mod current;
mod error;
mod hooks;
mod manager;
mod options;
mod participant;
mod propagation;
mod retry;
mod savepoint;
mod state;

pub use context::{AllowCommitGuard, CommitRequest, TransactionContext, TransactionInfo};
pub use error::{find_transaction_error, BoxError, TransactionError, TransactionResult};
pub use hooks::{Hook, HookFailure, HookId, HookPhase, HookRegistry, HookResult};
pub use manager::TransactionManager;
pub use options::{ErrorPredicate, ManagerConfig, TransactionOptions};
pub use participant::Participant;
pub use propagation::{resolve, PropagationBehavior, Resolution};
pub use retry::RetryPolicy;
pub use savepoint::{SavepointContext, SavepointRef, SavepointState};
pub use state::TransactionState;
