//! nestedtx - A Nested Transaction Coordinator
//!
//! This crate lets application code compose units of work that call into
//! each other while sharing one underlying transactional resource. It
//! provides propagation behaviors (join, isolate in a savepoint, suspend),
//! savepoints with partial rollback, and ordered lifecycle hooks.
//!
//! The store itself is out of scope: anything implementing
//! [`resource::ResourceHandle`] can be coordinated. An in-memory store,
//! [`resource::MemoryStore`], is included.
//!
//! # Example
//!
//! ```
//! use nestedtx::resource::MemoryStore;
//! use nestedtx::transaction::{TransactionError, TransactionManager};
//!
//! let store = MemoryStore::new();
//! let manager = TransactionManager::new(store.clone());
//!
//! manager
//!     .with_transaction(|ctx| -> Result<(), TransactionError> {
//!         let ctx = ctx.expect("required scope has a transaction");
//!         ctx.with_resource(|conn| conn.put("users", "1", "Alice"))?;
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert!(store.get("users", "1").is_some());
//! ```

pub mod resource;
pub mod transaction;
