//! resource layer for nestedtx
//!
//! This module defines what the coordinator needs from the underlying
//! transactional store. The upper layer (transaction contexts and the
//! manager) only talks to these traits and never to a concrete backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ResourceFactory                         │
//! │            (opens one resource per transaction)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                     ┌─────────────────┐
//!                     │ ResourceHandle  │  begin / commit / rollback / flush
//!                     └─────────────────┘
//!                              │ begin_nested
//!                              ▼
//!                     ┌─────────────────┐
//!                     │  NestedHandle   │  commit / rollback (savepoint)
//!                     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use nestedtx::resource::{MemoryStore, ResourceFactory, ResourceHandle};
//!
//! let store = MemoryStore::new();
//! let mut conn = store.open().unwrap();
//! conn.begin().unwrap();
//! conn.put("users", "1", "Alice").unwrap();
//! conn.commit().unwrap();
//! assert!(store.get("users", "1").is_some());
//! ```

mod error;
mod handle;
mod memory;

pub use error::{BackendError, ResourceError, ResourceResult};
pub use handle::{NestedHandle, ResourceFactory, ResourceHandle};
pub use memory::{MemoryCheckpoint, MemoryConnection, MemoryStore, ResourceCall};
