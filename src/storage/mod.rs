//! Coordination store backends
//!
//! Locks, cursors, the change feed and the relationship graph live in an
//! external store shared by every node. `SqliteStore` persists them in one
//! database file; `MemoryStore` keeps them in-process for tests and
//! single-node runs.

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    CursorStore, EventLog, LockRecord, LockStore, OpenStore, RelationFilter, RelationStore,
    StorageError, StorageResult, StreamCursor,
};
