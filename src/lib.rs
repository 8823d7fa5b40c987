//! Warden: cluster-coordinated background managers
//!
//! Several nodes share one coordination store. Background work that must run
//! on a single node at a time is scheduled under a lease, and long-running
//! consumers tail the store's ordered change feed.
//!
//! # Core Concepts
//!
//! - **Leases**: TTL-bound locks with a per-acquisition holder token ([`lock`])
//! - **Schedulers**: interval tasks that run only while holding a lease ([`scheduler`])
//! - **Stream consumers**: at-least-once feed tailing with durable cursors ([`stream`])
//! - **Managers**: the rule engine and the file indexer, built from the above
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use warden::{LockCoordinator, MemoryStore, RuleEngine, RuleCatalog, RelationToRelationRule};
//!
//! let store = Arc::new(MemoryStore::new());
//! let catalog = RuleCatalog::builder()
//!     .rule(RelationToRelationRule::located_at_located())
//!     .build();
//! let engine = RuleEngine::new(Arc::new(catalog), store.clone());
//! let coordinator = LockCoordinator::new(store);
//! assert_eq!(engine.catalog().len(), 1);
//! assert!(coordinator.node_id().starts_with("node-"));
//! ```

pub mod config;
mod error;
pub mod indexing;
pub mod inference;
pub mod lock;
mod manager;
pub mod scheduler;
mod shutdown;
pub mod storage;
pub mod stream;

pub use config::{FileIndexConfig, LockConfig, ManagerConfig, RuleManagerConfig};
pub use error::{ManagerError, ManagerResult};
pub use indexing::{FileIndexManager, IndexingBackends, IndexingPipeline};
pub use inference::{
    InferenceReport, InferenceRule, Relationship, RelationshipId, RelationToRelationRule,
    RuleCatalog, RuleEngine, RuleMaintenance, RuleManager,
};
pub use lock::{Lease, LockCoordinator, LockOptions};
pub use manager::{Manager, ManagerRegistry, ManagerStatus};
pub use scheduler::{ScheduledTask, Scheduler, SchedulerConfig};
pub use shutdown::ShutdownSignal;
pub use storage::{MemoryStore, OpenStore, SqliteStore, StorageError, StorageResult};
pub use stream::{StreamConfig, StreamConsumer, StreamHandler};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
