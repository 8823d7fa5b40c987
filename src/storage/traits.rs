//! Storage trait definitions for the external coordination store

use crate::inference::{Relationship, RelationshipId};
use crate::stream::{NewEvent, StreamEvent};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A named, TTL-bounded lock row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl LockRecord {
    pub fn new(
        key: impl Into<String>,
        holder_id: impl Into<String>,
        acquired_at: DateTime<Utc>,
        ttl_ms: u64,
    ) -> Self {
        Self {
            key: key.into(),
            holder_id: holder_id.into(),
            acquired_at,
            ttl_ms,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + Duration::milliseconds(self.ttl_ms.min(i64::MAX as u64) as i64)
    }

    /// True while the lock still excludes other holders
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

/// Durable read position of one consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCursor {
    pub consumer_id: String,
    pub position: u64,
}

impl StreamCursor {
    pub fn new(consumer_id: impl Into<String>, position: u64) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            position,
        }
    }
}

/// Filter criteria for querying relationships
#[derive(Debug, Clone, Default)]
pub struct RelationFilter {
    /// Filter by relationship type
    pub relation_type: Option<String>,
    /// Filter by source entity
    pub from_id: Option<String>,
    /// Filter by target entity
    pub to_id: Option<String>,
    /// Only relationships produced by this rule
    pub rule_id: Option<String>,
}

impl RelationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, relation_type: impl Into<String>) -> Self {
        self.relation_type = Some(relation_type.into());
        self
    }

    pub fn with_from(mut self, from_id: impl Into<String>) -> Self {
        self.from_id = Some(from_id.into());
        self
    }

    pub fn with_to(mut self, to_id: impl Into<String>) -> Self {
        self.to_id = Some(to_id.into());
        self
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    /// True if the relationship satisfies every set criterion
    pub fn matches(&self, rel: &Relationship) -> bool {
        self.relation_type
            .as_ref()
            .map_or(true, |t| &rel.relation_type == t)
            && self.from_id.as_ref().map_or(true, |f| &rel.from_id == f)
            && self.to_id.as_ref().map_or(true, |t| &rel.to_id == t)
            && self
                .rule_id
                .as_ref()
                .map_or(true, |r| rel.rule_id() == Some(r.as_str()))
    }
}

/// Backing store for mutual-exclusion leases
///
/// Implementations must serialize concurrent `try_acquire` calls on the same
/// key so that exactly one caller observes success per validity window.
pub trait LockStore: Send + Sync {
    /// Claim `record.key` for `record.holder_id`.
    ///
    /// Succeeds when no row exists, when the existing row expired at
    /// `record.acquired_at`, or when the row already belongs to the same holder.
    fn try_acquire(&self, record: &LockRecord) -> StorageResult<bool>;

    /// Extend a lock still owned by `holder_id`. Returns false if another
    /// holder owns it or the row is gone.
    fn renew(&self, key: &str, holder_id: &str, now: DateTime<Utc>, ttl_ms: u64)
        -> StorageResult<bool>;

    /// Release a lock owned by `holder_id`. Returns false if it was not held.
    fn release(&self, key: &str, holder_id: &str) -> StorageResult<bool>;

    /// Load the current row for a key, expired or not
    fn load_lock(&self, key: &str) -> StorageResult<Option<LockRecord>>;
}

/// Durable consumer cursors
pub trait CursorStore: Send + Sync {
    fn load_cursor(&self, consumer_id: &str) -> StorageResult<Option<StreamCursor>>;

    /// Persist a cursor. A position lower than the stored one is ignored.
    fn save_cursor(&self, cursor: &StreamCursor) -> StorageResult<()>;
}

/// Ordered, replayable event log
pub trait EventLog: Send + Sync {
    /// Append an event, returning its assigned position
    fn append(&self, event: NewEvent) -> StorageResult<u64>;

    /// Events with a position strictly greater than `position`, in order
    fn read_after(&self, position: u64, limit: usize) -> StorageResult<Vec<StreamEvent>>;

    /// Position of the newest event (0 when the log is empty)
    fn head_position(&self) -> StorageResult<u64>;
}

/// Graph store for base and derived relationships
pub trait RelationStore: Send + Sync {
    /// Save a relationship (insert or update)
    fn save_relationship(&self, rel: &Relationship) -> StorageResult<()>;

    fn load_relationship(&self, id: &RelationshipId) -> StorageResult<Option<Relationship>>;

    /// Delete a relationship. Returns false if it did not exist.
    fn delete_relationship(&self, id: &RelationshipId) -> StorageResult<bool>;

    /// Find relationships matching filter criteria
    fn find_relationships(&self, filter: &RelationFilter) -> StorageResult<Vec<Relationship>>;

    /// Derived relationships whose explanation cites `support`
    fn find_supported_by(&self, support: &RelationshipId) -> StorageResult<Vec<Relationship>>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
