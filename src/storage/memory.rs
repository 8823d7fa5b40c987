//! In-process coordination store
//!
//! Same semantics as the SQLite backend. Several coordinators sharing one
//! `Arc<MemoryStore>` behave like cluster nodes sharing an external store.

use super::traits::{
    CursorStore, EventLog, LockRecord, LockStore, RelationFilter, RelationStore, StorageError,
    StorageResult, StreamCursor,
};
use crate::inference::{Relationship, RelationshipId};
use crate::stream::{NewEvent, StreamEvent};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Mutex;

/// DashMap-backed store for locks, cursors, events and relationships
#[derive(Debug, Default)]
pub struct MemoryStore {
    locks: DashMap<String, LockRecord>,
    cursors: DashMap<String, u64>,
    events: Mutex<Vec<StreamEvent>>,
    relationships: DashMap<RelationshipId, Relationship>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored relationships (base and derived)
    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }
}

impl LockStore for MemoryStore {
    fn try_acquire(&self, record: &LockRecord) -> StorageResult<bool> {
        // The entry guard holds the shard lock, so check-and-set is atomic per key.
        match self.locks.entry(record.key.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.holder_id == record.holder_id
                    || !current.is_valid_at(record.acquired_at)
                {
                    entry.insert(record.clone());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(record.clone());
                Ok(true)
            }
        }
    }

    fn renew(
        &self,
        key: &str,
        holder_id: &str,
        now: DateTime<Utc>,
        ttl_ms: u64,
    ) -> StorageResult<bool> {
        match self.locks.get_mut(key) {
            Some(mut record) if record.holder_id == holder_id => {
                record.acquired_at = now;
                record.ttl_ms = ttl_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, key: &str, holder_id: &str) -> StorageResult<bool> {
        Ok(self
            .locks
            .remove_if(key, |_, record| record.holder_id == holder_id)
            .is_some())
    }

    fn load_lock(&self, key: &str) -> StorageResult<Option<LockRecord>> {
        Ok(self.locks.get(key).map(|r| r.clone()))
    }
}

impl CursorStore for MemoryStore {
    fn load_cursor(&self, consumer_id: &str) -> StorageResult<Option<StreamCursor>> {
        Ok(self
            .cursors
            .get(consumer_id)
            .map(|p| StreamCursor::new(consumer_id, *p)))
    }

    fn save_cursor(&self, cursor: &StreamCursor) -> StorageResult<()> {
        self.cursors
            .entry(cursor.consumer_id.clone())
            .and_modify(|p| *p = (*p).max(cursor.position))
            .or_insert(cursor.position);
        Ok(())
    }
}

impl EventLog for MemoryStore {
    fn append(&self, event: NewEvent) -> StorageResult<u64> {
        let mut events = self.events.lock().map_err(|_| StorageError::Poisoned)?;
        let position = events.len() as u64 + 1;
        events.push(StreamEvent::at_position(event, position));
        Ok(position)
    }

    fn read_after(&self, position: u64, limit: usize) -> StorageResult<Vec<StreamEvent>> {
        let events = self.events.lock().map_err(|_| StorageError::Poisoned)?;
        // Positions are dense and start at 1, so position N sits at index N - 1.
        let start = usize::try_from(position).unwrap_or(usize::MAX).min(events.len());
        Ok(events[start..].iter().take(limit).cloned().collect())
    }

    fn head_position(&self) -> StorageResult<u64> {
        let events = self.events.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(events.len() as u64)
    }
}

impl RelationStore for MemoryStore {
    fn save_relationship(&self, rel: &Relationship) -> StorageResult<()> {
        self.relationships.insert(rel.id.clone(), rel.clone());
        Ok(())
    }

    fn load_relationship(&self, id: &RelationshipId) -> StorageResult<Option<Relationship>> {
        Ok(self.relationships.get(id).map(|r| r.clone()))
    }

    fn delete_relationship(&self, id: &RelationshipId) -> StorageResult<bool> {
        Ok(self.relationships.remove(id).is_some())
    }

    fn find_relationships(&self, filter: &RelationFilter) -> StorageResult<Vec<Relationship>> {
        let mut found: Vec<Relationship> = self
            .relationships
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    fn find_supported_by(&self, support: &RelationshipId) -> StorageResult<Vec<Relationship>> {
        let mut found: Vec<Relationship> = self
            .relationships
            .iter()
            .filter(|r| {
                r.value()
                    .inference
                    .as_ref()
                    .is_some_and(|i| i.justifications.iter().any(|j| j.cites(support)))
            })
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{Inference, Justification};
    use crate::stream::{EventData, EventType};
    use chrono::Duration;

    #[test]
    fn lock_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let t0 = Utc::now();

        assert!(store.try_acquire(&LockRecord::new("k", "a", t0, 1_000)).unwrap());
        assert!(!store.try_acquire(&LockRecord::new("k", "b", t0, 1_000)).unwrap());
        assert!(!store
            .try_acquire(&LockRecord::new("k", "b", t0 + Duration::milliseconds(999), 1_000))
            .unwrap());
        assert!(store
            .try_acquire(&LockRecord::new("k", "b", t0 + Duration::milliseconds(1_000), 1_000))
            .unwrap());
        assert_eq!(store.load_lock("k").unwrap().unwrap().holder_id, "b");
    }

    #[test]
    fn release_only_by_holder() {
        let store = MemoryStore::new();
        store
            .try_acquire(&LockRecord::new("k", "a", Utc::now(), 60_000))
            .unwrap();
        assert!(!store.release("k", "b").unwrap());
        assert!(store.release("k", "a").unwrap());
        assert!(store.load_lock("k").unwrap().is_none());
    }

    #[test]
    fn renew_fails_after_takeover() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.try_acquire(&LockRecord::new("k", "a", t0, 10)).unwrap();
        let later = t0 + Duration::milliseconds(20);
        store.try_acquire(&LockRecord::new("k", "b", later, 10)).unwrap();
        assert!(!store.renew("k", "a", later, 10).unwrap());
        assert!(store.renew("k", "b", later, 10).unwrap());
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let store = MemoryStore::new();
        store.save_cursor(&StreamCursor::new("c", 5)).unwrap();
        store.save_cursor(&StreamCursor::new("c", 3)).unwrap();
        assert_eq!(store.load_cursor("c").unwrap().unwrap().position, 5);
        assert!(store.load_cursor("other").unwrap().is_none());
    }

    #[test]
    fn event_log_reads_in_order_after_position() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let data = EventData::new(format!("e{}", i), "report");
            store.append(NewEvent::new(EventType::Create, data)).unwrap();
        }
        assert_eq!(store.head_position().unwrap(), 5);

        let batch = store.read_after(2, 2).unwrap();
        let positions: Vec<u64> = batch.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![3, 4]);
        assert!(store.read_after(5, 10).unwrap().is_empty());
        assert!(store.read_after(99, 10).unwrap().is_empty());
    }

    #[test]
    fn supported_by_finds_citing_relationships() {
        let store = MemoryStore::new();
        let mut derived = Relationship::new("a", "located-at", "c").with_id("d1");
        derived.inference = Some(Inference::new(
            "r",
            Justification::new("e1".into(), "e2".into()),
        ));
        store.save_relationship(&derived).unwrap();
        store
            .save_relationship(&Relationship::new("a", "located-at", "b").with_id("e1"))
            .unwrap();

        let found = store.find_supported_by(&"e2".into()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "d1");
        assert!(store.find_supported_by(&"d1".into()).unwrap().is_empty());
    }
}
