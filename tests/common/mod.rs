//! Shared helpers for the manager integration tests
//!
//! Managers here run with intervals in the tens of milliseconds so that
//! lease handover and feed processing complete well inside a test timeout.

#![allow(dead_code)]

use std::time::Duration;
use warden::config::{FileIndexConfig, LockConfig, RuleManagerConfig};
use warden::inference::ENTITY_TYPE_RELATIONSHIP;
use warden::stream::{EventData, EventType, NewEvent, PatchOp, StreamConfig};

/// Upper bound for anything a test waits on
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Short leases so a crashed holder is replaced quickly
pub fn lock_config() -> LockConfig {
    LockConfig {
        ttl_ms: 600,
        retry_delay_ms: 10,
    }
}

fn fast_stream(stream: StreamConfig) -> StreamConfig {
    stream
        .with_poll_interval(Duration::from_millis(20))
        .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
}

pub fn rule_manager_config() -> RuleManagerConfig {
    let defaults = RuleManagerConfig::default();
    RuleManagerConfig {
        interval_ms: 50,
        stream: fast_stream(defaults.stream.clone()),
        ..defaults
    }
}

pub fn file_index_config() -> FileIndexConfig {
    let defaults = FileIndexConfig::default();
    FileIndexConfig {
        interval_ms: 50,
        stream_interval_ms: 50,
        stream: fast_stream(defaults.stream.clone()),
        ..defaults
    }
}

/// A base `located-at` relationship event
pub fn located_at(event_type: EventType, id: &str, from: &str, to: &str) -> NewEvent {
    let mut data = EventData::new(id, ENTITY_TYPE_RELATIONSHIP);
    data.relationship_type = Some("located-at".to_string());
    data.source_ref = Some(from.to_string());
    data.target_ref = Some(to.to_string());
    NewEvent::new(event_type, data)
}

pub fn delete_relationship(id: &str) -> NewEvent {
    NewEvent::new(
        EventType::Delete,
        EventData::new(id, ENTITY_TYPE_RELATIONSHIP),
    )
}

/// An entity update granting access to `grantee`, for an entity with one file
pub fn restriction_update(entity_id: &str, file_id: &str) -> NewEvent {
    let data = EventData::new(entity_id, "report")
        .with_patch(vec![PatchOp::new("add", "/granted_refs/0")])
        .with_file(file_id);
    NewEvent::new(EventType::Update, data)
}

/// Poll `check` until it holds or [`TIMEOUT`] elapses
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, poll).await.is_ok()
}
