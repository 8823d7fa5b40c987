//! Rule manager over the change feed: derivation, retraction and failover

mod common;

use common::{delete_relationship, eventually, located_at, lock_config, rule_manager_config};
use std::sync::Arc;
use warden::storage::{CursorStore, EventLog, LockStore, RelationFilter, RelationStore};
use warden::stream::EventType;
use warden::{
    LockCoordinator, Manager, MemoryStore, OpenStore, RuleMaintenance, RuleManager, SqliteStore,
};

fn node(store: &Arc<MemoryStore>, node_id: &str) -> RuleManager {
    RuleManager::new(
        store.clone(),
        LockCoordinator::with_node_id(store.clone(), node_id),
        &lock_config(),
        &rule_manager_config(),
    )
    .unwrap()
}

fn derived_paris_europe<S: RelationStore>(store: &S) -> usize {
    store
        .find_relationships(
            &RelationFilter::new()
                .with_from("paris")
                .with_to("europe")
                .with_rule("located_at_located"),
        )
        .unwrap()
        .len()
}

#[tokio::test]
async fn derives_and_retracts_from_the_feed() {
    let store = Arc::new(MemoryStore::new());
    store
        .append(located_at(EventType::Create, "edge1", "paris", "france"))
        .unwrap();
    store
        .append(located_at(EventType::Create, "edge2", "france", "europe"))
        .unwrap();

    let manager = node(&store, "node-a");
    assert!(manager.start().await);
    assert!(eventually(|| derived_paris_europe(store.as_ref()) == 1).await);
    assert!(manager.status().await.running);

    store.append(delete_relationship("edge1")).unwrap();
    assert!(eventually(|| derived_paris_europe(store.as_ref()) == 0).await);

    manager.shutdown().await;
    assert!(!manager.status().await.running);
    let cursor = store.load_cursor("rule_manager").unwrap().unwrap();
    assert_eq!(cursor.position, store.head_position().unwrap());
}

#[tokio::test]
async fn disabled_manager_does_not_start() {
    let store = Arc::new(MemoryStore::new());
    let mut config = rule_manager_config();
    config.enabled = false;
    let manager = RuleManager::new(
        store.clone(),
        LockCoordinator::new(store.clone()),
        &lock_config(),
        &config,
    )
    .unwrap();

    assert!(!manager.start().await);
    let status = manager.status().await;
    assert!(!status.enabled);
    assert!(!status.running);
}

#[tokio::test]
async fn one_node_tails_and_another_takes_over() {
    let store = Arc::new(MemoryStore::new());
    let a = node(&store, "node-a");
    let b = node(&store, "node-b");
    assert!(a.start().await);
    assert!(b.start().await);

    assert!(eventually(|| a.supervisor().is_running() || b.supervisor().is_running()).await);
    assert!(!(a.supervisor().is_running() && b.supervisor().is_running()));

    store
        .append(located_at(EventType::Create, "edge1", "paris", "france"))
        .unwrap();
    store
        .append(located_at(EventType::Create, "edge2", "france", "europe"))
        .unwrap();
    assert!(eventually(|| derived_paris_europe(store.as_ref()) == 1).await);

    let (holder, standby) = if a.supervisor().is_running() {
        (&a, &b)
    } else {
        (&b, &a)
    };
    holder.shutdown().await;
    assert!(eventually(|| standby.supervisor().is_running()).await);

    // The standby resumes from the shared cursor
    store.append(delete_relationship("edge2")).unwrap();
    assert!(eventually(|| derived_paris_europe(store.as_ref()) == 0).await);

    standby.shutdown().await;
}

#[tokio::test]
async fn restart_resumes_from_the_stored_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warden.db");
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    store
        .append(located_at(EventType::Create, "edge1", "paris", "france"))
        .unwrap();
    store
        .append(located_at(EventType::Create, "edge2", "france", "europe"))
        .unwrap();

    let first = RuleManager::new(
        store.clone(),
        LockCoordinator::with_node_id(store.clone(), "node-a"),
        &lock_config(),
        &rule_manager_config(),
    )
    .unwrap();
    first.start().await;
    assert!(eventually(|| derived_paris_europe(store.as_ref()) == 1).await);
    first.shutdown().await;
    drop(first);

    let reopened = Arc::new(SqliteStore::open(&path).unwrap());
    let head = reopened.head_position().unwrap();
    let second = RuleManager::new(
        reopened.clone(),
        LockCoordinator::with_node_id(reopened.clone(), "node-a"),
        &lock_config(),
        &rule_manager_config(),
    )
    .unwrap();
    second.start().await;
    assert!(eventually(|| second.consumer().position() == head).await);
    assert_eq!(derived_paris_europe(reopened.as_ref()), 1);
    second.shutdown().await;
}

#[tokio::test]
async fn purge_and_rescan_once_the_feed_is_idle() {
    let store = Arc::new(MemoryStore::new());
    store
        .append(located_at(EventType::Create, "edge1", "paris", "france"))
        .unwrap();
    store
        .append(located_at(EventType::Create, "edge2", "france", "europe"))
        .unwrap();

    let manager = node(&store, "node-a");
    manager.start().await;
    assert!(eventually(|| derived_paris_europe(store.as_ref()) == 1).await);
    manager.shutdown().await;

    let purged = manager
        .maintain(RuleMaintenance::Purge("located_at_located".to_string()))
        .await
        .unwrap();
    assert_eq!(purged.retracted, 1);
    assert_eq!(derived_paris_europe(store.as_ref()), 0);

    let rescanned = manager
        .maintain(RuleMaintenance::Rescan("located_at_located".to_string()))
        .await
        .unwrap();
    assert_eq!(rescanned.derived, 1);
    assert_eq!(derived_paris_europe(store.as_ref()), 1);
    // The lease was handed back
    assert!(store.load_lock("rule_engine_lock").unwrap().is_none());
}

#[tokio::test]
async fn maintenance_is_refused_while_a_node_tails() {
    let store = Arc::new(MemoryStore::new());
    store
        .append(located_at(EventType::Create, "edge1", "paris", "france"))
        .unwrap();
    store
        .append(located_at(EventType::Create, "edge2", "france", "europe"))
        .unwrap();

    let tailing = node(&store, "node-a");
    tailing.start().await;
    assert!(eventually(|| tailing.supervisor().is_running()).await);

    let admin = node(&store, "node-b");
    let err = admin
        .maintain(RuleMaintenance::Purge("located_at_located".to_string()))
        .await
        .unwrap_err();
    assert!(err.is_lock_unavailable());
    assert!(eventually(|| derived_paris_europe(store.as_ref()) == 1).await);

    tailing.shutdown().await;
}

