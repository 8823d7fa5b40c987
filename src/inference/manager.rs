//! RuleManager: the rule engine fed by the change stream under a cluster lease

use super::engine::{InferenceReport, RuleEngine};
use super::rule::RuleCatalog;
use crate::config::{LockConfig, RuleManagerConfig};
use crate::error::{ManagerError, ManagerResult};
use crate::lock::{LockCoordinator, LockOptions};
use crate::manager::{Manager, ManagerStatus};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::shutdown::ShutdownSignal;
use crate::storage::{CursorStore, EventLog, RelationStore};
use crate::stream::StreamConsumer;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub const RULE_MANAGER_ID: &str = "RULE_ENGINE";

/// One-off work on the derived overlay of a single rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMaintenance {
    /// Evaluate the rule over every stored relationship
    Rescan(String),
    /// Remove everything the rule derived
    Purge(String),
}

/// Keeps derived relationships in step with the feed.
///
/// One node at a time tails the feed (guarded by `lock_key`); the supervisor
/// retries every `interval_ms` so another node takes over when the holder
/// stops.
pub struct RuleManager {
    engine: Arc<RuleEngine>,
    consumer: Arc<StreamConsumer>,
    supervisor: Scheduler,
    coordinator: LockCoordinator,
    lock_key: String,
    lock_options: LockOptions,
    enabled: bool,
}

impl RuleManager {
    /// Build the catalog from configuration and wire the engine to the feed
    pub fn new<S>(
        store: Arc<S>,
        coordinator: LockCoordinator,
        lock: &LockConfig,
        config: &RuleManagerConfig,
    ) -> ManagerResult<Self>
    where
        S: EventLog + CursorStore + RelationStore + 'static,
    {
        let catalog = RuleCatalog::from_definitions(config.rules.iter().cloned())?;
        Ok(Self::with_catalog(store, coordinator, lock, config, Arc::new(catalog)))
    }

    pub fn with_catalog<S>(
        store: Arc<S>,
        coordinator: LockCoordinator,
        lock: &LockConfig,
        config: &RuleManagerConfig,
        catalog: Arc<RuleCatalog>,
    ) -> Self
    where
        S: EventLog + CursorStore + RelationStore + 'static,
    {
        let engine = Arc::new(
            RuleEngine::new(catalog, store.clone()).with_max_steps(config.max_cascade_steps),
        );
        let consumer = Arc::new(StreamConsumer::new(
            store.clone(),
            store,
            engine.clone(),
            config.stream.clone(),
        ));
        let supervisor = Scheduler::new(
            consumer.clone(),
            coordinator.clone(),
            SchedulerConfig::new(config.lock_key.clone(), config.interval())
                .with_lock_options(lock.options())
                .with_run_on_start(true),
        );
        Self {
            engine,
            consumer,
            supervisor,
            coordinator,
            lock_key: config.lock_key.clone(),
            lock_options: lock.options(),
            enabled: config.enabled,
        }
    }

    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    pub fn consumer(&self) -> &Arc<StreamConsumer> {
        &self.consumer
    }

    pub fn supervisor(&self) -> &Scheduler {
        &self.supervisor
    }

    /// Run a rescan or purge under the rule manager's lock.
    ///
    /// Fails with `LockUnavailable` while any node is tailing the feed, so
    /// maintenance never interleaves with incremental updates.
    pub async fn maintain(&self, operation: RuleMaintenance) -> ManagerResult<InferenceReport> {
        let engine = self.engine.clone();
        self.coordinator
            .run_exclusive(
                [self.lock_key.as_str()],
                &self.lock_options,
                &ShutdownSignal::new(),
                |_| async move {
                    info!(manager = RULE_MANAGER_ID, operation = ?operation, "running rule maintenance");
                    tokio::task::spawn_blocking(move || match &operation {
                        RuleMaintenance::Rescan(rule_id) => engine.rescan(rule_id),
                        RuleMaintenance::Purge(rule_id) => engine.purge(rule_id),
                    })
                    .await
                    .map_err(|e| {
                        ManagerError::HandlerFailure(format!("rule maintenance panicked: {}", e))
                    })?
                },
            )
            .await
    }
}

#[async_trait]
impl Manager for RuleManager {
    fn id(&self) -> &str {
        RULE_MANAGER_ID
    }

    async fn start(&self) -> bool {
        if !self.enabled {
            info!(manager = RULE_MANAGER_ID, "rule manager disabled");
            return false;
        }
        info!(
            manager = RULE_MANAGER_ID,
            rules = self.engine.catalog().len(),
            "starting rule manager"
        );
        self.supervisor.start()
    }

    async fn shutdown(&self) {
        info!(manager = RULE_MANAGER_ID, "stopping rule manager");
        self.supervisor.shutdown().await;
    }

    async fn status(&self) -> ManagerStatus {
        ManagerStatus {
            id: RULE_MANAGER_ID.to_string(),
            enabled: self.enabled,
            running: self.supervisor.is_running(),
        }
    }
}
