//! FileIndexManager: periodic backfill plus restriction propagation from the feed

use super::collaborators::{EntityStore, FileStorage, SearchIndex, SettingsProvider};
use super::pipeline::IndexingPipeline;
use crate::config::{FileIndexConfig, LockConfig};
use crate::error::ManagerResult;
use crate::lock::LockCoordinator;
use crate::manager::{Manager, ManagerStatus};
use crate::scheduler::{ScheduledTask, Scheduler, SchedulerConfig};
use crate::shutdown::ShutdownSignal;
use crate::storage::{CursorStore, EventLog};
use crate::stream::StreamConsumer;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub const FILE_INDEX_MANAGER_ID: &str = "FILE_INDEX_MANAGER";

/// Tails the feed for restriction changes, but only while indexing is enabled
struct RestrictionStream {
    pipeline: Arc<IndexingPipeline>,
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl ScheduledTask for RestrictionStream {
    fn id(&self) -> &str {
        self.consumer.consumer_id()
    }

    async fn is_enabled(&self) -> bool {
        self.pipeline.is_enabled().await
    }

    /// Tail until stopped, or until indexing is switched off mid-cycle.
    async fn run(&self, signal: &ShutdownSignal) -> ManagerResult<()> {
        let tail_signal = signal.child();
        let tail = async {
            let result = self.consumer.tail(&tail_signal).await;
            tail_signal.request();
            result
        };
        let watch = async {
            let poll = self.consumer.config().poll_interval();
            while !tail_signal.sleep(poll).await {
                if !self.pipeline.is_enabled().await {
                    info!(
                        consumer = %self.consumer.consumer_id(),
                        "indexing disabled, stopping restriction stream"
                    );
                    tail_signal.request();
                }
            }
        };
        let (result, ()) = tokio::join!(tail, watch);
        result
    }
}

/// Collaborators the file index manager drives
pub struct IndexingBackends {
    pub files: Arc<dyn FileStorage>,
    pub search: Arc<dyn SearchIndex>,
    pub entities: Arc<dyn EntityStore>,
    pub settings: Arc<dyn SettingsProvider>,
}

/// Keeps the search index in step with imported files.
///
/// Two schedulers share the lock coordinator: the backfill scan runs every
/// `interval_ms` under `lock_key`, and the restriction stream is tailed by one
/// node at a time under `stream_lock_key`.
pub struct FileIndexManager {
    pipeline: Arc<IndexingPipeline>,
    consumer: Arc<StreamConsumer>,
    scan: Scheduler,
    stream: Scheduler,
}

impl FileIndexManager {
    pub fn new<S>(
        store: Arc<S>,
        backends: IndexingBackends,
        coordinator: LockCoordinator,
        lock: &LockConfig,
        config: &FileIndexConfig,
    ) -> Self
    where
        S: EventLog + CursorStore + 'static,
    {
        let pipeline = Arc::new(IndexingPipeline::new(
            backends.files,
            backends.search,
            backends.entities,
            backends.settings,
            config.clone(),
        ));
        let consumer = Arc::new(StreamConsumer::new(
            store.clone(),
            store,
            pipeline.clone(),
            config.stream.clone(),
        ));
        let scan = Scheduler::new(
            pipeline.clone(),
            coordinator.clone(),
            SchedulerConfig::new(config.lock_key.clone(), config.interval())
                .with_lock_options(lock.options()),
        );
        let stream = Scheduler::new(
            Arc::new(RestrictionStream {
                pipeline: pipeline.clone(),
                consumer: consumer.clone(),
            }),
            coordinator,
            SchedulerConfig::new(config.stream_lock_key.clone(), config.stream_interval())
                .with_lock_options(lock.options())
                .with_run_on_start(true),
        );
        Self {
            pipeline,
            consumer,
            scan,
            stream,
        }
    }

    pub fn pipeline(&self) -> &Arc<IndexingPipeline> {
        &self.pipeline
    }

    pub fn consumer(&self) -> &Arc<StreamConsumer> {
        &self.consumer
    }

    pub fn scan_scheduler(&self) -> &Scheduler {
        &self.scan
    }

    pub fn stream_scheduler(&self) -> &Scheduler {
        &self.stream
    }
}

#[async_trait]
impl Manager for FileIndexManager {
    fn id(&self) -> &str {
        FILE_INDEX_MANAGER_ID
    }

    async fn start(&self) -> bool {
        if !self.pipeline.config().enabled {
            info!(manager = FILE_INDEX_MANAGER_ID, "file index manager disabled");
            return false;
        }
        info!(manager = FILE_INDEX_MANAGER_ID, "starting file index manager");
        let scan = self.scan.start();
        let stream = self.stream.start();
        scan || stream
    }

    async fn shutdown(&self) {
        info!(manager = FILE_INDEX_MANAGER_ID, "stopping file index manager");
        self.stream.shutdown().await;
        self.scan.shutdown().await;
    }

    async fn status(&self) -> ManagerStatus {
        ManagerStatus {
            id: FILE_INDEX_MANAGER_ID.to_string(),
            enabled: self.pipeline.is_enabled().await,
            running: self.scan.is_running() || self.stream.is_running(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::memory::{
        MemoryEntityStore, MemoryFileStorage, MemorySearchIndex, StaticSettings,
    };
    use crate::indexing::types::{PlatformSettings, StoredFile};
    use crate::scheduler::CycleOutcome;
    use crate::storage::MemoryStore;
    use crate::stream::ConsumerState;
    use std::time::Duration;

    struct Fixture {
        manager: FileIndexManager,
        files: Arc<MemoryFileStorage>,
        search: Arc<MemorySearchIndex>,
        settings: Arc<StaticSettings>,
    }

    fn manager(settings: PlatformSettings) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let files = Arc::new(MemoryFileStorage::new());
        let search = Arc::new(MemorySearchIndex::new());
        let settings = Arc::new(StaticSettings::new(settings));
        let backends = IndexingBackends {
            files: files.clone(),
            search: search.clone(),
            entities: Arc::new(MemoryEntityStore::new()),
            settings: settings.clone(),
        };
        let defaults = FileIndexConfig::default();
        let config = FileIndexConfig {
            stream: defaults.stream.clone().with_poll_interval(Duration::from_millis(20)),
            ..defaults
        };
        let coordinator = LockCoordinator::new(store.clone());
        let manager = FileIndexManager::new(
            store,
            backends,
            coordinator,
            &LockConfig::default(),
            &config,
        );
        Fixture {
            manager,
            files,
            search,
            settings,
        }
    }

    #[tokio::test]
    async fn scan_cycle_indexes_under_the_lock() {
        let fixture = manager(PlatformSettings::licensed());
        fixture
            .files
            .put(StoredFile::new("import/a.pdf", 10, "application/pdf"), "a");

        let outcome = fixture.manager.scan_scheduler().run_cycle().await;
        assert_eq!(outcome, CycleOutcome::Completed);
        assert_eq!(fixture.search.documents().len(), 1);
        assert!(fixture.search.last_status().is_some());
    }

    #[tokio::test]
    async fn unlicensed_platform_skips_both_tasks() {
        let fixture = manager(PlatformSettings::default());
        let manager = &fixture.manager;
        fixture
            .files
            .put(StoredFile::new("import/a.pdf", 10, "application/pdf"), "a");

        assert_eq!(manager.scan_scheduler().run_cycle().await, CycleOutcome::Disabled);
        assert_eq!(manager.stream_scheduler().run_cycle().await, CycleOutcome::Disabled);
        assert!(fixture.search.documents().is_empty());
        assert!(!manager.status().await.enabled);
    }

    #[tokio::test]
    async fn revoked_licence_stops_a_running_stream_cycle() {
        let fixture = manager(PlatformSettings::licensed());
        let stream = fixture.manager.stream_scheduler().clone();
        let cycle = tokio::spawn(async move { stream.run_cycle().await });

        let consumer = fixture.manager.consumer().clone();
        tokio::time::timeout(Duration::from_secs(2), async {
            while consumer.state() != ConsumerState::Tailing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        fixture.settings.set(PlatformSettings::default());
        let outcome = tokio::time::timeout(Duration::from_secs(2), cycle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Completed);
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(!fixture.manager.stream_scheduler().is_running());
    }
}
