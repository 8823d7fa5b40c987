//! IndexingPipeline: backfill scans and restriction propagation

use super::collaborators::{EntityStore, FileStorage, SearchIndex, SettingsProvider};
use super::types::{IndexRunStatus, IndexedDocument, ListingOptions, StoredFile};
use crate::config::FileIndexConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::scheduler::ScheduledTask;
use crate::shutdown::ShutdownSignal;
use crate::stream::{EventType, StreamEvent, StreamHandler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Id of the periodic backfill task
pub const FILE_INDEX_SCAN_TASK: &str = "file_index_scan";

/// What a backfill should consider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// Only files modified at or after this instant; everything when absent
    pub since: Option<DateTime<Utc>>,
    pub path_prefix: String,
    pub exclude_path: Option<String>,
    pub max_file_size: u64,
    /// Accepted MIME types; an empty list accepts every type
    pub accept_mime_types: Vec<String>,
}

impl ScanOptions {
    pub fn from_config(config: &FileIndexConfig, since: Option<DateTime<Utc>>) -> Self {
        Self {
            since,
            path_prefix: config.path_prefix.clone(),
            exclude_path: Some(config.exclude_path.clone()).filter(|p| !p.is_empty()),
            max_file_size: config.max_file_size,
            accept_mime_types: config.accept_mime_types.clone(),
        }
    }

    /// Size and type filter
    pub fn accepts(&self, file: &StoredFile) -> bool {
        if file.size > self.max_file_size {
            return false;
        }
        if self.accept_mime_types.is_empty() {
            return true;
        }
        file.mime_type
            .as_ref()
            .is_some_and(|mime| self.accept_mime_types.contains(mime))
    }
}

/// Counts from one backfill
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Files returned by the listing
    pub listed: usize,
    /// Files passing the size and type filter
    pub eligible: usize,
    /// Documents written to the index
    pub indexed: usize,
    /// Documents that kept an existing internal id
    pub reused: usize,
    /// Eligible files whose content could not be loaded
    pub missing: usize,
}

/// A file bound to the internal id it will be indexed under
struct LoadPlan {
    file: StoredFile,
    internal_id: String,
}

/// Moves files from object storage into the search index.
pub struct IndexingPipeline {
    files: Arc<dyn FileStorage>,
    search: Arc<dyn SearchIndex>,
    entities: Arc<dyn EntityStore>,
    settings: Arc<dyn SettingsProvider>,
    config: FileIndexConfig,
}

impl IndexingPipeline {
    pub fn new(
        files: Arc<dyn FileStorage>,
        search: Arc<dyn SearchIndex>,
        entities: Arc<dyn EntityStore>,
        settings: Arc<dyn SettingsProvider>,
        config: FileIndexConfig,
    ) -> Self {
        Self {
            files,
            search,
            entities,
            settings,
            config,
        }
    }

    pub fn config(&self) -> &FileIndexConfig {
        &self.config
    }

    /// Configured on, supported by the search engine and licensed
    pub async fn is_enabled(&self) -> bool {
        if !self.config.enabled || !self.search.attachment_processor_enabled() {
            return false;
        }
        match self.settings.settings().await {
            Ok(settings) => settings.is_licensed(),
            Err(e) => {
                warn!(error = %e, "settings unavailable, treating file indexing as disabled");
                false
            }
        }
    }

    /// Index every eligible file modified since `options.since`.
    ///
    /// Files indexed before keep their internal id, so repeated scans update
    /// documents in place.
    pub async fn full_scan(&self, options: &ScanOptions) -> ManagerResult<ScanReport> {
        let listing = ListingOptions {
            prefix: options.path_prefix.clone(),
            modified_since: options.since,
            exclude_path: options.exclude_path.clone(),
            recursive: true,
        };
        let listed = self.files.list_files(&listing).await?;
        let mut report = ScanReport {
            listed: listed.len(),
            ..ScanReport::default()
        };
        let eligible: Vec<StoredFile> = listed.into_iter().filter(|f| options.accepts(f)).collect();
        report.eligible = eligible.len();
        if eligible.is_empty() {
            debug!(prefix = %options.path_prefix, "no files to index");
            return Ok(report);
        }

        let file_ids: Vec<String> = eligible.iter().map(|f| f.id.clone()).collect();
        let existing: HashMap<String, String> = self
            .search
            .find_indexed(&file_ids)
            .await?
            .into_iter()
            .map(|r| (r.file_id, r.internal_id))
            .collect();

        let plans: Vec<LoadPlan> = eligible
            .into_iter()
            .map(|file| {
                let internal_id = match existing.get(&file.id) {
                    Some(id) => {
                        report.reused += 1;
                        id.clone()
                    }
                    None => Uuid::new_v4().to_string(),
                };
                LoadPlan { file, internal_id }
            })
            .collect();

        let loaded = self.load_documents(plans).await?;
        report.missing = report.eligible - loaded.len();
        report.indexed = self.search.bulk_upsert(loaded).await?;
        info!(
            listed = report.listed,
            eligible = report.eligible,
            indexed = report.indexed,
            reused = report.reused,
            "file index scan complete"
        );
        Ok(report)
    }

    /// Load content with at most `load_concurrency` reads in flight.
    ///
    /// Documents come back in listing order; files that vanished are skipped.
    async fn load_documents(&self, plans: Vec<LoadPlan>) -> ManagerResult<Vec<IndexedDocument>> {
        let semaphore = Arc::new(Semaphore::new(self.config.load_concurrency.max(1)));
        let mut join_set: JoinSet<(usize, ManagerResult<Option<IndexedDocument>>)> = JoinSet::new();

        for (position, plan) in plans.into_iter().enumerate() {
            let sem = semaphore.clone();
            let files = self.files.clone();
            join_set.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (position, Err(ManagerError::HandlerFailure(e.to_string()))),
                };
                let content = match files.file_content(&plan.file.id).await {
                    Ok(content) => content,
                    Err(e) => return (position, Err(e)),
                };
                let document = content.map(|content| IndexedDocument {
                    internal_id: plan.internal_id,
                    file_id: plan.file.id,
                    entity_id: plan.file.entity_id,
                    name: plan.file.name,
                    content,
                    uploaded_at: plan.file.last_modified,
                    indexed_at: None,
                });
                (position, Ok(document))
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (position, result) = joined
                .map_err(|e| ManagerError::HandlerFailure(format!("content load panicked: {}", e)))?;
            match result? {
                Some(document) => results.push((position, document)),
                None => warn!(position, "file disappeared before its content was loaded"),
            }
        }
        results.sort_by_key(|(position, _)| *position);
        Ok(results.into_iter().map(|(_, document)| document).collect())
    }

    /// Backfill from the newest `indexed_at` already in the index, then record the run.
    pub async fn index_since_last_run(&self) -> ManagerResult<ScanReport> {
        let since = self.search.last_indexed_at().await?;
        info!(since = ?since, "indexing imported files");
        let report = self
            .full_scan(&ScanOptions::from_config(&self.config, since))
            .await?;
        self.search
            .save_index_status(&IndexRunStatus {
                finished_at: Utc::now(),
                indexed: report.indexed,
            })
            .await?;
        Ok(report)
    }

    /// Copy an entity's current restrictions onto its indexed files.
    pub async fn on_entity_restriction_change(&self, entity_id: &str) -> ManagerResult<usize> {
        let Some(restrictions) = self.entities.load_restrictions(entity_id).await? else {
            debug!(entity = %entity_id, "entity no longer exists, nothing to propagate");
            return Ok(0);
        };
        let updated = self.search.apply_entity_restrictions(&restrictions).await?;
        info!(entity = %entity_id, documents = updated, "restrictions propagated to indexed files");
        Ok(updated)
    }
}

impl std::fmt::Debug for IndexingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingPipeline")
            .field("config", &self.config)
            .finish()
    }
}

/// Restriction-relevant updates to entities with files
fn restriction_change(event: &StreamEvent) -> Option<&str> {
    let data = &event.data;
    (event.event_type == EventType::Update && data.has_files() && data.touches_restrictions())
        .then_some(data.id.as_str())
}

#[async_trait]
impl StreamHandler for IndexingPipeline {
    async fn handle(&self, batch: &[StreamEvent]) -> ManagerResult<()> {
        for entity_id in batch.iter().filter_map(restriction_change) {
            self.on_entity_restriction_change(entity_id).await?;
        }
        Ok(())
    }
}

/// The pipeline is itself the periodic backfill task
#[async_trait]
impl ScheduledTask for IndexingPipeline {
    fn id(&self) -> &str {
        FILE_INDEX_SCAN_TASK
    }

    async fn is_enabled(&self) -> bool {
        IndexingPipeline::is_enabled(self).await
    }

    async fn run(&self, _signal: &ShutdownSignal) -> ManagerResult<()> {
        self.index_since_last_run().await.map(|_| ())
    }
}
