//! In-process collaborators for tests and local runs

use super::collaborators::{EntityStore, FileStorage, SearchIndex, SettingsProvider};
use super::types::{
    EntityRestrictions, IndexRunStatus, IndexedDocument, IndexedFileRef, ListingOptions,
    PlatformSettings, StoredFile,
};
use crate::error::{ManagerError, ManagerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Object storage backed by a map
#[derive(Debug, Default)]
pub struct MemoryFileStorage {
    files: DashMap<String, (StoredFile, String)>,
    /// Artificial latency per content load
    load_delay: Option<Duration>,
    loads_in_flight: AtomicUsize,
    max_loads_in_flight: AtomicUsize,
}

impl MemoryFileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn put(&self, file: StoredFile, content: impl Into<String>) {
        self.files.insert(file.id.clone(), (file, content.into()));
    }

    pub fn remove(&self, file_id: &str) {
        self.files.remove(file_id);
    }

    /// Highest number of concurrent content loads observed
    pub fn max_loads_in_flight(&self) -> usize {
        self.max_loads_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileStorage for MemoryFileStorage {
    async fn list_files(&self, options: &ListingOptions) -> ManagerResult<Vec<StoredFile>> {
        let mut files: Vec<StoredFile> = self
            .files
            .iter()
            .filter(|entry| options.includes(&entry.value().0))
            .map(|entry| entry.value().0.clone())
            .collect();
        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }

    async fn file_content(&self, file_id: &str) -> ManagerResult<Option<String>> {
        let in_flight = self.loads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_loads_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        let content = self.files.get(file_id).map(|entry| entry.value().1.clone());
        self.loads_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(content)
    }
}

/// A document as held by [`MemorySearchIndex`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub document: IndexedDocument,
    pub restrictions: Option<EntityRestrictions>,
}

/// Search index backed by a map keyed by internal id
#[derive(Debug)]
pub struct MemorySearchIndex {
    documents: DashMap<String, StoredDocument>,
    status: Mutex<Option<IndexRunStatus>>,
    attachment_processor: AtomicBool,
    unavailable: AtomicBool,
}

impl Default for MemorySearchIndex {
    fn default() -> Self {
        Self {
            documents: DashMap::new(),
            status: Mutex::new(None),
            attachment_processor: AtomicBool::new(true),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_attachment_processor(&self, enabled: bool) {
        self.attachment_processor.store(enabled, Ordering::SeqCst);
    }

    /// Make every call fail as if the engine were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn documents(&self) -> Vec<StoredDocument> {
        let mut docs: Vec<StoredDocument> =
            self.documents.iter().map(|e| e.value().clone()).collect();
        docs.sort_by(|a, b| a.document.file_id.cmp(&b.document.file_id));
        docs
    }

    pub fn document_for_file(&self, file_id: &str) -> Option<StoredDocument> {
        self.documents
            .iter()
            .find(|e| e.value().document.file_id == file_id)
            .map(|e| e.value().clone())
    }

    pub fn last_status(&self) -> Option<IndexRunStatus> {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_available(&self) -> ManagerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ManagerError::TransientIo("search index unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn find_indexed(&self, file_ids: &[String]) -> ManagerResult<Vec<IndexedFileRef>> {
        self.check_available()?;
        Ok(self
            .documents
            .iter()
            .filter(|e| file_ids.contains(&e.value().document.file_id))
            .map(|e| IndexedFileRef {
                internal_id: e.value().document.internal_id.clone(),
                file_id: e.value().document.file_id.clone(),
            })
            .collect())
    }

    async fn bulk_upsert(&self, documents: Vec<IndexedDocument>) -> ManagerResult<usize> {
        self.check_available()?;
        let now = Utc::now();
        let count = documents.len();
        for mut document in documents {
            document.indexed_at = Some(now);
            let restrictions = self
                .documents
                .get(&document.internal_id)
                .and_then(|existing| existing.restrictions.clone());
            self.documents.insert(
                document.internal_id.clone(),
                StoredDocument {
                    document,
                    restrictions,
                },
            );
        }
        Ok(count)
    }

    async fn last_indexed_at(&self) -> ManagerResult<Option<DateTime<Utc>>> {
        self.check_available()?;
        Ok(self
            .documents
            .iter()
            .filter_map(|e| e.value().document.indexed_at)
            .max())
    }

    async fn save_index_status(&self, status: &IndexRunStatus) -> ManagerResult<()> {
        self.check_available()?;
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status.clone());
        Ok(())
    }

    async fn apply_entity_restrictions(
        &self,
        restrictions: &EntityRestrictions,
    ) -> ManagerResult<usize> {
        self.check_available()?;
        let mut updated = 0;
        for mut entry in self.documents.iter_mut() {
            if entry.document.entity_id.as_deref() == Some(restrictions.entity_id.as_str()) {
                entry.restrictions = Some(restrictions.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn attachment_processor_enabled(&self) -> bool {
        self.attachment_processor.load(Ordering::SeqCst)
    }
}

/// Entity restrictions backed by a map
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: DashMap<String, EntityRestrictions>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, restrictions: EntityRestrictions) {
        self.entities
            .insert(restrictions.entity_id.clone(), restrictions);
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn load_restrictions(&self, entity_id: &str) -> ManagerResult<Option<EntityRestrictions>> {
        Ok(self.entities.get(entity_id).map(|e| e.value().clone()))
    }
}

/// Settings that only change when told to
#[derive(Debug, Default)]
pub struct StaticSettings {
    settings: Mutex<PlatformSettings>,
}

impl StaticSettings {
    pub fn new(settings: PlatformSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }

    pub fn set(&self, settings: PlatformSettings) {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn settings(&self) -> ManagerResult<PlatformSettings> {
        Ok(self
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(internal_id: &str, file_id: &str, entity_id: Option<&str>) -> IndexedDocument {
        IndexedDocument {
            internal_id: internal_id.into(),
            file_id: file_id.into(),
            entity_id: entity_id.map(String::from),
            name: "a.pdf".into(),
            content: "JVBERi0=".into(),
            uploaded_at: Utc::now(),
            indexed_at: None,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_internal_id() {
        let index = MemorySearchIndex::new();
        index.bulk_upsert(vec![doc("i1", "import/a.pdf", None)]).await.unwrap();
        index.bulk_upsert(vec![doc("i1", "import/a.pdf", None)]).await.unwrap();

        assert_eq!(index.documents().len(), 1);
        assert!(index.last_indexed_at().await.unwrap().is_some());
        let found = index.find_indexed(&["import/a.pdf".to_string()]).await.unwrap();
        assert_eq!(found[0].internal_id, "i1");
    }

    #[tokio::test]
    async fn restrictions_follow_entity_and_survive_reindex() {
        let index = MemorySearchIndex::new();
        index
            .bulk_upsert(vec![
                doc("i1", "import/a.pdf", Some("report-1")),
                doc("i2", "import/b.pdf", Some("report-2")),
            ])
            .await
            .unwrap();
        let restrictions =
            EntityRestrictions::new("report-1").with_markings(vec!["marking--tlp-red".into()]);
        assert_eq!(index.apply_entity_restrictions(&restrictions).await.unwrap(), 1);

        index
            .bulk_upsert(vec![doc("i1", "import/a.pdf", Some("report-1"))])
            .await
            .unwrap();
        let stored = index.document_for_file("import/a.pdf").unwrap();
        assert_eq!(stored.restrictions, Some(restrictions));
        assert!(index.document_for_file("import/b.pdf").unwrap().restrictions.is_none());
    }

    #[tokio::test]
    async fn unavailable_index_reports_transient_failure() {
        let index = MemorySearchIndex::new();
        index.set_unavailable(true);
        let err = index.last_indexed_at().await.unwrap_err();
        assert!(matches!(err, ManagerError::TransientIo(_)));
    }
}
