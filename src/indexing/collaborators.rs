//! Interfaces of the external systems the pipeline drives

use super::types::{
    EntityRestrictions, IndexRunStatus, IndexedDocument, IndexedFileRef, ListingOptions,
    PlatformSettings, StoredFile,
};
use crate::error::ManagerResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Object storage holding uploaded files
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn list_files(&self, options: &ListingOptions) -> ManagerResult<Vec<StoredFile>>;

    /// Content of a file, `None` if it vanished since listing
    async fn file_content(&self, file_id: &str) -> ManagerResult<Option<String>>;
}

/// Full-text search engine holding indexed documents
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Existing entries for any of `file_ids`
    async fn find_indexed(&self, file_ids: &[String]) -> ManagerResult<Vec<IndexedFileRef>>;

    /// Insert or replace documents keyed by internal id; returns how many were written
    async fn bulk_upsert(&self, documents: Vec<IndexedDocument>) -> ManagerResult<usize>;

    /// Most recent `indexed_at` across all documents
    async fn last_indexed_at(&self) -> ManagerResult<Option<DateTime<Utc>>>;

    async fn save_index_status(&self, status: &IndexRunStatus) -> ManagerResult<()>;

    /// Copy an entity's restrictions onto every document referencing it
    async fn apply_entity_restrictions(
        &self,
        restrictions: &EntityRestrictions,
    ) -> ManagerResult<usize>;

    /// Whether the engine can extract text from attachments
    fn attachment_processor_enabled(&self) -> bool;
}

/// Read access to platform entities
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn load_restrictions(&self, entity_id: &str) -> ManagerResult<Option<EntityRestrictions>>;
}

/// Cached platform settings
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn settings(&self) -> ManagerResult<PlatformSettings>;
}
