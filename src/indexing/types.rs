//! Value types exchanged with the storage and search collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file as listed by object storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    /// Storage path, e.g. `import/report--1/summary.pdf`
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Entity the file is attached to
    #[serde(default)]
    pub entity_id: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl StoredFile {
    pub fn new(id: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        let id = id.into();
        let name = id.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            id,
            name,
            size,
            mime_type: Some(mime_type.into()),
            entity_id: None,
            last_modified: Utc::now(),
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = last_modified;
        self
    }
}

/// Listing request for object storage
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListingOptions {
    pub prefix: String,
    /// Only files modified at or after this instant
    pub modified_since: Option<DateTime<Utc>>,
    /// Sub-path to leave out
    pub exclude_path: Option<String>,
    pub recursive: bool,
}

impl ListingOptions {
    /// True if `file` falls inside this listing
    pub fn includes(&self, file: &StoredFile) -> bool {
        if !file.id.starts_with(&self.prefix) {
            return false;
        }
        if !self.recursive && file.id[self.prefix.len()..].contains('/') {
            return false;
        }
        if self
            .exclude_path
            .as_ref()
            .is_some_and(|excluded| file.id.starts_with(excluded.as_str()))
        {
            return false;
        }
        self.modified_since
            .map_or(true, |since| file.last_modified >= since)
    }
}

/// An existing index entry for a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedFileRef {
    pub internal_id: String,
    pub file_id: String,
}

/// A document in the search index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedDocument {
    /// Stable index id; reused when a file is re-indexed
    pub internal_id: String,
    pub file_id: String,
    pub entity_id: Option<String>,
    pub name: String,
    /// File content as returned by storage
    pub content: String,
    pub uploaded_at: DateTime<Utc>,
    /// Set by the index on upsert
    #[serde(default)]
    pub indexed_at: Option<DateTime<Utc>>,
}

/// Access restrictions of an entity, copied onto its indexed files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRestrictions {
    pub entity_id: String,
    #[serde(default)]
    pub granted_refs: Vec<String>,
    #[serde(default)]
    pub object_marking_refs: Vec<String>,
}

impl EntityRestrictions {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            ..Self::default()
        }
    }

    pub fn with_grants(mut self, granted_refs: Vec<String>) -> Self {
        self.granted_refs = granted_refs;
        self
    }

    pub fn with_markings(mut self, object_marking_refs: Vec<String>) -> Self {
        self.object_marking_refs = object_marking_refs;
        self
    }
}

/// Platform settings relevant to indexing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSettings {
    /// Licensed-feature marker; indexing is a licensed feature
    #[serde(default)]
    pub enterprise_edition: Option<String>,
}

impl PlatformSettings {
    pub fn licensed() -> Self {
        Self {
            enterprise_edition: Some("enabled".to_string()),
        }
    }

    pub fn is_licensed(&self) -> bool {
        self.enterprise_edition
            .as_deref()
            .is_some_and(|value| !value.is_empty())
    }
}

/// Outcome of the last completed backfill, recorded in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRunStatus {
    pub finished_at: DateTime<Utc>,
    pub indexed: usize,
}
