//! File content indexing
//!
//! The [`IndexingPipeline`] lists imported files in object storage, loads
//! their content and writes it to a search index, reusing index ids across
//! runs. It also copies access restrictions from entities onto the files
//! attached to them when the feed reports a restriction change. The
//! [`FileIndexManager`] runs both on a schedule under cluster leases.

mod collaborators;
mod manager;
pub mod memory;
mod pipeline;
mod types;

pub use collaborators::{EntityStore, FileStorage, SearchIndex, SettingsProvider};
pub use manager::{FileIndexManager, IndexingBackends, FILE_INDEX_MANAGER_ID};
pub use pipeline::{IndexingPipeline, ScanOptions, ScanReport, FILE_INDEX_SCAN_TASK};
pub use types::{
    EntityRestrictions, IndexRunStatus, IndexedDocument, IndexedFileRef, ListingOptions,
    PlatformSettings, StoredFile,
};
