//! Change events read from the platform's ordered event log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Patch path segments that carry access-control information
const RESTRICTION_PATH_SEGMENTS: [&str; 2] = ["granted_refs", "object_marking_refs"];

/// Kind of mutation an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One operation of an update patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
}

impl PatchOp {
    pub fn new(op: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            path: path.into(),
        }
    }
}

/// File attached to an entity, as listed in the event extensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Platform extensions carried by an event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventExtensions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
}

/// The entity snapshot an event carries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Entity id
    pub id: String,
    /// Entity type (e.g., "report", "relationship")
    pub entity_type: String,
    /// Changed paths, for update events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Vec<PatchOp>>,
    #[serde(default)]
    pub extensions: EventExtensions,

    // Relationship fields, present when entity_type is "relationship"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
}

impl EventData {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            ..Default::default()
        }
    }

    pub fn with_patch(mut self, patch: Vec<PatchOp>) -> Self {
        self.patch = Some(patch);
        self
    }

    pub fn with_file(mut self, file_id: impl Into<String>) -> Self {
        self.extensions.files.push(FileRef {
            id: file_id.into(),
            name: None,
        });
        self
    }

    /// True if any patched path touches sharing grants or marking references
    pub fn touches_restrictions(&self) -> bool {
        self.patch.as_ref().is_some_and(|ops| {
            ops.iter().any(|op| {
                RESTRICTION_PATH_SEGMENTS
                    .iter()
                    .any(|segment| op.path.contains(segment))
            })
        })
    }

    pub fn has_files(&self) -> bool {
        !self.extensions.files.is_empty()
    }
}

/// An event as appended to the log (no position yet)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

impl NewEvent {
    pub fn new(event_type: EventType, data: EventData) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// An event read back from the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Stable event id, `<millis>-<position>`
    pub id: String,
    /// Position in the log; strictly increasing
    pub position: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

impl StreamEvent {
    /// Materialize an appended event at its assigned position
    pub fn at_position(event: NewEvent, position: u64) -> Self {
        Self {
            id: format!("{}-{}", event.timestamp.timestamp_millis(), position),
            position,
            event_type: event.event_type,
            timestamp: event.timestamp,
            data: event.data,
        }
    }
}
