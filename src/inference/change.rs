//! Relationship-level changes extracted from the feed

use super::relationship::{Relationship, RelationshipId, DEFAULT_CONFIDENCE};
use crate::stream::{EventType, StreamEvent};

/// Entity type carried by relationship events
pub const ENTITY_TYPE_RELATIONSHIP: &str = "relationship";

/// A change to a base relationship
#[derive(Debug, Clone, PartialEq)]
pub enum RelationChange {
    Created(Relationship),
    Updated(Relationship),
    Deleted(RelationshipId),
}

impl RelationChange {
    /// Id of the relationship the change concerns
    pub fn id(&self) -> &RelationshipId {
        match self {
            Self::Created(rel) | Self::Updated(rel) => &rel.id,
            Self::Deleted(id) => id,
        }
    }

    /// Interpret a feed event; `None` for events about anything but relationships.
    ///
    /// Creations and updates need the relationship type and both endpoints.
    pub fn from_stream_event(event: &StreamEvent) -> Option<Self> {
        let data = &event.data;
        if data.entity_type != ENTITY_TYPE_RELATIONSHIP {
            return None;
        }
        let id = RelationshipId::from_string(data.id.clone());
        if event.event_type == EventType::Delete {
            return Some(Self::Deleted(id));
        }

        let relationship = Relationship {
            id,
            relation_type: data.relationship_type.clone()?,
            from_id: data.source_ref.clone()?,
            to_id: data.target_ref.clone()?,
            start_time: data.start_time,
            stop_time: data.stop_time,
            confidence: data.confidence.unwrap_or(DEFAULT_CONFIDENCE).min(100),
            inference: None,
        };
        Some(match event.event_type {
            EventType::Update => Self::Updated(relationship),
            _ => Self::Created(relationship),
        })
    }
}
