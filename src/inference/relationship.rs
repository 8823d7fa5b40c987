//! Relationships: base facts and the rule-derived overlay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Namespace for deterministic derived-relationship ids
const DERIVED_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_9b3d_4c8f_a1e2_5d7b_3c9e_0f41);

/// Default confidence for relationships that do not state one
pub const DEFAULT_CONFIDENCE: u8 = 100;

/// Unique identifier for a relationship
///
/// Serializes as a plain string. Base relationships carry whatever id the
/// platform assigned; derived relationships use [`RelationshipId::derived`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationshipId(String);

impl RelationshipId {
    /// Create a new random RelationshipId
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a RelationshipId from an existing string
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic id for the relationship a rule derives between two endpoints.
    ///
    /// Replaying the same composition always lands on the same row.
    pub fn derived(rule_id: &str, relation_type: &str, from_id: &str, to_id: &str) -> Self {
        let name = format!("{}|{}|{}|{}", rule_id, relation_type, from_id, to_id);
        Self(format!(
            "inferred--{}",
            Uuid::new_v5(&DERIVED_NAMESPACE, name.as_bytes())
        ))
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RelationshipId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RelationshipId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RelationshipId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One supporting pair behind a derived relationship
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Justification {
    pub left: RelationshipId,
    pub right: RelationshipId,
}

impl Justification {
    pub fn new(left: RelationshipId, right: RelationshipId) -> Self {
        Self { left, right }
    }

    /// True if `id` is one of the two supporting relationships
    pub fn cites(&self, id: &RelationshipId) -> bool {
        &self.left == id || &self.right == id
    }

    pub fn members(&self) -> [&RelationshipId; 2] {
        [&self.left, &self.right]
    }
}

/// Provenance of a derived relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inference {
    /// Rule that produced the relationship
    pub rule_id: String,
    /// Every pair currently supporting the relationship. Never empty while
    /// the relationship exists.
    pub justifications: BTreeSet<Justification>,
}

impl Inference {
    pub fn new(rule_id: impl Into<String>, justification: Justification) -> Self {
        let mut justifications = BTreeSet::new();
        justifications.insert(justification);
        Self {
            rule_id: rule_id.into(),
            justifications,
        }
    }
}

/// A directed, typed relationship between two entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Unique identifier
    pub id: RelationshipId,
    /// Type of relationship (e.g., "located-at", "targets")
    pub relation_type: String,
    /// Source entity
    pub from_id: String,
    /// Target entity
    pub to_id: String,
    /// Start of the validity window (open when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// End of the validity window (open when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
    /// Confidence (0 - 100)
    pub confidence: u8,
    /// Present only on relationships produced by a rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference: Option<Inference>,
}

impl Relationship {
    /// Create a new base relationship `from --relation_type--> to`
    pub fn new(
        from_id: impl Into<String>,
        relation_type: impl Into<String>,
        to_id: impl Into<String>,
    ) -> Self {
        Self {
            id: RelationshipId::new(),
            relation_type: relation_type.into(),
            from_id: from_id.into(),
            to_id: to_id.into(),
            start_time: None,
            stop_time: None,
            confidence: DEFAULT_CONFIDENCE,
            inference: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<RelationshipId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_window(
        mut self,
        start_time: Option<DateTime<Utc>>,
        stop_time: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start_time;
        self.stop_time = stop_time;
        self
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence.min(100);
        self
    }

    /// True if a rule produced this relationship
    pub fn is_inferred(&self) -> bool {
        self.inference.is_some()
    }

    /// Rule that produced this relationship, if any
    pub fn rule_id(&self) -> Option<&str> {
        self.inference.as_ref().map(|i| i.rule_id.as_str())
    }

    /// Ids of every relationship currently supporting this one.
    ///
    /// Empty for base relationships.
    pub fn explanation(&self) -> BTreeSet<RelationshipId> {
        self.inference
            .iter()
            .flat_map(|i| i.justifications.iter())
            .flat_map(|j| j.members())
            .cloned()
            .collect()
    }

    /// True if the rule-relevant attributes match
    pub(crate) fn same_attributes(&self, other: &Relationship) -> bool {
        self.start_time == other.start_time
            && self.stop_time == other.stop_time
            && self.confidence == other.confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_are_deterministic() {
        let a = RelationshipId::derived("rule", "located-at", "paris", "europe");
        let b = RelationshipId::derived("rule", "located-at", "paris", "europe");
        let c = RelationshipId::derived("rule", "located-at", "europe", "paris");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("inferred--"));
    }

    #[test]
    fn explanation_is_union_of_justifications() {
        let mut rel = Relationship::new("a", "located-at", "c");
        let mut inference = Inference::new("r", Justification::new("e1".into(), "e2".into()));
        inference
            .justifications
            .insert(Justification::new("e1".into(), "e3".into()));
        rel.inference = Some(inference);

        let explanation = rel.explanation();
        assert_eq!(explanation.len(), 3);
        assert!(explanation.contains(&RelationshipId::from("e3")));
    }

    #[test]
    fn base_relationship_has_empty_explanation() {
        let rel = Relationship::new("paris", "located-at", "france");
        assert!(!rel.is_inferred());
        assert!(rel.explanation().is_empty());
        assert_eq!(rel.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn relationship_serializes_without_inference_when_base() {
        let rel = Relationship::new("paris", "located-at", "france").with_id("edge-1");
        let json = serde_json::to_value(&rel).unwrap();
        assert_eq!(json["id"], "edge-1");
        assert!(json.get("inference").is_none());
    }
}
