//! Inference rules and the immutable catalog that holds them

use super::relationship::Relationship;
use crate::error::{ManagerError, ManagerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Relationship type used by the built-in location rule
pub const RELATION_LOCATED_AT: &str = "located-at";

/// Attributes a rule proposes for a derived relationship
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub from_id: String,
    pub to_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub confidence: u8,
}

/// A rule composing two relationship types into a third.
///
/// The engine pairs a `left` relationship `A -> B` with every `right`
/// relationship `B -> C` (the left target is the right source) and asks
/// `compose` whether the pair yields an output relationship.
pub trait InferenceRule: Send + Sync {
    /// Stable identifier, recorded on every relationship the rule produces
    fn id(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn left_type(&self) -> &str;

    fn right_type(&self) -> &str;

    fn output_type(&self) -> &str;

    /// Compose a joined pair, or `None` if the pair does not support an output.
    fn compose(&self, left: &Relationship, right: &Relationship) -> Option<Candidate>;
}

/// Chain composition: `A -left-> B` and `B -right-> C` give `A -output-> C`.
///
/// The derived window is the intersection of the two input windows and the
/// confidence their mean. Pairs whose windows do not overlap, and pairs that
/// would produce a self-loop, compose to nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationToRelationRule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub left_type: String,
    pub right_type: String,
    pub output_type: String,
}

impl RelationToRelationRule {
    pub fn new(
        id: impl Into<String>,
        left_type: impl Into<String>,
        right_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            left_type: left_type.into(),
            right_type: right_type.into(),
            output_type: output_type.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Location propagation: located at a place located elsewhere means
    /// located there too.
    pub fn located_at_located() -> Self {
        Self::new(
            "located_at_located",
            RELATION_LOCATED_AT,
            RELATION_LOCATED_AT,
            RELATION_LOCATED_AT,
        )
        .with_description(
            "If A is located at B and B is located at C, then A is located at C",
        )
    }
}

fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn earlier(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl InferenceRule for RelationToRelationRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn left_type(&self) -> &str {
        &self.left_type
    }

    fn right_type(&self) -> &str {
        &self.right_type
    }

    fn output_type(&self) -> &str {
        &self.output_type
    }

    fn compose(&self, left: &Relationship, right: &Relationship) -> Option<Candidate> {
        if left.relation_type != self.left_type || right.relation_type != self.right_type {
            return None;
        }
        if left.to_id != right.from_id || left.from_id == right.to_id {
            return None;
        }
        let start_time = later(left.start_time, right.start_time);
        let stop_time = earlier(left.stop_time, right.stop_time);
        if let (Some(start), Some(stop)) = (start_time, stop_time) {
            if start > stop {
                return None;
            }
        }
        let confidence = ((u16::from(left.confidence) + u16::from(right.confidence)) / 2) as u8;
        Some(Candidate {
            from_id: left.from_id.clone(),
            to_id: right.to_id.clone(),
            start_time,
            stop_time,
            confidence,
        })
    }
}

/// Declarative rule entry as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub left_type: String,
    pub right_type: String,
    pub output_type: String,
}

impl From<RuleDefinition> for RelationToRelationRule {
    fn from(def: RuleDefinition) -> Self {
        Self {
            id: def.id,
            description: def.description,
            left_type: def.left_type,
            right_type: def.right_type,
            output_type: def.output_type,
        }
    }
}

impl From<&RelationToRelationRule> for RuleDefinition {
    fn from(rule: &RelationToRelationRule) -> Self {
        Self {
            id: rule.id.clone(),
            description: rule.description.clone(),
            left_type: rule.left_type.clone(),
            right_type: rule.right_type.clone(),
            output_type: rule.output_type.clone(),
        }
    }
}

/// The fixed set of rules an engine evaluates.
///
/// Built once at startup and shared read-only; ids are unique.
#[derive(Clone, Default)]
pub struct RuleCatalog {
    rules: BTreeMap<String, Arc<dyn InferenceRule>>,
}

impl RuleCatalog {
    pub fn builder() -> RuleCatalogBuilder {
        RuleCatalogBuilder::default()
    }

    /// Catalog of generic chain rules from configuration
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = RuleDefinition>,
    ) -> ManagerResult<Self> {
        definitions
            .into_iter()
            .try_fold(Self::builder(), |builder, def| {
                builder.try_rule(RelationToRelationRule::from(def))
            })
            .map(RuleCatalogBuilder::build)
    }

    pub fn get(&self, rule_id: &str) -> Option<&Arc<dyn InferenceRule>> {
        self.rules.get(rule_id)
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<dyn InferenceRule>> {
        self.rules.values()
    }

    /// Rules taking `relation_type` on their left side
    pub fn rules_with_left<'a>(
        &'a self,
        relation_type: &'a str,
    ) -> impl Iterator<Item = &'a Arc<dyn InferenceRule>> + 'a {
        self.rules
            .values()
            .filter(move |r| r.left_type() == relation_type)
    }

    /// Rules taking `relation_type` on their right side
    pub fn rules_with_right<'a>(
        &'a self,
        relation_type: &'a str,
    ) -> impl Iterator<Item = &'a Arc<dyn InferenceRule>> + 'a {
        self.rules
            .values()
            .filter(move |r| r.right_type() == relation_type)
    }

    /// True if any rule produces `relation_type`
    pub fn produces(&self, relation_type: &str) -> bool {
        self.rules.values().any(|r| r.output_type() == relation_type)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl std::fmt::Debug for RuleCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.rules.keys()).finish()
    }
}

/// Collects rules before the catalog is frozen
#[derive(Default)]
pub struct RuleCatalogBuilder {
    rules: BTreeMap<String, Arc<dyn InferenceRule>>,
}

impl RuleCatalogBuilder {
    /// Add a rule, rejecting a duplicate id
    pub fn try_rule(mut self, rule: impl InferenceRule + 'static) -> ManagerResult<Self> {
        let id = rule.id().to_string();
        if self.rules.contains_key(&id) {
            return Err(ManagerError::Config(format!("duplicate rule id: {}", id)));
        }
        self.rules.insert(id, Arc::new(rule));
        Ok(self)
    }

    /// Add a rule; a later rule with the same id replaces the earlier one
    pub fn rule(mut self, rule: impl InferenceRule + 'static) -> Self {
        self.rules.insert(rule.id().to_string(), Arc::new(rule));
        self
    }

    pub fn build(self) -> RuleCatalog {
        RuleCatalog { rules: self.rules }
    }
}
