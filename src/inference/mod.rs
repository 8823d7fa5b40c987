//! Rule-based inference over relationships
//!
//! A [`RuleCatalog`] of [`InferenceRule`]s is evaluated incrementally by the
//! [`RuleEngine`] as base relationships change. The [`RuleManager`] feeds the
//! engine from the change stream on one node of the cluster at a time.

mod change;
mod engine;
mod manager;
mod relationship;
mod rule;

pub use change::{RelationChange, ENTITY_TYPE_RELATIONSHIP};
pub use engine::{InferenceReport, RuleEngine, DEFAULT_MAX_CASCADE_STEPS};
pub use manager::{RuleMaintenance, RuleManager, RULE_MANAGER_ID};
pub use relationship::{Inference, Justification, Relationship, RelationshipId, DEFAULT_CONFIDENCE};
pub use rule::{
    Candidate, InferenceRule, RelationToRelationRule, RuleCatalog, RuleCatalogBuilder,
    RuleDefinition, RELATION_LOCATED_AT,
};
