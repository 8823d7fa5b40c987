//! Incremental maintenance of rule-derived relationships
//!
//! Every derived relationship records the pairs (justifications) that
//! currently support it. Changes to base relationships are applied one at a
//! time and their consequences cascade through a work queue until nothing
//! changes any more:
//!
//! - a new or changed relationship is joined with its partners under every
//!   matching rule, adding justifications (and creating rows) as needed;
//! - a removed relationship triggers delete-and-rederive: everything that
//!   transitively depended on it is provisionally removed, then whatever
//!   still has a justification rooted outside that region is restored. A
//!   derived relationship survives exactly while it has at least one such
//!   justification, so cycles of derived relationships cannot keep each
//!   other alive.
//!
//! Replaying a change is harmless: justifications are set members and ids of
//! derived relationships are deterministic.

use super::change::RelationChange;
use super::relationship::{Inference, Justification, Relationship, RelationshipId};
use super::rule::{Candidate, InferenceRule, RuleCatalog};
use crate::error::{ManagerError, ManagerResult};
use crate::storage::{RelationFilter, RelationStore};
use crate::stream::{StreamEvent, StreamHandler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default bound on work items processed for a single change
pub const DEFAULT_MAX_CASCADE_STEPS: usize = 10_000;

/// What applying one or more changes did to the derived overlay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InferenceReport {
    /// Base changes applied
    pub changes: usize,
    /// Derived relationships created
    pub derived: usize,
    /// Derived relationships whose attributes changed
    pub refreshed: usize,
    /// Derived relationships removed
    pub retracted: usize,
    /// Cascade work items processed
    pub steps: usize,
}

impl InferenceReport {
    pub fn merge(&mut self, other: &InferenceReport) {
        self.changes += other.changes;
        self.derived += other.derived;
        self.refreshed += other.refreshed;
        self.retracted += other.retracted;
        self.steps += other.steps;
    }

    /// True if the overlay changed
    pub fn touched(&self) -> bool {
        self.derived + self.refreshed + self.retracted > 0
    }
}

/// Pending work for one top-level operation
struct Cascade {
    queue: VecDeque<RelationshipId>,
    queued: HashSet<RelationshipId>,
    report: InferenceReport,
    max_steps: usize,
}

impl Cascade {
    fn new(max_steps: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            report: InferenceReport::default(),
            max_steps,
        }
    }

    /// Schedule a relationship to be re-joined with its partners
    fn enqueue(&mut self, id: RelationshipId) {
        if self.queued.insert(id.clone()) {
            self.queue.push_back(id);
        }
    }

    fn next(&mut self) -> Option<RelationshipId> {
        let id = self.queue.pop_front()?;
        self.queued.remove(&id);
        Some(id)
    }

    fn step(&mut self) -> ManagerResult<()> {
        self.report.steps += 1;
        if self.report.steps > self.max_steps {
            return Err(ManagerError::InvariantViolation(format!(
                "inference cascade exceeded {} steps without reaching a fixed point",
                self.max_steps
            )));
        }
        Ok(())
    }
}

/// Earliest start; an open start wins
fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        _ => None,
    }
}

/// Latest stop; an open stop wins
fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

/// Attributes of a derived relationship given all its supporting candidates
fn combine(candidates: &[Candidate]) -> Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>, u8)> {
    let (first, rest) = candidates.split_first()?;
    Some(rest.iter().fold(
        (first.start_time, first.stop_time, first.confidence),
        |(start, stop, confidence), c| {
            (
                earliest(start, c.start_time),
                latest(stop, c.stop_time),
                confidence.max(c.confidence),
            )
        },
    ))
}

/// Applies relationship changes to the derived overlay.
#[derive(Clone)]
pub struct RuleEngine {
    catalog: Arc<RuleCatalog>,
    store: Arc<dyn RelationStore>,
    max_steps: usize,
}

impl RuleEngine {
    pub fn new(catalog: Arc<RuleCatalog>, store: Arc<dyn RelationStore>) -> Self {
        Self {
            catalog,
            store,
            max_steps: DEFAULT_MAX_CASCADE_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    /// Apply one base change and everything it implies.
    pub fn apply(&self, change: RelationChange) -> ManagerResult<InferenceReport> {
        let mut cascade = Cascade::new(self.max_steps);
        match change {
            RelationChange::Created(rel) | RelationChange::Updated(rel) => {
                self.upsert_base(rel, &mut cascade)?
            }
            RelationChange::Deleted(id) => self.delete_base(&id, &mut cascade)?,
        }
        self.drain(&mut cascade)?;
        cascade.report.changes = 1;
        Ok(cascade.report)
    }

    /// Apply changes in order
    pub fn apply_all(
        &self,
        changes: impl IntoIterator<Item = RelationChange>,
    ) -> ManagerResult<InferenceReport> {
        let mut report = InferenceReport::default();
        for change in changes {
            report.merge(&self.apply(change)?);
        }
        Ok(report)
    }

    /// Evaluate one rule over every relationship already in the store.
    ///
    /// Used after a rule is added to the catalog; existing pairs are not
    /// revisited by the change feed.
    pub fn rescan(&self, rule_id: &str) -> ManagerResult<InferenceReport> {
        let rule = self
            .catalog
            .get(rule_id)
            .cloned()
            .ok_or_else(|| ManagerError::Config(format!("unknown rule: {}", rule_id)))?;
        let mut cascade = Cascade::new(self.max_steps);

        let lefts = self
            .store
            .find_relationships(&RelationFilter::new().with_type(rule.left_type()))?;
        for left in &lefts {
            let rights = self.store.find_relationships(
                &RelationFilter::new()
                    .with_type(rule.right_type())
                    .with_from(left.to_id.as_str()),
            )?;
            for right in &rights {
                self.justify(rule.as_ref(), left, right, &mut cascade)?;
            }
        }
        self.drain(&mut cascade)?;
        info!(rule = %rule_id, derived = cascade.report.derived, "rule rescan complete");
        Ok(cascade.report)
    }

    /// Remove everything a rule produced, and whatever depended on it.
    pub fn purge(&self, rule_id: &str) -> ManagerResult<InferenceReport> {
        let mut cascade = Cascade::new(self.max_steps);
        let produced = self
            .store
            .find_relationships(&RelationFilter::new().with_rule(rule_id))?;
        let removed: BTreeSet<RelationshipId> = produced.iter().map(|r| r.id.clone()).collect();
        for id in &removed {
            if self.store.delete_relationship(id)? {
                cascade.report.retracted += 1;
            }
        }
        self.reconcile(removed, BTreeMap::new(), &mut cascade)?;
        self.drain(&mut cascade)?;
        info!(rule = %rule_id, retracted = cascade.report.retracted, "rule purged");
        Ok(cascade.report)
    }

    fn upsert_base(&self, rel: Relationship, cascade: &mut Cascade) -> ManagerResult<()> {
        if let Some(existing) = self.store.load_relationship(&rel.id)? {
            if existing.is_inferred() {
                warn!(relationship = %rel.id, "ignoring external change to a derived relationship");
                return Ok(());
            }
            let reshaped = existing.relation_type != rel.relation_type
                || existing.from_id != rel.from_id
                || existing.to_id != rel.to_id;
            if reshaped {
                // Whatever the old shape supported goes first
                self.store.delete_relationship(&rel.id)?;
                self.reconcile(
                    BTreeSet::from([rel.id.clone()]),
                    BTreeMap::new(),
                    cascade,
                )?;
            }
        }
        let base = Relationship {
            inference: None,
            ..rel
        };
        self.store.save_relationship(&base)?;
        cascade.enqueue(base.id);
        Ok(())
    }

    fn delete_base(&self, id: &RelationshipId, cascade: &mut Cascade) -> ManagerResult<()> {
        let Some(existing) = self.store.load_relationship(id)? else {
            debug!(relationship = %id, "relationship already absent");
            return Ok(());
        };
        if existing.is_inferred() {
            warn!(relationship = %id, "ignoring external deletion of a derived relationship");
            return Ok(());
        }
        self.store.delete_relationship(id)?;
        self.reconcile(BTreeSet::from([id.clone()]), BTreeMap::new(), cascade)
    }

    fn drain(&self, cascade: &mut Cascade) -> ManagerResult<()> {
        while let Some(id) = cascade.next() {
            cascade.step()?;
            if let Some(rel) = self.store.load_relationship(&id)? {
                self.refresh(&rel, cascade)?;
            }
        }
        Ok(())
    }

    /// Re-evaluate what `rel` supports, then join it with its partners.
    fn refresh(&self, rel: &Relationship, cascade: &mut Cascade) -> ManagerResult<()> {
        let mut invalid: BTreeMap<RelationshipId, BTreeSet<Justification>> = BTreeMap::new();
        for dependent in self.store.find_supported_by(&rel.id)? {
            let evaluation = self.evaluate(&dependent)?;
            let dropped: BTreeSet<Justification> = evaluation
                .iter()
                .filter(|(_, candidate)| candidate.is_none())
                .map(|(j, _)| j.clone())
                .collect();
            if dropped.is_empty() {
                let candidates: Vec<Candidate> =
                    evaluation.into_iter().filter_map(|(_, c)| c).collect();
                self.store_attributes(dependent, &candidates, cascade)?;
            } else {
                invalid.insert(dependent.id.clone(), dropped);
            }
        }
        if !invalid.is_empty() {
            self.reconcile(BTreeSet::new(), invalid, cascade)?;
            // A self-supporting relationship may have gone with its dependents
            if self.store.load_relationship(&rel.id)?.is_none() {
                return Ok(());
            }
        }

        for rule in self.catalog.rules_with_left(&rel.relation_type) {
            let partners = self.store.find_relationships(
                &RelationFilter::new()
                    .with_type(rule.right_type())
                    .with_from(rel.to_id.as_str()),
            )?;
            for right in &partners {
                self.justify(rule.as_ref(), rel, right, cascade)?;
            }
        }
        for rule in self.catalog.rules_with_right(&rel.relation_type) {
            let partners = self.store.find_relationships(
                &RelationFilter::new()
                    .with_type(rule.left_type())
                    .with_to(rel.from_id.as_str()),
            )?;
            for left in &partners {
                self.justify(rule.as_ref(), left, rel, cascade)?;
            }
        }
        Ok(())
    }

    /// Record that `(left, right)` supports the rule's output, creating it if needed.
    fn justify(
        &self,
        rule: &dyn InferenceRule,
        left: &Relationship,
        right: &Relationship,
        cascade: &mut Cascade,
    ) -> ManagerResult<()> {
        let Some(candidate) = rule.compose(left, right) else {
            return Ok(());
        };
        if candidate.from_id == candidate.to_id {
            return Ok(());
        }
        let id = RelationshipId::derived(
            rule.id(),
            rule.output_type(),
            &candidate.from_id,
            &candidate.to_id,
        );
        let justification = Justification::new(left.id.clone(), right.id.clone());

        let Some(mut existing) = self.store.load_relationship(&id)? else {
            let derived = Relationship {
                id,
                relation_type: rule.output_type().to_string(),
                from_id: candidate.from_id,
                to_id: candidate.to_id,
                start_time: candidate.start_time,
                stop_time: candidate.stop_time,
                confidence: candidate.confidence,
                inference: Some(Inference::new(rule.id(), justification)),
            };
            self.save_derived(&derived)?;
            debug!(
                relationship = %derived.id,
                rule = %rule.id(),
                from = %derived.from_id,
                to = %derived.to_id,
                "derived relationship created"
            );
            cascade.report.derived += 1;
            cascade.enqueue(derived.id);
            return Ok(());
        };

        let previous = existing.clone();
        let Some(inference) = existing.inference.as_mut() else {
            return Err(ManagerError::InvariantViolation(format!(
                "derived id {} is held by a base relationship",
                id
            )));
        };
        let added = inference.justifications.insert(justification);
        existing.start_time = earliest(existing.start_time, candidate.start_time);
        existing.stop_time = latest(existing.stop_time, candidate.stop_time);
        existing.confidence = existing.confidence.max(candidate.confidence);
        let attributes_changed = !existing.same_attributes(&previous);

        if added || attributes_changed {
            self.save_derived(&existing)?;
        }
        if attributes_changed {
            cascade.report.refreshed += 1;
            cascade.enqueue(existing.id);
        }
        Ok(())
    }

    /// Recompose every justification of a derived relationship.
    ///
    /// A justification whose members are gone, whose rule left the catalog or
    /// which no longer composes to this relationship maps to `None`.
    fn evaluate(&self, derived: &Relationship) -> ManagerResult<Vec<(Justification, Option<Candidate>)>> {
        let Some(inference) = &derived.inference else {
            return Ok(Vec::new());
        };
        let rule = self.catalog.get(&inference.rule_id);
        let mut evaluation = Vec::with_capacity(inference.justifications.len());
        for justification in &inference.justifications {
            let candidate = match rule {
                Some(rule) if rule.output_type() == derived.relation_type => {
                    let left = self.store.load_relationship(&justification.left)?;
                    let right = self.store.load_relationship(&justification.right)?;
                    match (left, right) {
                        (Some(left), Some(right)) => rule.compose(&left, &right).filter(|c| {
                            c.from_id == derived.from_id && c.to_id == derived.to_id
                        }),
                        _ => None,
                    }
                }
                _ => None,
            };
            evaluation.push((justification.clone(), candidate));
        }
        Ok(evaluation)
    }

    /// Set attributes from the full candidate list, cascading if they changed.
    fn store_attributes(
        &self,
        mut derived: Relationship,
        candidates: &[Candidate],
        cascade: &mut Cascade,
    ) -> ManagerResult<()> {
        let Some((start_time, stop_time, confidence)) = combine(candidates) else {
            return Ok(());
        };
        if derived.start_time == start_time
            && derived.stop_time == stop_time
            && derived.confidence == confidence
        {
            return Ok(());
        }
        derived.start_time = start_time;
        derived.stop_time = stop_time;
        derived.confidence = confidence;
        self.save_derived(&derived)?;
        cascade.report.refreshed += 1;
        cascade.enqueue(derived.id);
        Ok(())
    }

    /// Delete-and-rederive after `removed` disappeared and the justifications
    /// in `invalid` stopped holding.
    fn reconcile(
        &self,
        removed: BTreeSet<RelationshipId>,
        invalid: BTreeMap<RelationshipId, BTreeSet<Justification>>,
        cascade: &mut Cascade,
    ) -> ManagerResult<()> {
        // Over-delete: the region transitively supported by anything affected
        let mut suspects: BTreeMap<RelationshipId, Relationship> = BTreeMap::new();
        let mut frontier: VecDeque<RelationshipId> = removed.iter().cloned().collect();
        for id in invalid.keys() {
            if let Some(rel) = self.store.load_relationship(id)? {
                cascade.step()?;
                suspects.insert(id.clone(), rel);
                frontier.push_back(id.clone());
            }
        }
        while let Some(id) = frontier.pop_front() {
            for dependent in self.store.find_supported_by(&id)? {
                if removed.contains(&dependent.id) || suspects.contains_key(&dependent.id) {
                    continue;
                }
                cascade.step()?;
                frontier.push_back(dependent.id.clone());
                suspects.insert(dependent.id.clone(), dependent);
            }
        }
        if suspects.is_empty() {
            return Ok(());
        }

        // Rederive: least fixed point of suspects with a justification whose
        // members all exist outside the region or were themselves restored
        let holds = |id: &RelationshipId, j: &Justification, alive: &BTreeSet<RelationshipId>| {
            !invalid.get(id).is_some_and(|dropped| dropped.contains(j))
                && j.members().iter().all(|m| {
                    !removed.contains(*m) && (!suspects.contains_key(*m) || alive.contains(*m))
                })
        };
        let mut alive: BTreeSet<RelationshipId> = BTreeSet::new();
        loop {
            let restored: Vec<RelationshipId> = suspects
                .iter()
                .filter(|(id, _)| !alive.contains(*id))
                .filter(|(id, rel)| {
                    rel.inference
                        .iter()
                        .flat_map(|i| i.justifications.iter())
                        .any(|j| holds(*id, j, &alive))
                })
                .map(|(id, _)| id.clone())
                .collect();
            if restored.is_empty() {
                break;
            }
            alive.extend(restored);
        }

        // Retract the dead before touching survivors
        for (id, rel) in &suspects {
            if alive.contains(id) {
                continue;
            }
            if self.store.delete_relationship(id)? {
                cascade.report.retracted += 1;
                debug!(relationship = %id, rule = ?rel.rule_id(), "derived relationship retracted");
            }
        }

        let mut late_dead = BTreeSet::new();
        for (id, original) in &suspects {
            if !alive.contains(id) {
                continue;
            }
            let mut rel = original.clone();
            if let Some(inference) = rel.inference.as_mut() {
                inference.justifications.retain(|j| holds(id, j, &alive));
            }
            let evaluation = self.evaluate(&rel)?;
            let mut kept = BTreeSet::new();
            let mut candidates = Vec::with_capacity(evaluation.len());
            for (justification, candidate) in evaluation {
                if let Some(candidate) = candidate {
                    kept.insert(justification);
                    candidates.push(candidate);
                }
            }
            let Some((start_time, stop_time, confidence)) = combine(&candidates) else {
                // Its remaining support no longer composes
                if self.store.delete_relationship(id)? {
                    cascade.report.retracted += 1;
                }
                late_dead.insert(id.clone());
                continue;
            };
            if let Some(inference) = rel.inference.as_mut() {
                inference.justifications = kept;
            }
            rel.start_time = start_time;
            rel.stop_time = stop_time;
            rel.confidence = confidence;

            if rel != *original {
                self.save_derived(&rel)?;
            }
            if !rel.same_attributes(original) {
                cascade.report.refreshed += 1;
                cascade.enqueue(rel.id);
            }
        }

        if late_dead.is_empty() {
            Ok(())
        } else {
            self.reconcile(late_dead, BTreeMap::new(), cascade)
        }
    }

    fn save_derived(&self, derived: &Relationship) -> ManagerResult<()> {
        let supported = derived
            .inference
            .as_ref()
            .is_some_and(|i| !i.justifications.is_empty());
        if !supported {
            return Err(ManagerError::InvariantViolation(format!(
                "derived relationship {} has an empty explanation",
                derived.id
            )));
        }
        self.store.save_relationship(derived)?;
        Ok(())
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("catalog", &self.catalog)
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

#[async_trait]
impl StreamHandler for RuleEngine {
    /// Events are applied one at a time in feed order.
    ///
    /// Store calls block, so the batch runs on the blocking pool.
    async fn handle(&self, batch: &[StreamEvent]) -> ManagerResult<()> {
        let engine = self.clone();
        let batch = batch.to_vec();
        let report = tokio::task::spawn_blocking(move || {
            let mut report = InferenceReport::default();
            for event in &batch {
                if let Some(change) = RelationChange::from_stream_event(event) {
                    report.merge(&engine.apply(change)?);
                }
            }
            Ok::<_, ManagerError>(report)
        })
        .await
        .map_err(|e| ManagerError::HandlerFailure(format!("inference batch panicked: {}", e)))??;

        if report.touched() {
            info!(
                changes = report.changes,
                derived = report.derived,
                refreshed = report.refreshed,
                retracted = report.retracted,
                "inference batch applied"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::rule::{RelationToRelationRule, RELATION_LOCATED_AT};
    use crate::storage::{MemoryStore, StorageResult};
    use crate::stream::{EventData, EventType, NewEvent};
    use chrono::TimeZone;

    fn engine() -> (RuleEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let catalog = RuleCatalog::builder()
            .rule(RelationToRelationRule::located_at_located())
            .build();
        (RuleEngine::new(Arc::new(catalog), store.clone()), store)
    }

    fn located(id: &str, from: &str, to: &str) -> Relationship {
        Relationship::new(from, RELATION_LOCATED_AT, to).with_id(id)
    }

    fn derived(store: &MemoryStore) -> Vec<Relationship> {
        store
            .find_relationships(&RelationFilter::new())
            .unwrap()
            .into_iter()
            .filter(Relationship::is_inferred)
            .collect()
    }

    fn derived_between(store: &MemoryStore, from: &str, to: &str) -> Option<Relationship> {
        derived(store)
            .into_iter()
            .find(|r| r.from_id == from && r.to_id == to)
    }

    fn ids(items: &[&str]) -> BTreeSet<RelationshipId> {
        items.iter().map(|s| RelationshipId::from(*s)).collect()
    }

    fn at(year: i32) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()
    }

    #[test]
    fn paris_france_europe_round_trip() {
        let (engine, store) = engine();
        engine
            .apply(RelationChange::Created(located("edge1", "paris", "france")))
            .unwrap();
        let report = engine
            .apply(RelationChange::Created(located("edge2", "france", "europe")))
            .unwrap();
        assert_eq!(report.derived, 1);

        let inferred = derived_between(&store, "paris", "europe").unwrap();
        assert_eq!(inferred.explanation(), ids(&["edge1", "edge2"]));
        assert_eq!(inferred.rule_id(), Some("located_at_located"));
        assert_eq!(derived(&store).len(), 1);

        let report = engine
            .apply(RelationChange::Deleted("edge1".into()))
            .unwrap();
        assert_eq!(report.retracted, 1);
        assert!(derived(&store).is_empty());

        engine
            .apply(RelationChange::Created(located("edge1", "paris", "france")))
            .unwrap();
        let restored = derived_between(&store, "paris", "europe").unwrap();
        assert_eq!(restored.id, inferred.id);
        assert_eq!(restored.explanation(), ids(&["edge1", "edge2"]));
    }

    #[test]
    fn replayed_creation_changes_nothing() {
        let (engine, store) = engine();
        let changes = vec![
            RelationChange::Created(located("edge1", "paris", "france")),
            RelationChange::Created(located("edge2", "france", "europe")),
        ];
        engine.apply_all(changes.clone()).unwrap();
        let before = derived(&store);

        let report = engine.apply_all(changes).unwrap();
        assert_eq!(report.derived, 0);
        assert_eq!(report.retracted, 0);
        assert_eq!(derived(&store), before);
        assert_eq!(before[0].explanation().len(), 2);
    }

    #[test]
    fn replayed_deletion_is_a_no_op() {
        let (engine, store) = engine();
        engine
            .apply_all(vec![
                RelationChange::Created(located("edge1", "paris", "france")),
                RelationChange::Created(located("edge2", "france", "europe")),
                RelationChange::Deleted("edge2".into()),
            ])
            .unwrap();
        let report = engine.apply(RelationChange::Deleted("edge2".into())).unwrap();
        assert_eq!(report, InferenceReport { changes: 1, ..Default::default() });
        assert!(derived(&store).is_empty());
        assert!(store.load_relationship(&"edge1".into()).unwrap().is_some());
    }

    #[test]
    fn relationship_survives_while_another_pair_supports_it() {
        let (engine, store) = engine();
        engine
            .apply_all(vec![
                RelationChange::Created(located("a1", "paris", "france")),
                RelationChange::Created(located("a2", "france", "europe")),
                RelationChange::Created(located("b1", "paris", "ile-de-france")),
                RelationChange::Created(located("b2", "ile-de-france", "europe")),
            ])
            .unwrap();
        let inferred = derived_between(&store, "paris", "europe").unwrap();
        assert_eq!(inferred.explanation(), ids(&["a1", "a2", "b1", "b2"]));

        engine.apply(RelationChange::Deleted("a1".into())).unwrap();
        let inferred = derived_between(&store, "paris", "europe").unwrap();
        assert_eq!(inferred.explanation(), ids(&["b1", "b2"]));

        engine.apply(RelationChange::Deleted("b2".into())).unwrap();
        assert!(derived_between(&store, "paris", "europe").is_none());
    }

    #[test]
    fn chains_propagate_and_retract_transitively() {
        let (engine, store) = engine();
        engine
            .apply_all(vec![
                RelationChange::Created(located("ab", "a", "b")),
                RelationChange::Created(located("bc", "b", "c")),
                RelationChange::Created(located("cd", "c", "d")),
            ])
            .unwrap();
        assert!(derived_between(&store, "a", "c").is_some());
        assert!(derived_between(&store, "b", "d").is_some());
        let ad = derived_between(&store, "a", "d").unwrap();
        assert_eq!(ad.inference.as_ref().unwrap().justifications.len(), 2);

        engine.apply(RelationChange::Deleted("bc".into())).unwrap();
        assert!(derived(&store).is_empty());
    }

    #[test]
    fn mutual_support_in_a_cycle_does_not_survive() {
        let (engine, store) = engine();
        engine
            .apply_all(vec![
                RelationChange::Created(located("ab", "a", "b")),
                RelationChange::Created(located("bc", "b", "c")),
                RelationChange::Created(located("ca", "c", "a")),
            ])
            .unwrap();
        assert!(derived(&store).len() > 1);

        engine.apply(RelationChange::Deleted("ca".into())).unwrap();
        let remaining = derived(&store);
        assert_eq!(remaining.len(), 1);
        assert_eq!((remaining[0].from_id.as_str(), remaining[0].to_id.as_str()), ("a", "c"));
        assert_eq!(remaining[0].explanation(), ids(&["ab", "bc"]));
    }

    #[test]
    fn window_updates_refresh_and_retract() {
        let (engine, store) = engine();
        engine
            .apply_all(vec![
                RelationChange::Created(
                    located("edge1", "paris", "france").with_window(at(2000), at(2020)),
                ),
                RelationChange::Created(
                    located("edge2", "france", "europe").with_window(at(2010), None),
                ),
            ])
            .unwrap();
        let inferred = derived_between(&store, "paris", "europe").unwrap();
        assert_eq!((inferred.start_time, inferred.stop_time), (at(2010), at(2020)));

        let report = engine
            .apply(RelationChange::Updated(
                located("edge2", "france", "europe").with_window(at(2015), None),
            ))
            .unwrap();
        assert_eq!(report.refreshed, 1);
        let inferred = derived_between(&store, "paris", "europe").unwrap();
        assert_eq!(inferred.start_time, at(2015));
        assert_eq!(inferred.explanation(), ids(&["edge1", "edge2"]));

        // Disjoint windows no longer compose
        engine
            .apply(RelationChange::Updated(
                located("edge2", "france", "europe").with_window(at(2021), None),
            ))
            .unwrap();
        assert!(derived(&store).is_empty());

        engine
            .apply(RelationChange::Updated(
                located("edge2", "france", "europe").with_window(at(2010), None),
            ))
            .unwrap();
        assert!(derived_between(&store, "paris", "europe").is_some());
    }

    #[test]
    fn confidence_update_leaves_other_justifications_alone() {
        let (engine, store) = engine();
        engine
            .apply_all(vec![
                RelationChange::Created(located("a1", "paris", "france").with_confidence(40)),
                RelationChange::Created(located("a2", "france", "europe").with_confidence(40)),
                RelationChange::Created(located("b1", "paris", "idf").with_confidence(60)),
                RelationChange::Created(located("b2", "idf", "europe").with_confidence(60)),
            ])
            .unwrap();
        assert_eq!(derived_between(&store, "paris", "europe").unwrap().confidence, 60);

        engine
            .apply(RelationChange::Updated(
                located("a2", "france", "europe").with_confidence(100),
            ))
            .unwrap();
        let inferred = derived_between(&store, "paris", "europe").unwrap();
        assert_eq!(inferred.confidence, 70);
        assert_eq!(inferred.explanation(), ids(&["a1", "a2", "b1", "b2"]));
    }

    #[test]
    fn moving_an_endpoint_rederives() {
        let (engine, store) = engine();
        engine
            .apply_all(vec![
                RelationChange::Created(located("edge1", "paris", "france")),
                RelationChange::Created(located("edge2", "france", "europe")),
                RelationChange::Updated(located("edge1", "lyon", "france")),
            ])
            .unwrap();
        assert!(derived_between(&store, "paris", "europe").is_none());
        let inferred = derived_between(&store, "lyon", "europe").unwrap();
        assert_eq!(inferred.explanation(), ids(&["edge1", "edge2"]));
    }

    #[test]
    fn derived_relationships_ignore_external_changes() {
        let (engine, store) = engine();
        engine
            .apply_all(vec![
                RelationChange::Created(located("edge1", "paris", "france")),
                RelationChange::Created(located("edge2", "france", "europe")),
            ])
            .unwrap();
        let inferred = derived_between(&store, "paris", "europe").unwrap();

        engine.apply(RelationChange::Deleted(inferred.id.clone())).unwrap();
        assert!(store.load_relationship(&inferred.id).unwrap().is_some());
    }

    #[test]
    fn runaway_cascade_is_an_invariant_violation() {
        let (engine, _store) = engine();
        let engine = engine.with_max_steps(1);
        engine
            .apply(RelationChange::Created(located("edge1", "paris", "france")))
            .unwrap();
        let err = engine
            .apply(RelationChange::Created(located("edge2", "france", "europe")))
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvariantViolation(_)));
    }

    #[test]
    fn purge_then_rescan() {
        let (engine, store) = engine();
        engine
            .apply_all(vec![
                RelationChange::Created(located("ab", "a", "b")),
                RelationChange::Created(located("bc", "b", "c")),
                RelationChange::Created(located("cd", "c", "d")),
            ])
            .unwrap();
        let before = derived(&store);
        assert_eq!(before.len(), 3);

        let report = engine.purge("located_at_located").unwrap();
        assert_eq!(report.retracted, 3);
        assert!(derived(&store).is_empty());
        assert_eq!(store.relationship_count(), 3);

        engine.rescan("located_at_located").unwrap();
        assert_eq!(derived(&store), before);
    }

    #[test]
    fn rescan_of_unknown_rule_is_a_config_error() {
        let (engine, _store) = engine();
        assert!(matches!(engine.rescan("nope"), Err(ManagerError::Config(_))));
    }

    #[tokio::test]
    async fn handles_feed_batches_in_order() {
        let (engine, store) = engine();
        let event = |event_type: EventType, id: &str, from: &str, to: &str| {
            let mut data = EventData::new(id, "relationship");
            data.relationship_type = Some(RELATION_LOCATED_AT.to_string());
            data.source_ref = Some(from.to_string());
            data.target_ref = Some(to.to_string());
            StreamEvent::at_position(NewEvent::new(event_type, data), 1)
        };
        let batch = vec![
            event(EventType::Create, "edge1", "paris", "france"),
            event(EventType::Create, "edge2", "france", "europe"),
            StreamEvent::at_position(
                NewEvent::new(EventType::Update, EventData::new("report-1", "report")),
                3,
            ),
        ];
        engine.handle(&batch).await.unwrap();
        assert!(derived_between(&store, "paris", "europe").is_some());

        engine
            .handle(&[event(EventType::Delete, "edge2", "france", "europe")])
            .await
            .unwrap();
        assert!(derived(&store).is_empty());
    }

    /// Delegates to a memory store, blocking the calling thread on every save
    struct SlowStore {
        inner: MemoryStore,
        delay: std::time::Duration,
    }

    impl RelationStore for SlowStore {
        fn save_relationship(&self, rel: &Relationship) -> StorageResult<()> {
            std::thread::sleep(self.delay);
            self.inner.save_relationship(rel)
        }

        fn load_relationship(&self, id: &RelationshipId) -> StorageResult<Option<Relationship>> {
            self.inner.load_relationship(id)
        }

        fn delete_relationship(&self, id: &RelationshipId) -> StorageResult<bool> {
            self.inner.delete_relationship(id)
        }

        fn find_relationships(&self, filter: &RelationFilter) -> StorageResult<Vec<Relationship>> {
            self.inner.find_relationships(filter)
        }

        fn find_supported_by(&self, support: &RelationshipId) -> StorageResult<Vec<Relationship>> {
            self.inner.find_supported_by(support)
        }
    }

    #[tokio::test]
    async fn slow_store_does_not_stall_the_runtime() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: std::time::Duration::from_millis(40),
        });
        let catalog = RuleCatalog::builder()
            .rule(RelationToRelationRule::located_at_located())
            .build();
        let engine = RuleEngine::new(Arc::new(catalog), store.clone());
        let event = |id: &str, from: &str, to: &str| {
            let mut data = EventData::new(id, "relationship");
            data.relationship_type = Some(RELATION_LOCATED_AT.to_string());
            data.source_ref = Some(from.to_string());
            data.target_ref = Some(to.to_string());
            StreamEvent::at_position(NewEvent::new(EventType::Create, data), 1)
        };
        let batch = vec![
            event("edge1", "paris", "france"),
            event("edge2", "france", "europe"),
        ];

        // Single-threaded runtime: the ticker only advances if the handler yields
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
        };
        engine.handle(&batch).await.unwrap();
        ticker.abort();

        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 3);
        assert!(derived_between(&store.inner, "paris", "europe").is_some());
    }
}
