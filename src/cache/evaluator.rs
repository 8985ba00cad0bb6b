//! Pending-change evaluation.
//!
//! A [`ChangeBatch`] collects the entities a transaction is about to write,
//! grouped by entity type. [`ChangeEvaluator::evaluate`] runs every rule
//! registered for each type against each change and returns the cache keys
//! that must be evicted once the transaction commits.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, error, warn};

use super::registry::RuleRegistry;
use super::rules::{CacheRule, ChangeKind, EntityState};

const METRIC_PREDICATE_PANIC: &str = "rulecache_predicate_panic_total";

/// An entity snapshot paired with the write about to be applied to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange<E> {
    pub entity: E,
    pub kind: ChangeKind,
}

trait ErasedChanges: Send + Sync {
    fn len(&self) -> usize;
    fn collect_keys(&self, registry: &RuleRegistry, keys: &mut HashSet<String>);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct TypedChanges<E> {
    changes: Vec<PendingChange<E>>,
}

impl<E> ErasedChanges for TypedChanges<E>
where
    E: Send + Sync + 'static,
{
    fn len(&self) -> usize {
        self.changes.len()
    }

    fn collect_keys(&self, registry: &RuleRegistry, keys: &mut HashSet<String>) {
        let rules = registry.rules_for::<E>();
        if rules.is_empty() {
            return;
        }

        for change in &self.changes {
            for rule in &rules {
                // Predicates are pure, so a key that already matched needs no
                // second opinion.
                if keys.contains(rule.cache_key()) {
                    continue;
                }
                if rule_matches(rule, change) {
                    keys.insert(rule.cache_key().to_string());
                }
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A panicking predicate counts as a match: evicting too much only costs a
/// recomputation, keeping a stale entry serves wrong data.
fn rule_matches<E>(rule: &CacheRule<E>, change: &PendingChange<E>) -> bool {
    match catch_unwind(AssertUnwindSafe(|| rule.matches(&change.entity, change.kind))) {
        Ok(matched) => matched,
        Err(_) => {
            warn!(
                cache_key = rule.cache_key(),
                entity = std::any::type_name::<E>(),
                change_kind = ?change.kind,
                result = "assumed_match",
                "Cache rule predicate panicked"
            );
            counter!(METRIC_PREDICATE_PANIC).increment(1);
            true
        }
    }
}

/// Pending changes of one transaction, grouped by entity type.
#[derive(Default)]
pub struct ChangeBatch {
    by_type: HashMap<TypeId, Box<dyn ErasedChanges>>,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an already classified change.
    pub fn push<E>(&mut self, entity: E, kind: ChangeKind) -> &mut Self
    where
        E: Send + Sync + 'static,
    {
        let changes = self
            .by_type
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                Box::new(TypedChanges::<E> {
                    changes: Vec::new(),
                }) as Box<dyn ErasedChanges>
            });
        match changes.as_any_mut().downcast_mut::<TypedChanges<E>>() {
            Some(typed) => typed.changes.push(PendingChange { entity, kind }),
            None => error!(
                entity = std::any::type_name::<E>(),
                "Change list registered under a foreign type id"
            ),
        }
        self
    }

    /// Record a tracked entity by its storage state. Entities that are not
    /// being inserted, updated or deleted are skipped; returns whether the
    /// entity was recorded.
    pub fn track<E>(&mut self, entity: E, state: EntityState) -> bool
    where
        E: Send + Sync + 'static,
    {
        match state.change_kind() {
            Some(kind) => {
                self.push(entity, kind);
                true
            }
            None => false,
        }
    }

    /// Pending changes recorded for `E`.
    pub fn changes<E>(&self) -> &[PendingChange<E>]
    where
        E: Send + Sync + 'static,
    {
        self.by_type
            .get(&TypeId::of::<E>())
            .and_then(|changes| changes.as_any().downcast_ref::<TypedChanges<E>>())
            .map(|typed| typed.changes.as_slice())
            .unwrap_or(&[])
    }

    /// Total number of pending changes across all entity types.
    pub fn len(&self) -> usize {
        self.by_type.values().map(|changes| changes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entity_type_count(&self) -> usize {
        self.by_type.len()
    }
}

impl<E> Extend<(E, ChangeKind)> for ChangeBatch
where
    E: Send + Sync + 'static,
{
    fn extend<I: IntoIterator<Item = (E, ChangeKind)>>(&mut self, iter: I) {
        for (entity, kind) in iter {
            self.push(entity, kind);
        }
    }
}

/// Computes which cache keys a batch of pending changes invalidates.
#[derive(Clone)]
pub struct ChangeEvaluator {
    registry: Arc<RuleRegistry>,
}

impl ChangeEvaluator {
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self { registry }
    }

    /// Keys of every rule whose predicate holds for at least one pending
    /// change of its entity type. Rules are read once per entity type, at
    /// call time.
    pub fn evaluate(&self, batch: &ChangeBatch) -> HashSet<String> {
        let mut keys = HashSet::new();
        for changes in batch.by_type.values() {
            changes.collect_keys(&self.registry, &mut keys);
        }

        debug!(
            changes = batch.len(),
            entity_types = batch.entity_type_count(),
            invalidated = keys.len(),
            "Change batch evaluated"
        );
        keys
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Category {
        id: i32,
        business_id: i32,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Product {
        business_id: i32,
    }

    struct Business {
        id: i32,
    }

    fn category(business_id: i32) -> Category {
        Category {
            id: 10,
            business_id,
        }
    }

    fn evaluator_with(setup: impl FnOnce(&RuleRegistry)) -> ChangeEvaluator {
        let registry = Arc::new(RuleRegistry::new());
        setup(&registry);
        ChangeEvaluator::new(registry)
    }

    fn add<E: Send + Sync + 'static>(
        registry: &RuleRegistry,
        key: &str,
        predicate: impl Fn(&E, ChangeKind) -> bool + Send + Sync + 'static,
    ) {
        registry.add_rule(CacheRule::new(key, predicate).expect("valid rule"));
    }

    #[test]
    fn matching_change_yields_key_for_any_kind() {
        let evaluator = evaluator_with(|registry| {
            add(registry, "K", |c: &Category, _| c.business_id == 1);
        });

        for kind in [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete] {
            let mut batch = ChangeBatch::new();
            batch.push(category(1), kind);
            assert_eq!(evaluator.evaluate(&batch), HashSet::from(["K".to_string()]));
        }
    }

    #[test]
    fn non_matching_change_yields_nothing() {
        let evaluator = evaluator_with(|registry| {
            add(registry, "K", |c: &Category, _| c.business_id == 1);
        });

        let mut batch = ChangeBatch::new();
        batch.push(category(2), ChangeKind::Update);
        assert!(evaluator.evaluate(&batch).is_empty());
    }

    #[test]
    fn unrelated_entity_types_never_match() {
        let evaluator = evaluator_with(|registry| {
            add(registry, "K", |c: &Category, _| c.business_id == 1);
        });

        let mut batch = ChangeBatch::new();
        batch
            .push(Product { business_id: 1 }, ChangeKind::Insert)
            .push(Business { id: 1 }, ChangeKind::Delete);
        assert!(evaluator.evaluate(&batch).is_empty());
    }

    #[test]
    fn change_kind_is_passed_to_predicate() {
        let evaluator = evaluator_with(|registry| {
            add(registry, "K", |p: &Product, kind| {
                p.business_id == 1 && kind != ChangeKind::Update
            });
        });

        let mut updates = ChangeBatch::new();
        updates.push(Product { business_id: 1 }, ChangeKind::Update);
        assert!(evaluator.evaluate(&updates).is_empty());

        let mut deletes = ChangeBatch::new();
        deletes.push(Product { business_id: 1 }, ChangeKind::Delete);
        assert!(evaluator.evaluate(&deletes).contains("K"));
    }

    #[test]
    fn keys_are_reported_once() {
        let evaluator = evaluator_with(|registry| {
            add(registry, "K1", |c: &Category, _| c.business_id == 1);
            add(registry, "K1", |p: &Product, _| p.business_id == 1);
            add(registry, "K2", |b: &Business, kind| {
                b.id == 1 && kind == ChangeKind::Delete
            });
        });

        let mut batch = ChangeBatch::new();
        batch.extend([
            (category(1), ChangeKind::Insert),
            (category(1), ChangeKind::Update),
        ]);
        batch
            .push(Product { business_id: 1 }, ChangeKind::Delete)
            .push(Business { id: 1 }, ChangeKind::Delete);

        let keys = evaluator.evaluate(&batch);
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("K1"));
        assert!(keys.contains("K2"));
    }

    #[test]
    fn unclassified_states_are_skipped() {
        let mut batch = ChangeBatch::new();

        assert!(batch.track(category(1), EntityState::Modified));
        assert!(!batch.track(category(1), EntityState::Unchanged));
        assert!(!batch.track(category(1), EntityState::Detached));

        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch.changes::<Category>(),
            &[PendingChange {
                entity: category(1),
                kind: ChangeKind::Update
            }]
        );
        assert!(batch.changes::<Product>().is_empty());
    }

    #[test]
    fn panicking_predicate_invalidates_its_key() {
        let evaluator = evaluator_with(|registry| {
            add(registry, "fragile", |c: &Category, _| {
                if c.id == 10 {
                    panic!("predicate bug");
                }
                false
            });
            add(registry, "steady", |c: &Category, _| c.business_id == 5);
        });

        let mut batch = ChangeBatch::new();
        batch.push(category(1), ChangeKind::Update);

        let keys = evaluator.evaluate(&batch);
        assert_eq!(keys, HashSet::from(["fragile".to_string()]));
    }

    #[test]
    fn empty_batch_evaluates_to_empty_set() {
        let evaluator = evaluator_with(|registry| {
            add(registry, "K", |_: &Category, _| true);
        });
        let batch = ChangeBatch::new();
        assert!(batch.is_empty());
        assert!(evaluator.evaluate(&batch).is_empty());
    }
}
