//! Per-entity-type invalidation rule registry.
//!
//! Rules are grouped by the entity type they watch and are unique per
//! `(cache key, entity type)`. The registry only grows: rules are declared
//! alongside every cached read and stay registered for the registry's
//! lifetime.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, error};

use super::lock::{rw_read, rw_write};
use super::rules::CacheRule;

const SOURCE: &str = "cache::registry";
const METRIC_RULE_REGISTERED: &str = "rulecache_rule_registered_total";

trait ErasedRuleSet: Send + Sync {
    fn len(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

struct RuleSet<E> {
    rules: RwLock<HashMap<Arc<str>, CacheRule<E>>>,
}

impl<E> RuleSet<E> {
    fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
        }
    }
}

impl<E: 'static> ErasedRuleSet for RuleSet<E> {
    fn len(&self) -> usize {
        rw_read(&self.rules, SOURCE, "len").len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Tracks entity type → rules for that type.
///
/// Each entity type has its own lock, so registering rules for one type never
/// blocks evaluation of another.
pub struct RuleRegistry {
    sets: DashMap<TypeId, Arc<dyn ErasedRuleSet>>,
}

impl RuleRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            sets: DashMap::new(),
        }
    }

    /// Register `rule` unless a rule with the same cache key already exists
    /// for `E`.
    ///
    /// The first registration wins: a duplicate is dropped and its predicate
    /// ignored. Returns `true` if the rule was inserted.
    pub fn add_rule<E>(&self, rule: CacheRule<E>) -> bool
    where
        E: Send + Sync + 'static,
    {
        let set = self
            .sets
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Arc::new(RuleSet::<E>::new()) as Arc<dyn ErasedRuleSet>)
            .value()
            .clone();
        let Some(set) = set.as_any().downcast_ref::<RuleSet<E>>() else {
            error!(
                entity = std::any::type_name::<E>(),
                "Rule set registered under a foreign type id"
            );
            return false;
        };

        let mut rules = rw_write(&set.rules, SOURCE, "add_rule");
        if rules.contains_key(rule.cache_key()) {
            return false;
        }

        debug!(
            cache_key = rule.cache_key(),
            entity = std::any::type_name::<E>(),
            "Cache rule registered"
        );
        rules.insert(Arc::from(rule.cache_key()), rule);
        counter!(METRIC_RULE_REGISTERED).increment(1);
        true
    }

    /// Snapshot of the rules registered for `E`, in no particular order.
    pub fn rules_for<E>(&self) -> Vec<CacheRule<E>>
    where
        E: Send + Sync + 'static,
    {
        self.with_set::<E, _>(|rules| rules.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a rule bound to `cache_key` exists for `E`.
    pub fn contains<E>(&self, cache_key: &str) -> bool
    where
        E: Send + Sync + 'static,
    {
        self.with_set::<E, _>(|rules| rules.contains_key(cache_key))
            .unwrap_or(false)
    }

    /// Number of rules registered for `E`.
    pub fn rule_count<E>(&self) -> usize
    where
        E: Send + Sync + 'static,
    {
        self.with_set::<E, _>(HashMap::len).unwrap_or(0)
    }

    /// Number of rules across all entity types.
    pub fn total_rules(&self) -> usize {
        self.sets.iter().map(|set| set.value().len()).sum()
    }

    /// Number of entity types with at least one rule set.
    pub fn entity_type_count(&self) -> usize {
        self.sets.len()
    }

    fn with_set<E, R>(&self, f: impl FnOnce(&HashMap<Arc<str>, CacheRule<E>>) -> R) -> Option<R>
    where
        E: Send + Sync + 'static,
    {
        let set = self.sets.get(&TypeId::of::<E>())?.value().clone();
        let set = set.as_any().downcast_ref::<RuleSet<E>>()?;
        let rules = rw_read(&set.rules, SOURCE, "read");
        Some(f(&rules))
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::cache::rules::ChangeKind;

    struct Category {
        business_id: i32,
    }

    struct Product;

    fn rule(key: &str, business_id: i32) -> CacheRule<Category> {
        CacheRule::new(key, move |c: &Category, _| c.business_id == business_id)
            .expect("valid rule")
    }

    #[test]
    fn add_and_lookup() {
        let registry = RuleRegistry::new();

        assert!(registry.add_rule(rule("ns.Cat.BusinessId-1", 1)));

        let rules = registry.rules_for::<Category>();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].cache_key(), "ns.Cat.BusinessId-1");
        assert!(registry.contains::<Category>("ns.Cat.BusinessId-1"));
        assert!(registry.rules_for::<Product>().is_empty());
    }

    #[test]
    fn duplicate_identity_keeps_first_predicate() {
        let registry = RuleRegistry::new();

        assert!(registry.add_rule(rule("ns.Cat", 1)));
        assert!(!registry.add_rule(rule("ns.Cat", 2)));

        assert_eq!(registry.rule_count::<Category>(), 1);
        let kept = &registry.rules_for::<Category>()[0];
        assert!(kept.matches(&Category { business_id: 1 }, ChangeKind::Update));
        assert!(!kept.matches(&Category { business_id: 2 }, ChangeKind::Update));
    }

    #[test]
    fn same_key_on_different_types_are_distinct_rules() {
        let registry = RuleRegistry::new();

        assert!(registry.add_rule(rule("ns.Report", 1)));
        assert!(registry.add_rule(
            CacheRule::new("ns.Report", |_: &Product, _| true).expect("valid rule")
        ));

        assert_eq!(registry.rule_count::<Category>(), 1);
        assert_eq!(registry.rule_count::<Product>(), 1);
        assert_eq!(registry.total_rules(), 2);
        assert_eq!(registry.entity_type_count(), 2);
    }

    #[test]
    fn concurrent_registration_collapses_duplicates() {
        let registry = Arc::new(RuleRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        registry.add_rule(rule(&format!("ns.Cat.{i}"), 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("registration thread");
        }

        assert_eq!(registry.rule_count::<Category>(), 50);
    }

    #[test]
    fn registry_recovers_from_poisoned_lock() {
        let registry = RuleRegistry::new();
        registry.add_rule(rule("ns.Cat.1", 1));

        let set = registry
            .sets
            .get(&TypeId::of::<Category>())
            .expect("rule set exists")
            .value()
            .clone();
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let typed = set
                .as_any()
                .downcast_ref::<RuleSet<Category>>()
                .expect("typed rule set");
            let _guard = typed.rules.write().expect("rules lock should be acquired");
            panic!("poison rules lock");
        }));

        assert!(registry.add_rule(rule("ns.Cat.2", 2)));
        assert_eq!(registry.rule_count::<Category>(), 2);
    }
}
