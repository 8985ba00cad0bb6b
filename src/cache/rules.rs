//! Invalidation rules: which entity changes make a cached read stale.

use std::fmt;
use std::sync::Arc;

use super::error::CacheError;
use super::registry::RuleRegistry;

/// Classification of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Tracking state of an entity as reported by the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    Added,
    Modified,
    Deleted,
    Unchanged,
    Detached,
}

impl EntityState {
    /// Maps the tracking state to a change kind; states that do not represent
    /// a pending write have none and never reach rule evaluation.
    pub fn change_kind(self) -> Option<ChangeKind> {
        match self {
            EntityState::Added => Some(ChangeKind::Insert),
            EntityState::Modified => Some(ChangeKind::Update),
            EntityState::Deleted => Some(ChangeKind::Delete),
            EntityState::Unchanged | EntityState::Detached => None,
        }
    }
}

impl From<ChangeKind> for EntityState {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Insert => EntityState::Added,
            ChangeKind::Update => EntityState::Modified,
            ChangeKind::Delete => EntityState::Deleted,
        }
    }
}

type Predicate<E> = dyn Fn(&E, ChangeKind) -> bool + Send + Sync;

/// Binds a cache key to a predicate over changes of entity type `E`.
pub struct CacheRule<E> {
    cache_key: Arc<str>,
    predicate: Arc<Predicate<E>>,
}

impl<E> CacheRule<E> {
    pub fn new<P>(cache_key: impl Into<String>, predicate: P) -> Result<Self, CacheError>
    where
        P: Fn(&E, ChangeKind) -> bool + Send + Sync + 'static,
    {
        let cache_key = cache_key.into();
        if cache_key.trim().is_empty() {
            return Err(CacheError::invalid_argument(
                "cache_key",
                "must not be empty",
            ));
        }
        Ok(Self {
            cache_key: cache_key.into(),
            predicate: Arc::new(predicate),
        })
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn matches(&self, entity: &E, kind: ChangeKind) -> bool {
        (self.predicate)(entity, kind)
    }
}

impl<E> Clone for CacheRule<E> {
    fn clone(&self) -> Self {
        Self {
            cache_key: Arc::clone(&self.cache_key),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<E> fmt::Debug for CacheRule<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRule")
            .field("cache_key", &self.cache_key)
            .field("entity", &std::any::type_name::<E>())
            .finish_non_exhaustive()
    }
}

/// Handed to rule-declaration callbacks; every rule it adds is bound to the
/// key of the read being cached.
pub struct RuleConfigurator<'a> {
    cache_key: &'a str,
    registry: &'a RuleRegistry,
    added: usize,
}

impl<'a> RuleConfigurator<'a> {
    pub(crate) fn new(cache_key: &'a str, registry: &'a RuleRegistry) -> Self {
        Self {
            cache_key,
            registry,
            added: 0,
        }
    }

    pub fn cache_key(&self) -> &str {
        self.cache_key
    }

    /// Invalidate the bound key whenever `predicate` holds for a pending
    /// change of an `E`. A rule for this key and entity type that is already
    /// registered is left untouched.
    pub fn add_cache_rule<E, P>(&mut self, predicate: P) -> &mut Self
    where
        E: Send + Sync + 'static,
        P: Fn(&E, ChangeKind) -> bool + Send + Sync + 'static,
    {
        let rule = CacheRule {
            cache_key: Arc::from(self.cache_key),
            predicate: Arc::new(predicate),
        };
        if self.registry.add_rule(rule) {
            self.added += 1;
        }
        self
    }

    /// Number of rules this configurator actually inserted.
    pub fn added(&self) -> usize {
        self.added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Category {
        business_id: i32,
    }

    #[test]
    fn states_map_to_change_kinds() {
        assert_eq!(EntityState::Added.change_kind(), Some(ChangeKind::Insert));
        assert_eq!(EntityState::Modified.change_kind(), Some(ChangeKind::Update));
        assert_eq!(EntityState::Deleted.change_kind(), Some(ChangeKind::Delete));
        assert_eq!(EntityState::Unchanged.change_kind(), None);
        assert_eq!(EntityState::Detached.change_kind(), None);
    }

    #[test]
    fn change_kind_round_trips_through_state() {
        for kind in [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete] {
            assert_eq!(EntityState::from(kind).change_kind(), Some(kind));
        }
    }

    #[test]
    fn rule_evaluates_predicate() {
        let rule = CacheRule::new("ns.Categories.BusinessId-1", |c: &Category, kind| {
            c.business_id == 1 && kind != ChangeKind::Insert
        })
        .expect("valid rule");

        assert!(rule.matches(&Category { business_id: 1 }, ChangeKind::Update));
        assert!(!rule.matches(&Category { business_id: 1 }, ChangeKind::Insert));
        assert!(!rule.matches(&Category { business_id: 2 }, ChangeKind::Delete));
    }

    #[test]
    fn empty_key_is_rejected() {
        let error = CacheRule::new("  ", |_: &Category, _| true).expect_err("blank key");
        assert!(matches!(
            error,
            CacheError::InvalidArgument {
                what: "cache_key",
                ..
            }
        ));
    }

    #[test]
    fn configurator_chains_and_counts_new_rules() {
        let registry = RuleRegistry::new();
        let mut rules = RuleConfigurator::new("ns.Report", &registry);
        rules
            .add_cache_rule::<Category, _>(|c, _| c.business_id == 1)
            .add_cache_rule::<Category, _>(|c, _| c.business_id == 2)
            .add_cache_rule::<String, _>(|_, kind| kind == ChangeKind::Delete);

        assert_eq!(rules.added(), 2);
        assert_eq!(registry.rule_count::<Category>(), 1);
        assert_eq!(registry.rule_count::<String>(), 1);
    }
}
