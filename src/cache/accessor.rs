//! Read-side façade.
//!
//! [`CacheAccessor::get`] ties key generation, rule registration and the
//! store together: the caller supplies the retrieval, the filter that
//! identifies the read and a callback declaring which entity changes make it
//! stale.

use std::any::Any;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::config::CacheConfig;
use super::error::CacheError;
use super::evaluator::ChangeEvaluator;
use super::keys::{KeyFilter, KeyGenerator};
use super::registry::RuleRegistry;
use super::rules::RuleConfigurator;
use super::store::CacheStore;
use super::trigger::CacheTrigger;

/// Type-erased value held by the shared store. Every entry is an
/// `Arc<Vec<T>>` for the `T` the read was declared with.
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// Get-or-populate entry point for cached reads.
pub struct CacheAccessor {
    config: CacheConfig,
    keys: KeyGenerator,
    registry: Arc<RuleRegistry>,
    store: Arc<CacheStore<CachedValue>>,
}

impl CacheAccessor {
    /// Accessor with its own empty registry and store.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(RuleRegistry::new()),
            Arc::new(CacheStore::new()),
        )
    }

    /// Accessor over an existing registry and store, e.g. ones shared with
    /// another accessor.
    pub fn with_parts(
        config: CacheConfig,
        registry: Arc<RuleRegistry>,
        store: Arc<CacheStore<CachedValue>>,
    ) -> Self {
        Self {
            keys: KeyGenerator::from_config(&config),
            config,
            registry,
            store,
        }
    }

    /// [`get_with_ttl`](Self::get_with_ttl) with the configured default TTL.
    pub async fn get<T, F, Fut, E, C>(
        &self,
        retrieve: F,
        filter: &KeyFilter,
        rule_config: C,
    ) -> Result<Arc<Vec<T>>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
        C: FnOnce(&mut RuleConfigurator<'_>),
    {
        self.get_with_ttl(retrieve, filter, rule_config, self.config.default_ttl())
            .await
    }

    /// Return the cached result of the read identified by `T` and `filter`,
    /// running `retrieve` on a miss.
    ///
    /// `rule_config` runs on every call, before the lookup; rules it declares
    /// are bound to this read's key and registered at most once. A failing
    /// `retrieve` caches nothing and surfaces as [`CacheError::Retrieve`].
    /// With the cache disabled every call runs `retrieve` and stores nothing.
    pub async fn get_with_ttl<T, F, Fut, E, C>(
        &self,
        retrieve: F,
        filter: &KeyFilter,
        rule_config: C,
        ttl: Duration,
    ) -> Result<Arc<Vec<T>>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
        C: FnOnce(&mut RuleConfigurator<'_>),
    {
        if ttl.is_zero() {
            return Err(CacheError::invalid_argument("ttl", "must be positive"));
        }

        let key = self.keys.generate_key_for::<T>(filter);
        let rules_added = {
            let mut rules = RuleConfigurator::new(&key, &self.registry);
            rule_config(&mut rules);
            rules.added()
        };

        if !self.config.enabled {
            let records = retrieve().await.map_err(CacheError::retrieve)?;
            debug!(
                key = %key,
                records = records.len(),
                "Cache disabled; result retrieved without caching"
            );
            return Ok(Arc::new(records));
        }

        let (value, computed) = self
            .store
            .get_or_compute(&key, ttl, move || async move {
                let records = retrieve().await.map_err(CacheError::retrieve)?;
                Ok::<CachedValue, CacheError>(Arc::new(records))
            })
            .await?;

        let records = value
            .downcast::<Vec<T>>()
            .map_err(|_| CacheError::TypeMismatch { key: key.clone() })?;

        if computed {
            debug!(
                key = %key,
                records = records.len(),
                rules_added,
                "Cache miss; result retrieved"
            );
        } else {
            debug!(key = %key, records = records.len(), "Cache hit");
        }
        Ok(records)
    }

    /// Evict the read identified by `T` and `filter`.
    pub fn remove_for<T: ?Sized>(&self, filter: &KeyFilter) -> bool {
        self.remove(&self.keys.generate_key_for::<T>(filter))
    }

    /// Evict `key`. Returns `true` if a live entry was dropped.
    pub fn remove(&self, key: &str) -> bool {
        self.store.remove(key)
    }

    /// Cache key of the read identified by `T` and `filter`.
    pub fn key_for<T: ?Sized>(&self, filter: &KeyFilter) -> String {
        self.keys.generate_key_for::<T>(filter)
    }

    /// Write-pipeline hooks bound to this accessor's registry and store.
    pub fn trigger(&self) -> CacheTrigger {
        CacheTrigger::new(
            self.config.clone(),
            ChangeEvaluator::new(Arc::clone(&self.registry)),
            Arc::clone(&self.store),
        )
    }

    /// Start the background expiry sweep if one is configured. Must be called
    /// from within a tokio runtime.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let every = self.config.sweep_interval()?;
        info!(
            interval_secs = every.as_secs(),
            "Cache expiry sweeper started"
        );
        Some(Arc::clone(&self.store).spawn_sweeper(every))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn key_generator(&self) -> &KeyGenerator {
        &self.keys
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<CacheStore<CachedValue>> {
        &self.store
    }
}

impl Default for CacheAccessor {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
