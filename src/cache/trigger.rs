//! Write-pipeline hooks.
//!
//! Invalidation is split around the commit: keys are computed from the
//! pending changes before the transaction commits (while the old entity
//! values are still observable) and applied only after it succeeded.
//!
//! # Usage
//!
//! ```ignore
//! let pending = trigger.before_commit(&batch);
//! transaction.commit().await?;   // on error `pending` is dropped, nothing is evicted
//! pending.apply();
//! ```

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::accessor::CachedValue;
use super::config::CacheConfig;
use super::evaluator::{ChangeBatch, ChangeEvaluator};
use super::store::CacheStore;

/// Connects a storage layer's commit path to the cache.
pub struct CacheTrigger<T = CachedValue> {
    config: CacheConfig,
    evaluator: ChangeEvaluator,
    store: Arc<CacheStore<T>>,
}

impl<T> CacheTrigger<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig, evaluator: ChangeEvaluator, store: Arc<CacheStore<T>>) -> Self {
        Self {
            config,
            evaluator,
            store,
        }
    }

    /// Compute the keys invalidated by `batch`. Must run before the commit.
    pub fn before_commit(&self, batch: &ChangeBatch) -> PendingInvalidation<T> {
        if !self.config.enabled {
            debug!(
                changes = batch.len(),
                "Cache invalidation skipped: cache disabled"
            );
            return PendingInvalidation::new(HashSet::new(), Arc::clone(&self.store));
        }

        let keys = self.evaluator.evaluate(batch);
        PendingInvalidation::new(keys, Arc::clone(&self.store))
    }

    /// Run `commit` between the two hooks: keys are evaluated up front and
    /// evicted only if the commit returns `Ok`.
    pub async fn commit_with<R, E, Fut>(&self, batch: &ChangeBatch, commit: Fut) -> Result<R, E>
    where
        Fut: Future<Output = Result<R, E>>,
    {
        let pending = self.before_commit(batch);
        match commit.await {
            Ok(result) => {
                pending.apply();
                Ok(result)
            }
            Err(error) => {
                if !pending.is_empty() {
                    warn!(
                        discarded = pending.len(),
                        "Commit failed; cache invalidation discarded"
                    );
                }
                Err(error)
            }
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn evaluator(&self) -> &ChangeEvaluator {
        &self.evaluator
    }

    pub fn store(&self) -> &Arc<CacheStore<T>> {
        &self.store
    }
}

/// Keys waiting for their transaction to commit.
///
/// Dropping the value without calling [`apply`](Self::apply) evicts nothing,
/// which is exactly what a failed commit needs.
#[must_use = "keys are only evicted when `apply` is called after a successful commit"]
pub struct PendingInvalidation<T = CachedValue> {
    keys: HashSet<String>,
    store: Arc<CacheStore<T>>,
}

impl<T> PendingInvalidation<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(keys: HashSet<String>, store: Arc<CacheStore<T>>) -> Self {
        Self { keys, store }
    }

    pub fn keys(&self) -> &HashSet<String> {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Evict every pending key. Call only once the commit succeeded.
    ///
    /// Returns the number of keys processed; keys with no live entry are
    /// skipped silently.
    pub fn apply(self) -> usize {
        if self.keys.is_empty() {
            return 0;
        }

        let evicted = self
            .keys
            .iter()
            .filter(|key| self.store.remove(key))
            .count();
        info!(
            invalidated = self.keys.len(),
            evicted,
            "Cache keys invalidated after commit"
        );
        self.keys.len()
    }
}

impl<T> fmt::Debug for PendingInvalidation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingInvalidation")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}
