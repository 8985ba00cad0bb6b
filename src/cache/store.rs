//! TTL cache storage with single-flight population.
//!
//! Each key owns a slot holding a `tokio::sync::OnceCell`. The first caller
//! that finds the slot empty runs the computation; concurrent callers for the
//! same key wait on the cell and receive that caller's value. Expired slots
//! are swapped out lazily on access and proactively by [`CacheStore::purge_expired`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

const METRIC_HIT: &str = "rulecache_hit_total";
const METRIC_MISS: &str = "rulecache_miss_total";
const METRIC_EVICT: &str = "rulecache_evict_total";

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct Slot<T> {
    cell: OnceCell<Entry<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.cell.get().is_some_and(|entry| !entry.is_live(now))
    }
}

/// An empty slot that only the map still references: its computation failed
/// or was cancelled and nobody is waiting on it.
fn is_abandoned<T>(slot: &Arc<Slot<T>>) -> bool {
    slot.cell.get().is_none() && Arc::strong_count(slot) == 1
}

/// In-memory cache keyed by string with per-entry absolute expiry.
pub struct CacheStore<T> {
    slots: DashMap<String, Arc<Slot<T>>>,
}

impl<T> CacheStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Return the live value under `key`, or run `compute` and cache its
    /// result for `ttl`.
    ///
    /// The returned flag is `true` when this call produced the value. A
    /// failed computation caches nothing; waiting callers then take over the
    /// computation themselves.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<(T, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let slot = self.live_or_pending_slot(key);
        if let Some(entry) = slot.cell.get() {
            counter!(METRIC_HIT).increment(1);
            return Ok((entry.value.clone(), false));
        }

        let mut computed = false;
        let initialized = slot
            .cell
            .get_or_try_init(|| {
                let computed = &mut computed;
                async move {
                    let value = compute().await?;
                    *computed = true;
                    Ok(Entry {
                        value,
                        expires_at: Instant::now() + ttl,
                    })
                }
            })
            .await;
        let entry = match initialized {
            Ok(entry) => entry,
            Err(error) => {
                // Leave no empty slot behind unless another caller filled it meanwhile.
                self.slots.remove_if(key, |_, current| {
                    Arc::ptr_eq(current, &slot) && current.cell.get().is_none()
                });
                return Err(error);
            }
        };

        if computed {
            counter!(METRIC_MISS).increment(1);
            trace!(key, ttl_ms = ttl.as_millis() as u64, "Cache entry populated");
        } else {
            counter!(METRIC_HIT).increment(1);
        }
        Ok((entry.value.clone(), computed))
    }

    /// Live value under `key`, without computing anything.
    pub fn get(&self, key: &str) -> Option<T> {
        let slot = self.slots.get(key)?.value().clone();
        slot.cell
            .get()
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Drop the entry under `key`. Removing an absent key is a no-op.
    ///
    /// Returns `true` if a live value was removed. A computation already in
    /// flight for the key still completes for its waiters, but its result is
    /// not reachable by later callers.
    pub fn remove(&self, key: &str) -> bool {
        let Some((_, slot)) = self.slots.remove(key) else {
            return false;
        };
        let was_live = slot
            .cell
            .get()
            .is_some_and(|entry| entry.is_live(Instant::now()));
        if was_live {
            counter!(METRIC_EVICT).increment(1);
            debug!(key, "Cache entry removed");
        }
        was_live
    }

    /// Drop every expired entry, and every empty slot left by a cancelled
    /// computation, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !slot.is_expired(now) && !is_abandoned(slot));
        let purged = before.saturating_sub(self.slots.len());
        if purged > 0 {
            debug!(purged, "Expired cache entries purged");
        }
        purged
    }

    /// Number of slots, including ones still being computed or already
    /// expired but not yet purged.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Run [`purge_expired`](Self::purge_expired) every `every` on the current
    /// tokio runtime until the returned handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                self.purge_expired();
            }
        })
    }

    /// Slot for `key` that is either still empty or holds a live entry.
    fn live_or_pending_slot(&self, key: &str) -> Arc<Slot<T>> {
        loop {
            let slot = match self.slots.get(key) {
                Some(existing) => existing.value().clone(),
                None => self
                    .slots
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Slot::new()))
                    .value()
                    .clone(),
            };

            if !slot.is_expired(Instant::now()) {
                return slot;
            }
            // Only drop the slot we looked at; a concurrent caller may have
            // already replaced it with a fresh one.
            self.slots
                .remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
            trace!(key, "Expired cache entry dropped");
        }
    }
}

impl<T> Default for CacheStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
