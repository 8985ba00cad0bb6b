//! Rule-driven read cache
//!
//! Cached reads declare, next to the read itself, which entity changes make
//! them stale. Writes hand their pending changes to a [`CacheTrigger`] before
//! committing; the matching keys are evicted once the commit succeeded.
//!
//! - [`CacheAccessor`]: get-or-populate reads and rule declaration
//! - [`CacheTrigger`]: before/after-commit hooks for the write path
//! - [`CacheStore`]: TTL storage with single-flight population
//! - [`RuleRegistry`] and [`ChangeEvaluator`]: rules per entity type and
//!   their evaluation against a [`ChangeBatch`]
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `rulecache.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! namespace = "shop"
//! default_ttl_secs = 900
//! sweep_interval_secs = 60
//! ```

mod accessor;
mod config;
mod error;
mod evaluator;
mod keys;
mod lock;
mod registry;
mod rules;
mod store;
mod trigger;

pub use accessor::{CacheAccessor, CachedValue};
pub use config::CacheConfig;
pub use error::CacheError;
pub use evaluator::{ChangeBatch, ChangeEvaluator, PendingChange};
pub use keys::{FilterValue, KeyFilter, KeyGenerator};
pub use registry::RuleRegistry;
pub use rules::{CacheRule, ChangeKind, EntityState, RuleConfigurator};
pub use store::CacheStore;
pub use trigger::{CacheTrigger, PendingInvalidation};
