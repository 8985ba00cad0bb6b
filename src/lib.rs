//! Rule-driven invalidation for an in-memory TTL read cache.
//!
//! Reads are cached through [`cache::CacheAccessor`] together with the rules
//! that say which entity changes make them stale. The write pipeline hands its
//! pending changes to a [`cache::CacheTrigger`] before committing and applies
//! the resulting [`cache::PendingInvalidation`] once the commit succeeded.

pub mod cache;
pub mod config;
pub mod infra;
