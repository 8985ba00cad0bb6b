//! Cache configuration.
//!
//! Loaded from the `[cache]` table of `rulecache.toml` (see [`crate::config`]).

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_NAMESPACE: &str = "rulecache";
const DEFAULT_TTL_SECS: u64 = 15 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Cache configuration from `rulecache.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch. When off, reads bypass the store and commits compute no
    /// invalidations.
    pub enabled: bool,
    /// Prefix of every generated cache key.
    pub namespace: String,
    /// TTL applied by `CacheAccessor::get` when the caller does not pass one.
    pub default_ttl_secs: u64,
    /// Interval of the background expiry sweep; `0` disables it.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_ttl_secs: DEFAULT_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Returns the sweep interval, or `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.namespace, "rulecache");
        assert_eq!(config.default_ttl(), Duration::from_secs(900));
        assert_eq!(config.sweep_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn zero_interval_disables_sweeper() {
        let config = CacheConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.sweep_interval().is_none());
    }

    #[test]
    fn partial_table_keeps_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{ "namespace": "shop" }"#).expect("valid cache table");
        assert_eq!(config.namespace, "shop");
        assert_eq!(config.default_ttl_secs, 900);
        assert!(config.enabled);
    }
}
