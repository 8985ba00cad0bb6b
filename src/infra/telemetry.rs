use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for the cache counters with the installed metrics
/// recorder. Only the first call has an effect.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "rulecache_hit_total",
            Unit::Count,
            "Total number of reads served from a live cache entry."
        );
        describe_counter!(
            "rulecache_miss_total",
            Unit::Count,
            "Total number of reads that ran their retrieval."
        );
        describe_counter!(
            "rulecache_evict_total",
            Unit::Count,
            "Total number of live entries removed by invalidation or explicit removal."
        );
        describe_counter!(
            "rulecache_rule_registered_total",
            Unit::Count,
            "Total number of invalidation rules registered."
        );
        describe_counter!(
            "rulecache_predicate_panic_total",
            Unit::Count,
            "Total number of rule predicates that panicked during evaluation."
        );
    });
}
