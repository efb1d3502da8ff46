use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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

/// Register descriptions for the cache metrics with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "boardcache_hit_total",
            Unit::Count,
            "Total number of cache hits, labelled by freshness state."
        );
        describe_counter!(
            "boardcache_miss_total",
            Unit::Count,
            "Total number of cache misses that fetched fresh data."
        );
        describe_counter!(
            "boardcache_evict_total",
            Unit::Count,
            "Total number of entries evicted due to the memory budget."
        );
        describe_counter!(
            "boardcache_frontend_error_total",
            Unit::Count,
            "Total number of failed counter or fetch calls."
        );
        describe_gauge!(
            "boardcache_bytes",
            Unit::Bytes,
            "Estimated bytes currently held by the cache."
        );
        describe_gauge!(
            "boardcache_entries",
            Unit::Count,
            "Current number of cache entries."
        );
        describe_histogram!(
            "boardcache_fetch_ms",
            Unit::Milliseconds,
            "Latency of cache misses in milliseconds, including the counter check."
        );
    });
}
