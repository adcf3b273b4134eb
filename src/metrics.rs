//! Metric names and descriptions.
//!
//! All emitters reference these constants so dashboards and tests agree on
//! the names. Installing a recorder (and a tracing subscriber) is the host
//! application's job; without one, every emission is a no-op.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

pub const HIT_TOTAL: &str = "dispensa_cache_hit_total";
pub const MISS_TOTAL: &str = "dispensa_cache_miss_total";
pub const STALE_SERVED_TOTAL: &str = "dispensa_cache_stale_served_total";
pub const REGENERATE_TOTAL: &str = "dispensa_cache_regenerate_total";
pub const EVICT_TOTAL: &str = "dispensa_cache_evict_total";
pub const READ_ERROR_TOTAL: &str = "dispensa_cache_read_error_total";
pub const LEASE_RECLAIMED_TOTAL: &str = "dispensa_cache_lease_reclaimed_total";
pub const MEMORY_USED_BYTES: &str = "dispensa_cache_memory_used_bytes";
pub const PRODUCER_MS: &str = "dispensa_cache_producer_ms";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Register descriptions with the installed recorder. Idempotent; called
/// from every cache constructor so hosts get described metrics for free.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            HIT_TOTAL,
            Unit::Count,
            "Total number of fresh cache hits."
        );
        describe_counter!(
            MISS_TOTAL,
            Unit::Count,
            "Total number of cache misses, including expired and version-mismatched reads."
        );
        describe_counter!(
            STALE_SERVED_TOTAL,
            Unit::Count,
            "Total number of reads answered with a stale value inside the grace window."
        );
        describe_counter!(
            REGENERATE_TOTAL,
            Unit::Count,
            "Total number of background regenerations started under a lease."
        );
        describe_counter!(
            EVICT_TOTAL,
            Unit::Count,
            "Total number of entries evicted by the memory store's byte budget."
        );
        describe_counter!(
            READ_ERROR_TOTAL,
            Unit::Count,
            "Total number of backend read errors degraded to misses."
        );
        describe_counter!(
            LEASE_RECLAIMED_TOTAL,
            Unit::Count,
            "Total number of regeneration leases reclaimed after timeout."
        );
        describe_gauge!(
            MEMORY_USED_BYTES,
            Unit::Bytes,
            "Bytes currently held by the in-memory store."
        );
        describe_histogram!(
            PRODUCER_MS,
            Unit::Milliseconds,
            "Producer latency in milliseconds, labeled by regeneration mode."
        );
    });
}
