use metrics::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_uint_gauge, register_uint_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge,
    UIntGauge, UIntGaugeVec,
};
use once_cell::sync::Lazy;

/// Prometheus histogram buckets (in seconds) for guard hold times. Guards are
/// normally held for the few microseconds a cursor needs to decode a record,
/// but a batch scan can legitimately hold one across many records; the upper
/// buckets exist to make a stuck guard visible.
const GUARD_HOLD_BUCKETS: &[f64] = &[
    0.000_001, 0.000_010, 0.000_100, // 1 us, 10 us, 100 us
    0.001_000, 0.010_000, 0.100_000, // 1 ms, 10 ms, 100 ms
    1.0, 10.0, 100.0, // 1 s, 10 s, 100 s
];

pub(crate) static PAGE_CACHE_READ_ACCESSES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pagestore_page_cache_read_accesses_total",
        "Number of read accesses to a page cache shard",
        &["cache", "shard"]
    )
    .expect("failed to define a metric")
});

pub(crate) static PAGE_CACHE_READ_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pagestore_page_cache_read_hits_total",
        "Number of read accesses to a page cache shard that hit",
        &["cache", "shard"]
    )
    .expect("failed to define a metric")
});

pub(crate) static PAGE_CACHE_EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pagestore_page_cache_evictions_total",
        "Number of pages removed from a page cache, by removal reason",
        &["cache", "reason"]
    )
    .expect("failed to define a metric")
});

pub(crate) static PAGE_CACHE_USED_BYTES: Lazy<UIntGaugeVec> = Lazy::new(|| {
    register_uint_gauge_vec!(
        "pagestore_page_cache_used_bytes",
        "Sum of used bytes of all pages mapped in a cache, guarded pages included",
        &["cache"]
    )
    .expect("failed to define a metric")
});

pub(crate) static OBJECT_CACHE_READ_ACCESSES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pagestore_object_cache_read_accesses_total",
        "Number of lookups in an object-level cache",
        &["cache"]
    )
    .expect("failed to define a metric")
});

pub(crate) static OBJECT_CACHE_READ_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pagestore_object_cache_read_hits_total",
        "Number of lookups in an object-level cache that hit",
        &["cache"]
    )
    .expect("failed to define a metric")
});

pub(crate) static GUARD_HOLD_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "pagestore_guard_hold_seconds",
        "Time between acquiring and releasing one page guard",
        GUARD_HOLD_BUCKETS.into(),
    )
    .expect("failed to define a metric")
});

pub(crate) static PHYSICAL_BYTES: Lazy<UIntGauge> = Lazy::new(|| {
    register_uint_gauge!(
        "pagestore_physical_bytes",
        "Resident bytes of all mapped allocator regions",
    )
    .expect("failed to define a metric")
});

pub(crate) static PHYSICAL_BYTES_HIGH_WATER: Lazy<UIntGauge> = Lazy::new(|| {
    register_uint_gauge!(
        "pagestore_physical_bytes_high_water",
        "Highest value pagestore_physical_bytes has reached",
    )
    .expect("failed to define a metric")
});

pub(crate) static BUDGET_DENIED_ALLOCATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pagestore_budget_denied_allocations_total",
        "Segment allocations refused because reclamation could not satisfy the budget",
    )
    .expect("failed to define a metric")
});

pub(crate) static REGIONS_RECLAIMED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pagestore_regions_reclaimed_total",
        "Fully-unused regions whose physical memory was released under budget pressure",
    )
    .expect("failed to define a metric")
});

pub(crate) static SEGMENTS_IN_USE: Lazy<UIntGaugeVec> = Lazy::new(|| {
    register_uint_gauge_vec!(
        "pagestore_segments_in_use",
        "Currently allocated segments per size class",
        &["size_class"]
    )
    .expect("failed to define a metric")
});

pub(crate) static TIL_RESIDUAL_BYTES: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "pagestore_til_residual_bytes",
        "Used bytes still owned by a transaction intent log when it was drained",
        vec![
            1024.0, 16384.0, 262144.0, 1048576.0, 4194304.0, 16777216.0, 67108864.0, 268435456.0,
        ],
    )
    .expect("failed to define a metric")
});

/// Intermediate pages the sliding-snapshot strategy currently has open. Any
/// steady-state value other than zero is a segment leak.
pub(crate) static SLIDING_SNAPSHOT_INTERMEDIATE_PAGES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pagestore_sliding_snapshot_intermediate_pages",
        "Open intermediate pages of the sliding-snapshot combiner (must be zero at rest)",
    )
    .expect("failed to define a metric")
});

/// Pages that still owned segments when they were dropped. Reclamation is
/// required to happen through reset() on the eviction or intent-log drain
/// paths, so this must stay zero.
pub(crate) static LEAKED_PAGE_RESETS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pagestore_leaked_page_resets_total",
        "Pages whose segments were returned by the drop handler instead of reset()",
    )
    .expect("failed to define a metric")
});

pub(crate) static SWEEP_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "pagestore_sweep_seconds",
        "Time one sweeper round over one shard took",
        vec![0.0001, 0.001, 0.01, 0.1, 1.0],
    )
    .expect("failed to define a metric")
});

pub(crate) static BACKGROUND_LOOP_PERIOD_OVERRUN_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pagestore_background_loop_period_overruns_total",
        "Incremented whenever a background loop iteration takes longer than its period",
        &["task"]
    )
    .expect("failed to define a metric")
});

/// Raise the high-water gauge to `current` if it grew. Gauges have no
/// fetch-max, so this is check-then-set; a lost race only delays the update
/// to the next allocation.
pub(crate) fn observe_physical_bytes(current: u64) {
    PHYSICAL_BYTES.set(current);
    if PHYSICAL_BYTES_HIGH_WATER.get() < current {
        PHYSICAL_BYTES_HIGH_WATER.set(current);
    }
}
