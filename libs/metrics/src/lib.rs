//! We re-export those from prometheus crate and define metric helpers here
//! so that all metric definitions in the workspace go through one place.

use once_cell::sync::Lazy;
use prometheus::core::{AtomicU64, Collector, GenericGauge, GenericGaugeVec};
pub use prometheus::opts;
pub use prometheus::register;
pub use prometheus::Error;
pub use prometheus::{core, default_registry, proto};
pub use prometheus::{exponential_buckets, linear_buckets};
pub use prometheus::{register_counter_vec, Counter, CounterVec};
pub use prometheus::{register_gauge, Gauge};
pub use prometheus::{register_gauge_vec, GaugeVec};
pub use prometheus::{register_histogram, Histogram};
pub use prometheus::{register_histogram_vec, HistogramVec};
pub use prometheus::{register_int_counter, IntCounter};
pub use prometheus::{register_int_counter_vec, IntCounterVec};
pub use prometheus::{register_int_gauge, IntGauge};
pub use prometheus::{register_int_gauge_vec, IntGaugeVec};
pub use prometheus::{Encoder, TextEncoder};

pub type UIntGauge = GenericGauge<AtomicU64>;
pub type UIntGaugeVec = GenericGaugeVec<AtomicU64>;

#[macro_export]
macro_rules! register_uint_gauge_vec {
    ($NAME:expr, $HELP:expr, $LABELS_NAMES:expr $(,)?) => {{
        let gauge_vec =
            $crate::UIntGaugeVec::new($crate::opts!($NAME, $HELP), $LABELS_NAMES).unwrap();
        $crate::register(Box::new(gauge_vec.clone())).map(|_| gauge_vec)
    }};
}

#[macro_export]
macro_rules! register_uint_gauge {
    ($NAME:expr, $HELP:expr $(,)?) => {{
        let gauge = $crate::UIntGauge::new($NAME, $HELP).unwrap();
        $crate::register(Box::new(gauge.clone())).map(|_| gauge)
    }};
}

/// Gathers all Prometheus metrics from the default registry.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    prometheus::gather()
}

static DISK_IO_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "libmetrics_disk_io_bytes_total",
        "Bytes written and read from disk, grouped by the operation (read|write)",
        &["io_operation"]
    )
    .expect("Failed to register disk i/o bytes int gauge vec")
});

/// Records bytes flowing through a disk reader/writer so hot paths only pay
/// for one counter add.
pub fn disk_io_bytes_observe(op: &str, bytes: u64) {
    DISK_IO_BYTES.with_label_values(&[op]).inc_by(bytes);
}

/// Checks that the provided collector is registered in the default registry.
/// Useful for unit-testing that a Lazy metric bundle got wired up.
pub fn is_registered(c: &impl Collector) -> bool {
    let descs = c.desc();
    let families = prometheus::gather();
    descs.iter().any(|d| {
        families
            .iter()
            .any(|mf| mf.get_name() == d.fq_name.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_gauge_macro_registers() {
        let gauge = register_uint_gauge!("libmetrics_test_gauge", "test gauge").unwrap();
        gauge.set(3);
        assert!(is_registered(&gauge));
        assert_eq!(gauge.get(), 3);
    }
}
