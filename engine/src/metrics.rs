use once_cell::sync::Lazy;

#[cfg(not(feature = "bench-no-metrics"))]
use prometheus::{Counter, Gauge, Histogram, HistogramOpts};

#[cfg(feature = "bench-no-metrics")]
mod shim {
    use super::*;
    pub struct NoopCounter;
    impl NoopCounter { pub fn inc(&self) {} }
    pub struct NoopGauge;
    impl NoopGauge { pub fn set(&self, _v: f64) {} }
    pub struct NoopHistogram;
    impl NoopHistogram { pub fn observe(&self, _v: f64) {} pub fn start_timer(&self) -> NoopTimer { NoopTimer } }
    pub struct NoopTimer; impl NoopTimer { pub fn observe_duration(self) {} }
    pub static RMI_REBUILDS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static RMI_REBUILD_FAILURES_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static RMI_REBUILD_DURATION_SECONDS: Lazy<NoopHistogram> = Lazy::new(|| NoopHistogram);
    pub static RMI_SEGMENTS: Lazy<NoopGauge> = Lazy::new(|| NoopGauge);
    pub static RMI_EPSILON_MAX: Lazy<NoopGauge> = Lazy::new(|| NoopGauge);
    pub static RMI_LOOKUPS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static RMI_MISSES_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static RMI_ADAPTIVE_REBUILDS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub fn render() -> String { String::new() }
}

#[cfg(feature = "bench-no-metrics")]
pub use shim::{
    render, RMI_ADAPTIVE_REBUILDS_TOTAL, RMI_EPSILON_MAX, RMI_LOOKUPS_TOTAL, RMI_MISSES_TOTAL,
    RMI_REBUILDS_TOTAL, RMI_REBUILD_DURATION_SECONDS, RMI_REBUILD_FAILURES_TOTAL, RMI_SEGMENTS,
};

#[cfg(not(feature = "bench-no-metrics"))]
pub static RMI_REBUILDS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!("rmidb_rebuilds_total", "Total number of published rebuilds")
        .expect("register rmidb_rebuilds_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RMI_REBUILD_FAILURES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "rmidb_rebuild_failures_total",
        "Rebuilds aborted before publishing"
    )
    .expect("register rmidb_rebuild_failures_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RMI_REBUILD_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "rmidb_rebuild_duration_seconds",
        "Full rebuild duration in seconds",
    )
    .buckets(vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]);
    prometheus::register_histogram!(opts).expect("register rmidb_rebuild_duration_seconds")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RMI_SEGMENTS: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!("rmidb_segments", "Segments in the published snapshot")
        .expect("register rmidb_segments")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RMI_EPSILON_MAX: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!(
        "rmidb_max_error_bound",
        "Largest segment error bound in the published snapshot"
    )
    .expect("register rmidb_max_error_bound")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RMI_LOOKUPS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!("rmidb_lookups_total", "Point lookups served")
        .expect("register rmidb_lookups_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RMI_MISSES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!("rmidb_lookup_misses_total", "Point lookups for absent keys")
        .expect("register rmidb_lookup_misses_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RMI_ADAPTIVE_REBUILDS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "rmidb_adaptive_rebuilds_total",
        "Rebuilds scheduled by observed-error monitoring"
    )
    .expect("register rmidb_adaptive_rebuilds_total")
});

/// Text exposition of every registered metric.
#[cfg(not(feature = "bench-no-metrics"))]
pub fn render() -> String {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
