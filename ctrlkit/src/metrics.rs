//! Prometheus metrics for controllers.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `ctrlkit_sync_total` - Sync invocations by outcome
//! - `ctrlkit_requeues_total` - Rate-limited requeues by reason
//! - `ctrlkit_panics_total` - Panics recovered from workers and hooks
//!
//! ## Gauges
//! - `ctrlkit_queue_depth` - Keys ready to be handed to a worker
//!
//! ## Histograms
//! - `ctrlkit_sync_duration_seconds` - Sync duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for ctrlkit metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Sync invocations.
///
/// Labels:
/// - `controller`: controller name
/// - `result`: `success`, `error` or `requeue`
pub static SYNC_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("ctrlkit_sync_total", "Total number of sync invocations");
    CounterVec::new(opts, &["controller", "result"])
        .expect("ctrlkit_sync_total metric creation failed")
});

/// Rate-limited requeues.
///
/// Labels:
/// - `controller`: controller name
/// - `reason`: `error` or `synthetic`
pub static REQUEUES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("ctrlkit_requeues_total", "Total number of rate-limited requeues");
    CounterVec::new(opts, &["controller", "reason"])
        .expect("ctrlkit_requeues_total metric creation failed")
});

/// Recovered panics.
pub static PANICS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("ctrlkit_panics_total", "Total number of panics in controller tasks");
    CounterVec::new(opts, &["controller"]).expect("ctrlkit_panics_total metric creation failed")
});

/// Work queue depth.
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("ctrlkit_queue_depth", "Keys ready to be processed");
    GaugeVec::new(opts, &["queue"]).expect("ctrlkit_queue_depth metric creation failed")
});

/// Sync duration in seconds.
pub static SYNC_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "ctrlkit_sync_duration_seconds",
        "Sync duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["controller"])
        .expect("ctrlkit_sync_duration_seconds metric creation failed")
});

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(SYNC_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(REQUEUES_TOTAL.clone()),
        Box::new(PANICS_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(SYNC_DURATION_SECONDS.clone()),
    ] {
        match registry.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

pub fn record_sync(controller: &str, result: &str) {
    SYNC_TOTAL.with_label_values(&[controller, result]).inc();
}

pub fn record_requeue(controller: &str, reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[controller, reason]).inc();
}

pub fn record_panic(controller: &str) {
    PANICS_TOTAL.with_label_values(&[controller]).inc();
}

pub fn set_queue_depth(queue: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[queue]).set(depth);
}

pub fn observe_sync_duration(controller: &str, duration_secs: f64) {
    SYNC_DURATION_SECONDS
        .with_label_values(&[controller])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
