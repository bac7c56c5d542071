//! Prometheus metrics for the fleetplane controllers
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the
//! following metrics:
//! - `fleetplane_reconcile_duration_seconds` (histogram): reconcile duration by controller.
//! - `fleetplane_reconcile_errors_total` (counter): reconcile errors by controller and kind.
//! - `fleetplane_queue_depth` (gauge): keys waiting in a controller's work queue.
//! - `fleetplane_ipam_allocations_total` (counter): addresses assigned, labeled by pool.
//! - `fleetplane_ipam_exhausted_total` (counter): allocations that found every pool full.
//! - `fleetplane_seed_sync_failures_total` (counter): failed per-seed syncs labeled by seed.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "ipam"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see `Error::kind`
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolLabels {
    pub cidr: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SeedLabels {
    pub seed: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets; IPAM waits land in the upper range.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_DEPTH: Lazy<Family<ReconcileLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static IPAM_ALLOCATIONS_TOTAL: Lazy<Family<PoolLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static IPAM_EXHAUSTED_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static SEED_SYNC_FAILURES_TOTAL: Lazy<Family<SeedLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "fleetplane_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "fleetplane_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "fleetplane_queue_depth",
        "Keys waiting in the controller work queue",
        QUEUE_DEPTH.clone(),
    );
    registry.register(
        "fleetplane_ipam_allocations",
        "Addresses assigned by the IPAM controller",
        IPAM_ALLOCATIONS_TOTAL.clone(),
    );
    registry.register(
        "fleetplane_ipam_exhausted",
        "Allocation attempts that found every pool exhausted",
        IPAM_EXHAUSTED_TOTAL.clone(),
    );
    registry.register(
        "fleetplane_seed_sync_failures",
        "Failed syncs of a master object into a seed",
        SEED_SYNC_FAILURES_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_queue_depth(controller: &str, depth: usize) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    QUEUE_DEPTH
        .get_or_create(&labels)
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn inc_ipam_allocation(cidr: &str) {
    let labels = PoolLabels {
        cidr: cidr.to_string(),
    };
    IPAM_ALLOCATIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_ipam_exhausted() {
    IPAM_EXHAUSTED_TOTAL.inc();
}

pub fn inc_seed_sync_failure(seed: &str) {
    let labels = SeedLabels {
        seed: seed.to_string(),
    };
    SEED_SYNC_FAILURES_TOTAL.get_or_create(&labels).inc();
}

/// Render the registry in the OpenMetrics text format
pub fn encode_metrics() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
