//! Prometheus metrics for the memory engine
//!
//! Features:
//! - Registry metrics (live resources, releases by type)
//! - Release pressure metrics (freed bytes, skipped candidates)
//! - Lock, snapshot, allocator, compaction and leak counters

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // Registry metrics
    pub static ref RESOURCES_REGISTERED: IntGauge = IntGauge::new(
        "memwarden_resources_registered",
        "Number of resources currently registered"
    ).unwrap();

    pub static ref RESOURCES_RELEASED: IntCounterVec = IntCounterVec::new(
        Opts::new("memwarden_resources_released_total", "Resources released"),
        &["type", "reason"]
    ).unwrap();

    // Release pressure metrics
    pub static ref FREED_BYTES: IntCounter = IntCounter::new(
        "memwarden_freed_bytes_total",
        "Bytes freed or saved by pressure passes"
    ).unwrap();

    pub static ref PRESSURE_PASSES: IntCounter = IntCounter::new(
        "memwarden_pressure_passes_total",
        "Memory pressure passes executed"
    ).unwrap();

    // Lock metrics
    pub static ref LOCK_TIMEOUTS: IntCounterVec = IntCounterVec::new(
        Opts::new("memwarden_lock_timeouts_total", "Lock acquisitions that timed out"),
        &["mode"]
    ).unwrap();

    pub static ref LOCKS_FORCE_RELEASED: IntCounter = IntCounter::new(
        "memwarden_locks_force_released_total",
        "Locks released by the expiry sweep or owner cleanup"
    ).unwrap();

    // Snapshot metrics
    pub static ref SNAPSHOTS_HELD: IntGauge = IntGauge::new(
        "memwarden_snapshots_held",
        "Snapshots currently held"
    ).unwrap();

    pub static ref ROLLBACKS: IntCounterVec = IntCounterVec::new(
        Opts::new("memwarden_rollbacks_total", "Snapshot rollbacks"),
        &["status"]
    ).unwrap();

    // Allocator metrics
    pub static ref COMPRESSED_BLOCKS: IntGauge = IntGauge::new(
        "memwarden_compressed_blocks",
        "Allocator blocks currently compressed"
    ).unwrap();

    pub static ref COMPRESSION_OPS: IntCounterVec = IntCounterVec::new(
        Opts::new("memwarden_compression_operations_total", "Block compress/decompress operations"),
        &["op", "status"]
    ).unwrap();

    // Compaction and leak metrics
    pub static ref COMPACTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("memwarden_compactions_total", "Compaction passes"),
        &["trigger"]
    ).unwrap();

    pub static ref LEAKS_CONFIRMED: IntCounter = IntCounter::new(
        "memwarden_leaks_confirmed_total",
        "Confirmed leak detections"
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(RESOURCES_REGISTERED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(RESOURCES_RELEASED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(FREED_BYTES.clone())).ok();
    METRICS_REGISTRY.register(Box::new(PRESSURE_PASSES.clone())).ok();

    METRICS_REGISTRY.register(Box::new(LOCK_TIMEOUTS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(LOCKS_FORCE_RELEASED.clone())).ok();

    METRICS_REGISTRY.register(Box::new(SNAPSHOTS_HELD.clone())).ok();
    METRICS_REGISTRY.register(Box::new(ROLLBACKS.clone())).ok();

    METRICS_REGISTRY.register(Box::new(COMPRESSED_BLOCKS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(COMPRESSION_OPS.clone())).ok();

    METRICS_REGISTRY.register(Box::new(COMPACTIONS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(LEAKS_CONFIRMED.clone())).ok();

    info!("Metrics initialized successfully");
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_twice() {
        init_metrics();
        // Re-registration is ignored
        init_metrics();
    }

    #[test]
    fn test_export_contains_prefix() {
        init_metrics();
        FREED_BYTES.inc_by(1024);
        RESOURCES_RELEASED
            .with_label_values(&["temp_buffers", "pressure"])
            .inc();

        let output = export_metrics();
        assert!(output.contains("memwarden_freed_bytes_total"));
        assert!(output.contains("memwarden_resources_released_total"));
    }
}
