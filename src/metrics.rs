//! Metrics Registry (C14): the concrete shape of the metrics-registry
//! collaborator the pipeline hands back to embedders. Built on
//! `prometheus`.
//!
//! Every gauge/counter/histogram the pipeline needs (`flush_failures`,
//! `queue_depth`, ring length, encryptor latency) lives here as a plain
//! struct field, registered once into a `prometheus::Registry` that
//! `metrics_registry()` hands back to embedders.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

pub struct PipelineMetrics {
    pub ring_depth: IntGauge,
    pub outbox_bytes: IntGauge,
    pub outbox_near_limit_total: IntCounter,
    pub queue_depth: IntGauge,
    pub flush_failures_total: IntCounter,
    pub ingest_attempts_total: IntCounter,
    pub ingest_successes_total: IntCounter,
    pub records_dropped_total: IntCounter,
    pub encrypt_latency_seconds: Histogram,
    pub flush_latency_seconds: Histogram,
    registry: Registry,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        let ring_depth = IntGauge::new("audit_ring_depth", "Records currently in the ring buffer").unwrap();
        let outbox_bytes = IntGauge::new("audit_outbox_bytes", "Outbox file size in bytes").unwrap();
        let outbox_near_limit_total = IntCounter::new(
            "audit_outbox_near_limit_total",
            "Times the outbox crossed 80% of MAX_FILE_BYTES",
        )
        .unwrap();
        let queue_depth = IntGauge::new("audit_queue_depth", "Records pending delivery (ring + outbox)").unwrap();
        let flush_failures_total = IntCounter::new("audit_flush_failures_total", "Failed flush attempts").unwrap();
        let ingest_attempts_total = IntCounter::new("audit_ingest_attempts_total", "Ingest POST attempts").unwrap();
        let ingest_successes_total =
            IntCounter::new("audit_ingest_successes_total", "Successful ingest POSTs").unwrap();
        let records_dropped_total =
            IntCounter::new("audit_records_dropped_total", "Records abandoned after retry exhaustion").unwrap();
        let encrypt_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "audit_encrypt_latency_seconds",
            "Envelope-encryption latency",
        ))
        .unwrap();
        let flush_latency_seconds =
            Histogram::with_opts(HistogramOpts::new("audit_flush_latency_seconds", "Batch flush latency")).unwrap();

        registry.register(Box::new(ring_depth.clone())).unwrap();
        registry.register(Box::new(outbox_bytes.clone())).unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();
        registry.register(Box::new(outbox_near_limit_total.clone())).unwrap();
        registry.register(Box::new(flush_failures_total.clone())).unwrap();
        registry.register(Box::new(ingest_attempts_total.clone())).unwrap();
        registry.register(Box::new(ingest_successes_total.clone())).unwrap();
        registry.register(Box::new(records_dropped_total.clone())).unwrap();
        registry.register(Box::new(encrypt_latency_seconds.clone())).unwrap();
        registry.register(Box::new(flush_latency_seconds.clone())).unwrap();

        Arc::new(Self {
            ring_depth,
            outbox_bytes,
            outbox_near_limit_total,
            queue_depth,
            flush_failures_total,
            ingest_attempts_total,
            ingest_successes_total,
            records_dropped_total,
            encrypt_latency_seconds,
            flush_latency_seconds,
            registry,
        })
    }

    /// Handle exposed to embedders via `AuditPipeline::metrics_registry()`.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_name_collisions() {
        let metrics = PipelineMetrics::new();
        assert!(!metrics.registry().gather().is_empty());
    }
}
