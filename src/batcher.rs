//! Batcher (C8): composes batches from the ring buffer and the outbox,
//! caps flush concurrency at one in flight, and drives the transport with
//! retry/backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{AuditError, Result};
use crate::metrics::PipelineMetrics;
use crate::outbox::Outbox;
use crate::record::Record;
use crate::ring_buffer::RingBuffer;
use crate::transport::{IngestBatchBody, IngestBatchRecord, Transport};

/// Items pulled into a batch, tagged by where they came from so a failed
/// flush knows exactly what to restore.
struct DrippedItem {
    record: Record,
    raw_line: Option<String>,
}

pub struct Batcher {
    tenant_id: String,
    batch_size: usize,
    ring: Arc<RingBuffer<Record>>,
    outbox: Arc<Outbox>,
    transport: Arc<Transport>,
    metrics: Arc<PipelineMetrics>,
    flushing: AtomicBool,
    /// Self-reference so `enqueue` can spawn an opportunistic flush without
    /// changing its `&self` signature at every call site. Populated via
    /// `Arc::new_cyclic` at construction.
    self_ref: std::sync::Weak<Batcher>,
}

impl Batcher {
    pub fn new(
        tenant_id: String,
        batch_size: usize,
        ring: Arc<RingBuffer<Record>>,
        outbox: Arc<Outbox>,
        transport: Arc<Transport>,
        metrics: Arc<PipelineMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            tenant_id,
            batch_size,
            ring,
            outbox,
            transport,
            metrics,
            flushing: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    /// Enqueue a record that has already been durably appended to the
    /// outbox: push it into the ring, and opportunistically schedule a
    /// flush once the ring reaches `batch_size` (the periodic timer in
    /// `pipeline.rs` is the other half of the scheduling model).
    pub fn enqueue(&self, record: Record) {
        self.ring.push(record);
        self.metrics.queue_depth.set(self.ring.len() as i64);

        if self.ring.len() >= self.batch_size {
            if let Some(batcher) = self.self_ref.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = batcher.flush_once().await {
                        tracing::warn!(error = %e, "opportunistic size-threshold flush failed");
                    }
                });
            }
        }
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    /// Run one flush cycle if no other flush is in flight; otherwise a
    /// no-op. Returns `true` if this call actually performed a flush
    /// attempt.
    pub async fn flush_once(&self) -> Result<bool> {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let result = self.flush_inner().await;
        self.flushing.store(false, Ordering::SeqCst);
        result.map(|_| true)
    }

    async fn flush_inner(&self) -> Result<()> {
        let start = Instant::now();

        let ring_items: Vec<Record> = self.ring.drip(self.batch_size);
        let mut batch: Vec<DrippedItem> =
            ring_items.into_iter().map(|record| DrippedItem { record, raw_line: None }).collect();

        let mut disk_consumed = 0usize;
        if batch.len() < self.batch_size {
            let want = self.batch_size - batch.len();
            let (disk_records, disk_lines) = self.outbox.stream_head(want).await?;
            disk_consumed = disk_records.len();
            for (record, raw_line) in disk_records.into_iter().zip(disk_lines.into_iter()) {
                batch.push(DrippedItem { record, raw_line: Some(raw_line) });
            }
        }

        if batch.is_empty() {
            return Ok(());
        }

        let first_leaf_hash = batch[0].record.leaf_hash.clone();
        let body = IngestBatchBody {
            tenant_id: self.tenant_id.clone(),
            records: batch
                .iter()
                .map(|item| IngestBatchRecord {
                    payload: serde_json::to_value(&item.record)
                        .unwrap_or(serde_json::Value::Null),
                    leaf_hash: item.record.leaf_hash.clone(),
                })
                .collect(),
        };

        self.metrics.ingest_attempts_total.inc();
        match self.transport.post_with_retry(&body, &first_leaf_hash).await {
            Ok(()) => {
                self.metrics.ingest_successes_total.inc();
                // Only disk-sourced records were still present in the
                // outbox; ring-sourced ones were already drained from it
                // by a prior append+drip cycle, so truncate by
                // disk-consumed count only.
                self.outbox.truncate_prefix(disk_consumed).await?;
                self.metrics.queue_depth.set(self.ring.len() as i64);
                self.metrics.flush_latency_seconds.observe(start.elapsed().as_secs_f64());
                Ok(())
            }
            Err(e) => {
                self.metrics.flush_failures_total.inc();
                // Restore ring-sourced items to the head of the outbox --
                // they were consumed from the ring and are not otherwise
                // represented on disk anymore. This can duplicate
                // disk-sourced items already on disk on a later retry; the
                // wire protocol's Idempotency-Key is the recovery
                // mechanism for that.
                let restore: Vec<String> = batch
                    .iter()
                    .filter(|item| item.raw_line.is_none())
                    .map(|item| serde_json::to_string(&item.record).unwrap_or_default())
                    .collect();
                if !restore.is_empty() {
                    self.outbox.prepend(&restore).await?;
                }
                self.metrics.queue_depth.set(self.ring.len() as i64);
                Err(e)
            }
        }
    }

    /// Exponential backoff retry wrapper for shutdown/force-flush paths:
    /// `500 * 2^(n-1)` ms, capped at 4000ms, up to `max_retries` attempts.
    pub async fn flush_with_retry(&self, max_retries: u32) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.flush_once().await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < max_retries => {
                    let delay_ms = (500u64 * 2u64.pow(attempt - 1)).min(4000);
                    tracing::warn!(attempt, delay_ms, error = %e, "flush failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain to empty: keep flushing with retry until the outbox is empty
    /// or `deadline` elapses. Returns `Err` (data loss) if the deadline is
    /// hit with records still outstanding.
    pub async fn drain_to_empty(&self, max_retries: u32, deadline: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            let ring_empty = self.ring.is_empty();
            let disk_empty = self.outbox.total_disk_records().await? == 0;
            if ring_empty && disk_empty {
                return Ok(());
            }
            if started.elapsed() >= deadline {
                return Err(AuditError::Network("drain deadline exceeded with records outstanding".into()));
            }

            match self.flush_with_retry(max_retries).await {
                Ok(()) => continue,
                Err(_) if started.elapsed() < deadline => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
