//! Outbox (C6): append-only, crash-safe JSON-lines log of pending records.
//!
//! One writer at a time (`tokio::sync::Mutex`) so line order in the file
//! always matches append order, which is what makes "truncate the first k
//! lines" a well-defined operation.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::{AuditError, Result};
use crate::metrics::PipelineMetrics;
use crate::record::Record;
use std::sync::Arc;

/// Outbox never grows past this without backpressure being asserted.
pub const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;
const WARN_THRESHOLD_BYTES: u64 = (MAX_FILE_BYTES as f64 * 0.8) as u64;

pub struct Outbox {
    path: PathBuf,
    write_lock: Mutex<()>,
    metrics: Arc<PipelineMetrics>,
}

impl Outbox {
    pub async fn open(data_dir: &Path, metrics: Arc<PipelineMetrics>) -> Result<Self> {
        let queue_dir = data_dir.join("queue");
        fs::create_dir_all(&queue_dir)
            .await
            .map_err(|e| AuditError::Config(format!("failed to create queue dir: {e}")))?;
        let path = queue_dir.join("outbox.log");
        // touch the file so size()/stream_head() work before the first append.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AuditError::Config(format!("failed to open outbox: {e}")))?;
        Ok(Self { path, write_lock: Mutex::new(()), metrics })
    }

    /// Append a record as one JSON line. Rejects with `Backpressure`
    /// without writing anything if the file is already at/above
    /// `MAX_FILE_BYTES`, and warns past 80% once the write lands.
    pub async fn append(&self, record: &Record) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let current_size = self.size_locked().await?;
        if current_size >= MAX_FILE_BYTES {
            return Err(AuditError::Backpressure { size: current_size, limit: MAX_FILE_BYTES });
        }

        let mut line = serde_json::to_vec(record)
            .map_err(|e| AuditError::Encoding(format!("record encode failed: {e}")))?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AuditError::Config(format!("failed to open outbox for append: {e}")))?;
        file.write_all(&line)
            .await
            .map_err(|e| AuditError::Config(format!("outbox append failed: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| AuditError::Config(format!("outbox fsync failed: {e}")))?;

        let size = self.size_locked().await?;
        self.metrics.outbox_bytes.set(size as i64);

        if size > WARN_THRESHOLD_BYTES {
            self.metrics.outbox_near_limit_total.inc();
            tracing::warn!(size, limit = MAX_FILE_BYTES, "outbox approaching size limit");
        }
        Ok(())
    }

    pub async fn size(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        self.size_locked().await
    }

    async fn size_locked(&self) -> Result<u64> {
        let meta = fs::metadata(&self.path)
            .await
            .map_err(|e| AuditError::Config(format!("outbox stat failed: {e}")))?;
        Ok(meta.len())
    }

    /// First `n` parsed records plus their raw lines, for the batcher and
    /// for truncation bookkeeping.
    pub async fn stream_head(&self, n: usize) -> Result<(Vec<Record>, Vec<String>)> {
        let _guard = self.write_lock.lock().await;
        let file = File::open(&self.path)
            .await
            .map_err(|e| AuditError::Config(format!("outbox open for read failed: {e}")))?;
        let mut lines = BufReader::new(file).lines();

        let mut records = Vec::with_capacity(n);
        let mut raw = Vec::with_capacity(n);
        while raw.len() < n {
            match lines
                .next_line()
                .await
                .map_err(|e| AuditError::Config(format!("outbox read failed: {e}")))?
            {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let record: Record = serde_json::from_str(&line)
                        .map_err(|e| AuditError::Encoding(format!("outbox line is not valid: {e}")))?;
                    records.push(record);
                    raw.push(line);
                }
                None => break,
            }
        }
        Ok((records, raw))
    }

    /// Count all lines currently on disk (for flush metrics / truncation
    /// math). Reads the whole file; outbox is capped at `MAX_FILE_BYTES` so
    /// this stays bounded.
    pub async fn total_disk_records(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let file = File::open(&self.path)
            .await
            .map_err(|e| AuditError::Config(format!("outbox open for read failed: {e}")))?;
        let mut lines = BufReader::new(file).lines();
        let mut count = 0;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| AuditError::Config(format!("outbox read failed: {e}")))?
        {
            if !line.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Rewrite the file without its first `k` lines. Crash-safe:
    /// write-to-temp-then-rename, so a crash mid-truncate either leaves the
    /// original file intact or completes atomically — never a partially
    /// written prefix.
    pub async fn truncate_prefix(&self, k: usize) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if k == 0 {
            return Ok(());
        }

        let file = File::open(&self.path)
            .await
            .map_err(|e| AuditError::Config(format!("outbox open for read failed: {e}")))?;
        let mut lines = BufReader::new(file).lines();

        let mut kept = Vec::new();
        let mut skipped = 0usize;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| AuditError::Config(format!("outbox read failed: {e}")))?
        {
            if line.trim().is_empty() {
                continue;
            }
            if skipped < k {
                skipped += 1;
                continue;
            }
            kept.push(line);
        }

        let tmp_path = self.path.with_extension("log.tmp");
        let mut tmp = File::create(&tmp_path)
            .await
            .map_err(|e| AuditError::Config(format!("outbox tmp create failed: {e}")))?;
        for line in &kept {
            tmp.write_all(line.as_bytes())
                .await
                .map_err(|e| AuditError::Config(format!("outbox tmp write failed: {e}")))?;
            tmp.write_all(b"\n")
                .await
                .map_err(|e| AuditError::Config(format!("outbox tmp write failed: {e}")))?;
        }
        tmp.sync_all()
            .await
            .map_err(|e| AuditError::Config(format!("outbox tmp fsync failed: {e}")))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| AuditError::Config(format!("outbox rename failed: {e}")))?;

        let size = self.size_locked().await?;
        self.metrics.outbox_bytes.set(size as i64);
        Ok(())
    }

    /// Prepend raw lines back to the head of the file — used when a
    /// failed flush must restore ring-sourced items it already consumed
    /// to the head of the outbox.
    pub async fn prepend(&self, lines: &[String]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if lines.is_empty() {
            return Ok(());
        }

        let existing = fs::read_to_string(&self.path)
            .await
            .map_err(|e| AuditError::Config(format!("outbox read for prepend failed: {e}")))?;

        let tmp_path = self.path.with_extension("log.tmp");
        let mut tmp = File::create(&tmp_path)
            .await
            .map_err(|e| AuditError::Config(format!("outbox tmp create failed: {e}")))?;
        for line in lines {
            tmp.write_all(line.as_bytes())
                .await
                .map_err(|e| AuditError::Config(format!("outbox tmp write failed: {e}")))?;
            tmp.write_all(b"\n")
                .await
                .map_err(|e| AuditError::Config(format!("outbox tmp write failed: {e}")))?;
        }
        tmp.write_all(existing.as_bytes())
            .await
            .map_err(|e| AuditError::Config(format!("outbox tmp write failed: {e}")))?;
        tmp.sync_all()
            .await
            .map_err(|e| AuditError::Config(format!("outbox tmp fsync failed: {e}")))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| AuditError::Config(format!("outbox rename failed: {e}")))?;

        let size = self.size_locked().await?;
        self.metrics.outbox_bytes.set(size as i64);
        Ok(())
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// JSON-lines validity check used by tests and audit tools: each line
/// parses independently of its neighbors.
pub fn parse_line(line: &str) -> Result<Value> {
    serde_json::from_str(line).map_err(|e| AuditError::Encoding(format!("invalid outbox line: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EncryptedBundle, ModelVendor};
    use chrono::Utc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn sample_record(tag: &str) -> Record {
        Record {
            id: Uuid::new_v4(),
            tenant_id: "t1".into(),
            model_vendor: ModelVendor::Openai,
            model_name: "gpt".into(),
            user_id: None,
            ts_client: Utc::now(),
            latency_ms: 12.34,
            prompt_tokens: 1,
            response_tokens: 2,
            static_meta: Default::default(),
            enc: EncryptedBundle {
                ciphertext: "x".into(),
                encrypted_data_key: "y".into(),
                suite_id: 1,
            },
            prev_hash: None,
            leaf_hash: tag.into(),
        }
    }

    #[tokio::test]
    async fn append_then_stream_head_round_trips() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::open(dir.path(), PipelineMetrics::new()).await.unwrap();
        outbox.append(&sample_record("leaf-a")).await.unwrap();
        outbox.append(&sample_record("leaf-b")).await.unwrap();

        let (records, raw) = outbox.stream_head(10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(raw.len(), 2);
        assert_eq!(records[0].leaf_hash, "leaf-a");
        assert_eq!(records[1].leaf_hash, "leaf-b");
    }

    #[tokio::test]
    async fn truncate_prefix_removes_only_the_leading_k_lines() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::open(dir.path(), PipelineMetrics::new()).await.unwrap();
        for tag in ["a", "b", "c"] {
            outbox.append(&sample_record(tag)).await.unwrap();
        }

        outbox.truncate_prefix(2).await.unwrap();
        let (records, _) = outbox.stream_head(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].leaf_hash, "c");
    }

    #[tokio::test]
    async fn truncate_to_zero_k_is_a_no_op() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::open(dir.path(), PipelineMetrics::new()).await.unwrap();
        outbox.append(&sample_record("a")).await.unwrap();
        outbox.truncate_prefix(0).await.unwrap();
        let (records, _) = outbox.stream_head(10).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn backpressure_rejects_append_once_over_limit() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::open(dir.path(), PipelineMetrics::new()).await.unwrap();

        // Simulate an oversized file directly rather than appending
        // MAX_FILE_BYTES worth of records one at a time.
        let filler = "x".repeat((MAX_FILE_BYTES + 1024) as usize);
        fs::write(outbox.path(), &filler).await.unwrap();

        let size_before = outbox.size().await.unwrap();
        let err = outbox.append(&sample_record("overflow")).await.unwrap_err();
        assert!(matches!(err, AuditError::Backpressure { .. }));
        // the rejected record must never be written: the file is checked
        // *before* writing, so size is unchanged (spec.md §8 E4 / property 6).
        assert_eq!(outbox.size().await.unwrap(), size_before);
        assert_eq!(size_before, filler.len() as u64);
    }

    #[tokio::test]
    async fn replayable_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let outbox = Outbox::open(dir.path(), PipelineMetrics::new()).await.unwrap();
            outbox.append(&sample_record("durable")).await.unwrap();
        }
        let reopened = Outbox::open(dir.path(), PipelineMetrics::new()).await.unwrap();
        let (records, _) = reopened.stream_head(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].leaf_hash, "durable");
    }
}
