//! Wrapper / Capture (C11): times a user-supplied async LLM call, captures
//! its metadata, and drives C1–C7 without ever surfacing internal auditing
//! errors to the caller.

use std::collections::BTreeMap;
use std::future::Future;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::AuditPipeline;
use crate::record::{ModelVendor, Record};

/// Call-site metadata supplied by the embedder at each call.
pub struct CallMeta {
    pub model_vendor: ModelVendor,
    pub model_name: String,
    pub user_id: Option<String>,
    pub prompt_tokens: u64,
    pub response_tokens: u64,
}

impl AuditPipeline {
    /// Wrap an async LLM call. The wrapped call's `Result` is returned
    /// completely untouched; auditing failures are logged and counted,
    /// never propagated to the caller. Backpressure/shutdown rejections
    /// from the outbox are swallowed the same way here; callers that need
    /// to observe them directly should call `enqueue` themselves instead.
    pub async fn wrap_llm<F, Fut, T, E>(&self, prompt: Value, meta: CallMeta, call: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: serde::Serialize,
    {
        let t0 = tokio::time::Instant::now();
        let result = call().await;
        let latency_ms = Record::round_latency(t0.elapsed().as_secs_f64() * 1000.0);

        match &result {
            Ok(response) => {
                let response_value = serde_json::to_value(response).unwrap_or(Value::Null);
                if let Err(e) = self.capture_success(prompt, response_value, meta, latency_ms).await {
                    tracing::error!(error = %e, "audit capture failed, record dropped");
                    metrics_drop_count(self);
                }
            }
            Err(_) => {
                // The wrapped call itself failed: its error propagates to
                // the caller unchanged below. Nothing is audited for a
                // call that never produced a response.
            }
        }

        result
    }

    async fn capture_success(
        &self,
        prompt: Value,
        response: Value,
        meta: CallMeta,
        latency_ms: f64,
    ) -> crate::error::Result<()> {
        let mut encryption_context = BTreeMap::new();
        encryption_context.insert("org_id".to_string(), self.config.tenant_id.clone());

        let enc = self
            .encryptor
            .encrypt(self.keyring.as_ref(), &prompt, &response, &encryption_context)
            .await?;

        let id = Uuid::new_v4();
        let ts_client = Utc::now();

        let static_meta = self.config.static_meta.clone();

        let hashable_fields = serde_json::json!({
            "id": id,
            "tenant_id": self.config.tenant_id,
            "model_vendor": meta.model_vendor,
            "model_name": meta.model_name,
            "user_id": meta.user_id,
            "ts_client": ts_client,
            "latency_ms": latency_ms,
            "prompt_tokens": meta.prompt_tokens,
            "response_tokens": meta.response_tokens,
            "static_meta": static_meta,
            "enc": enc,
        });
        let (prev_hash, leaf_hash) = self.chain.link(&hashable_fields)?;

        let record = Record {
            id,
            tenant_id: self.config.tenant_id.clone(),
            model_vendor: meta.model_vendor,
            model_name: meta.model_name,
            user_id: meta.user_id,
            ts_client,
            latency_ms,
            prompt_tokens: meta.prompt_tokens,
            response_tokens: meta.response_tokens,
            static_meta,
            enc,
            prev_hash,
            leaf_hash,
        };

        self.enqueue(record).await
    }
}

fn metrics_drop_count(pipeline: &AuditPipeline) {
    pipeline.metrics.records_dropped_total.inc();
}
