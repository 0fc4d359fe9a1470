//! Transport (C9): HTTPS POST with per-attempt timeout, status-code error
//! classification, and its own full-jitter retry loop.

use std::time::Duration;

use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use url::Url;

use crate::error::{AuditError, Result};

const PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 5;
const JITTER_BASE_MS: u64 = 250;

pub struct Transport {
    client: Client,
    ingest_url: Url,
    api_key: String,
    user_agent: String,
}

#[derive(Serialize)]
pub struct IngestBatchRecord {
    pub payload: serde_json::Value,
    #[serde(rename = "leafHash")]
    pub leaf_hash: String,
}

#[derive(Serialize)]
pub struct IngestBatchBody {
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    pub records: Vec<IngestBatchRecord>,
}

impl Transport {
    pub fn new(ingest_url: Url, api_key: String, sdk_name: &str, sdk_version: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(PER_ATTEMPT_TIMEOUT)
            .build()
            .map_err(|e| AuditError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            ingest_url,
            api_key,
            user_agent: format!("{sdk_name}/{sdk_version}"),
        })
    }

    /// Single POST attempt to `/v1/ingest`, classifying the response by
    /// status code. Does not retry — the batcher's flush retry loop owns
    /// that policy.
    pub async fn post_once(&self, body: &IngestBatchBody, idempotency_key: &str) -> Result<()> {
        let url = self
            .ingest_url
            .join("/v1/ingest")
            .map_err(|e| AuditError::Config(format!("bad ingest url: {e}")))?;

        let result = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("user-agent", &self.user_agent)
            .header("x-api-key", &self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(body)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => return Err(classify_transport_error(&e)),
        };

        classify_status(response.status())
    }

    /// Transport's own retry loop, independent of the batcher's: up to
    /// `MAX_ATTEMPTS` attempts with full-jitter exponential backoff
    /// (`random(0, base*2^(n-1))`, `base` = 250ms). Non-retryable errors
    /// (client errors) return immediately without consuming the remaining
    /// attempt budget.
    pub async fn post_with_retry(&self, body: &IngestBatchBody, idempotency_key: &str) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.post_once(body, idempotency_key).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let ceiling = JITTER_BASE_MS * 2u64.pow(attempt - 1);
                    let delay_ms = rand::thread_rng().gen_range(0..=ceiling);
                    tracing::warn!(attempt, delay_ms, error = %e, "ingest POST failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn classify_status(status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if status.as_u16() == 429 {
        return Err(AuditError::RateLimited);
    }
    if status.is_server_error() {
        return Err(AuditError::Server(status.as_u16()));
    }
    Err(AuditError::Client(status.as_u16()))
}

fn classify_transport_error(err: &reqwest::Error) -> AuditError {
    AuditError::Network(err.to_string())
}
