//! Config (C12): the typed configuration surface embedders build or load a
//! `PipelineConfig` through. Loading is layered file → env → programmatic
//! override, via the `config` crate.

use std::path::PathBuf;

use serde::Deserialize;
use url::Url;

use crate::error::{AuditError, Result};

const DEFAULT_BATCH_SIZE: usize = 15;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2000;
const DEFAULT_MAX_RETRIES: u32 = 5;
const MIN_BATCH_SIZE: usize = 10;
const MAX_BATCH_SIZE: usize = 25;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub tenant_id: String,
    pub api_key: String,
    #[serde(deserialize_with = "deserialize_url")]
    pub ingest_url: Url,
    pub cmk_arn: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub static_meta: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_log_level() -> String {
    "info".to_string()
}

fn deserialize_url<'de, D>(deserializer: D) -> std::result::Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Url::parse(&raw).map_err(serde::de::Error::custom)
}

impl PipelineConfig {
    /// Load config layered from `traceprompt.toml` (if present) and
    /// `TRACEPROMPT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("traceprompt").required(false))
            .add_source(config::Environment::with_prefix("TRACEPROMPT").separator("__"))
            .build()
            .map_err(|e| AuditError::Config(format!("failed to assemble config sources: {e}")))?;

        let parsed: Self = settings
            .try_deserialize()
            .map_err(|e| AuditError::Config(format!("failed to parse config: {e}")))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject combinations that would violate the batch-size and outbox
    /// invariants before they ever reach the pipeline.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(AuditError::Config(format!(
                "batch_size must be between {MIN_BATCH_SIZE} and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.tenant_id.trim().is_empty() {
            return Err(AuditError::Config("tenant_id must not be empty".into()));
        }
        if self.api_key.trim().is_empty() {
            return Err(AuditError::Config("api_key must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PipelineConfig {
        PipelineConfig {
            data_dir: PathBuf::from("/tmp/traceprompt"),
            tenant_id: "t1".into(),
            api_key: "key".into(),
            ingest_url: Url::parse("https://ingest.example.com").unwrap(),
            cmk_arn: "local-dev".into(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            static_meta: Default::default(),
            log_level: "info".into(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn batch_size_out_of_range_is_rejected() {
        let mut cfg = sample();
        cfg.batch_size = 1;
        assert!(matches!(cfg.validate(), Err(AuditError::Config(_))));
    }

    #[test]
    fn empty_tenant_id_is_rejected() {
        let mut cfg = sample();
        cfg.tenant_id = "".into();
        assert!(matches!(cfg.validate(), Err(AuditError::Config(_))));
    }
}
