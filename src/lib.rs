//! # traceprompt-audit
//!
//! A client-side durable audit pipeline for observed LLM calls. Each call is
//! canonicalized, envelope-encrypted under a customer master key, linked
//! into a BLAKE3 hash chain, persisted to a crash-safe on-disk outbox, and
//! delivered idempotently to a remote ingest endpoint with bounded batching
//! and exponential backoff.
//!
//! ## Quick start
//!
//! ```ignore
//! let pipeline = traceprompt_audit::AuditPipeline::init(config).await?;
//! let response = pipeline.wrap_llm(prompt, meta, || call_openai(prompt)).await?;
//! pipeline.shutdown().await?;
//! ```

pub mod batcher;
pub mod canon;
pub mod capture;
pub mod chain;
pub mod config;
pub mod encryptor;
pub mod error;
pub mod keyring;
pub mod metrics;
pub mod outbox;
pub mod pipeline;
pub mod record;
pub mod ring_buffer;
pub mod shutdown;
pub mod transport;

pub use capture::CallMeta;
pub use config::PipelineConfig;
pub use error::{AuditError, Result};
pub use pipeline::AuditPipeline;
pub use record::{EncryptedBundle, ModelVendor, Record};
