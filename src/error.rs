//! Closed error taxonomy shared by every component.
//!
//! Classification happens once, at the boundary that actually knows the
//! cause (Transport maps HTTP status codes, Keyring maps KMS responses).
//! Nothing downstream re-derives a kind by parsing an error message.

use thiserror::Error;

/// Top-level error type returned by pipeline operations.
#[derive(Debug, Clone, Error)]
pub enum AuditError {
    /// Missing required field or malformed key material. Fatal at `init`.
    #[error("config error: {0}")]
    Config(String),

    /// A value could not be canonicalized (cycle, NaN, infinity, or a
    /// serializer failure).
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Envelope-encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// `enqueue` called after shutdown has begun.
    #[error("shutdown in progress, record rejected")]
    Shutdown,

    /// Outbox is at or above `MAX_FILE_BYTES`.
    #[error("outbox backpressure: {size} bytes >= {limit} byte limit")]
    Backpressure { size: u64, limit: u64 },

    /// Transient network/DNS/TLS failure. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 429. Retryable.
    #[error("rate limited")]
    RateLimited,

    /// HTTP 5xx. Retryable.
    #[error("server error: status {0}")]
    Server(u16),

    /// HTTP 4xx other than 429. Not retryable; likely misconfiguration.
    #[error("client error: status {0}")]
    Client(u16),

    /// KMS access denied or key disabled. Not retryable.
    #[error("kms error: {0}")]
    Kms(String),
}

impl AuditError {
    /// Whether a failed flush attempt should be retried under backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuditError::Network(_) | AuditError::RateLimited | AuditError::Server(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AuditError>;
