//! Keyring (C3): builds either a KMS-backed or a local AES keyring for
//! envelope encryption.
//!
//! Grounded on the KMS integration shape (`generate_data_key` /
//! `decrypt_data_key` returning `(plaintext, wrapped)` pairs) and on
//! `aws-sdk-kms` as the concrete provider. `ring::aead` backs the
//! local-dev raw-AES wrap.

use async_trait::async_trait;
use ring::aead::{self, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{AuditError, Result};

/// A data-encryption key freshly generated for a single record, plus its
/// wrapped (encrypted-at-rest) form to ship alongside the ciphertext.
pub struct DataKey {
    pub plaintext: [u8; 32],
    pub wrapped: Vec<u8>,
}

/// Builds and unwraps per-record data-encryption keys under a customer
/// master key. Reconstructed on every call so that KMS-side key rotation
/// takes effect without a restart;
/// only the algorithm suite id is ever cached, never key material.
#[async_trait]
pub trait Keyring: Send + Sync {
    /// Generate a fresh 32-byte DEK and its wrapped form.
    async fn generate_data_key(&self) -> Result<DataKey>;

    /// Unwrap a previously wrapped DEK (used by audit tooling, not by the
    /// ingest path itself).
    async fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<[u8; 32]>;
}

/// Construct the right keyring for `cmk_arn`: `"local-dev"` selects the
/// local AES keyring; anything else is a KMS CMK ARN.
pub fn build_keyring(cmk_arn: &str, kms_client: Option<aws_sdk_kms::Client>) -> Result<Box<dyn Keyring>> {
    if cmk_arn == "local-dev" {
        Ok(Box::new(LocalKeyring::from_env()?))
    } else {
        let client = kms_client.ok_or_else(|| {
            AuditError::Config("KMS client required for non-local-dev cmk_arn".into())
        })?;
        Ok(Box::new(KmsKeyring { client, cmk_arn: cmk_arn.to_string() }))
    }
}

/// KMS-backed keyring: `GenerateDataKey`/`Decrypt` against a remote CMK.
pub struct KmsKeyring {
    client: aws_sdk_kms::Client,
    cmk_arn: String,
}

#[async_trait]
impl Keyring for KmsKeyring {
    async fn generate_data_key(&self) -> Result<DataKey> {
        let resp = self
            .client
            .generate_data_key()
            .key_id(&self.cmk_arn)
            .key_spec(aws_sdk_kms::types::DataKeySpec::Aes256)
            .send()
            .await
            .map_err(|e| classify_kms_error(&e.to_string()))?;

        let plaintext_blob = resp
            .plaintext()
            .ok_or_else(|| AuditError::Kms("KMS returned no plaintext key".into()))?;
        let wrapped_blob = resp
            .ciphertext_blob()
            .ok_or_else(|| AuditError::Kms("KMS returned no wrapped key".into()))?;

        let mut plaintext = [0u8; 32];
        let slice = plaintext_blob.as_ref();
        if slice.len() != 32 {
            return Err(AuditError::Kms(format!("unexpected DEK length {}", slice.len())));
        }
        plaintext.copy_from_slice(slice);

        Ok(DataKey { plaintext, wrapped: wrapped_blob.as_ref().to_vec() })
    }

    async fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<[u8; 32]> {
        let resp = self
            .client
            .decrypt()
            .key_id(&self.cmk_arn)
            .ciphertext_blob(aws_sdk_kms::primitives::Blob::new(wrapped.to_vec()))
            .send()
            .await
            .map_err(|e| classify_kms_error(&e.to_string()))?;

        let plaintext_blob = resp
            .plaintext()
            .ok_or_else(|| AuditError::Kms("KMS returned no plaintext on decrypt".into()))?;
        let slice = plaintext_blob.as_ref();
        if slice.len() != 32 {
            return Err(AuditError::Kms(format!("unexpected DEK length {}", slice.len())));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(slice);
        Ok(out)
    }
}

/// Maps a KMS SDK error message to a retryable/non-retryable `AuditError`,
/// without parsing classification out of free text beyond recognizing the
/// two named failure modes.
fn classify_kms_error(msg: &str) -> AuditError {
    if msg.contains("AccessDenied") || msg.contains("KeyDisabled") || msg.contains("NotFoundException") {
        AuditError::Kms(msg.to_string())
    } else {
        AuditError::Network(format!("KMS transient failure: {msg}"))
    }
}

/// Local-dev keyring: wraps a fresh 32-byte DEK under `LOCAL_DEV_KEK`
/// (itself a 32-byte hex-encoded AES-256 key) via raw AES-256-GCM.
pub struct LocalKeyring {
    kek: [u8; 32],
}

impl LocalKeyring {
    pub fn from_env() -> Result<Self> {
        let hex_key = std::env::var("LOCAL_DEV_KEK")
            .map_err(|_| AuditError::Config("LOCAL_DEV_KEK is not set".into()))?;
        let bytes = hex::decode(&hex_key)
            .map_err(|e| AuditError::Config(format!("LOCAL_DEV_KEK is not valid hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(AuditError::Config(format!(
                "LOCAL_DEV_KEK must decode to 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut kek = [0u8; 32];
        kek.copy_from_slice(&bytes);
        Ok(Self { kek })
    }

    pub fn from_key(kek: [u8; 32]) -> Self {
        Self { kek }
    }
}

struct FixedNonce(Option<[u8; 12]>);

impl NonceSequence for FixedNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        let bytes = self.0.take().ok_or(ring::error::Unspecified)?;
        Ok(Nonce::assume_unique_for_key(bytes))
    }
}

#[async_trait]
impl Keyring for LocalKeyring {
    async fn generate_data_key(&self) -> Result<DataKey> {
        let rng = SystemRandom::new();
        let mut plaintext = [0u8; 32];
        rng.fill(&mut plaintext)
            .map_err(|_| AuditError::Crypto("DEK generation failed".into()))?;

        let mut iv = [0u8; 12];
        rng.fill(&mut iv)
            .map_err(|_| AuditError::Crypto("IV generation failed".into()))?;

        let unbound = UnboundKey::new(&AES_256_GCM, &self.kek)
            .map_err(|_| AuditError::Crypto("invalid local KEK".into()))?;
        let mut sealing = SealingKey::new(unbound, FixedNonce(Some(iv)));

        let mut in_out = plaintext.to_vec();
        sealing
            .seal_in_place_append_tag(aead::Aad::empty(), &mut in_out)
            .map_err(|_| AuditError::Crypto("DEK wrap failed".into()))?;

        // wrapped = iv || ciphertext || tag
        let mut wrapped = Vec::with_capacity(12 + in_out.len());
        wrapped.extend_from_slice(&iv);
        wrapped.extend_from_slice(&in_out);

        Ok(DataKey { plaintext, wrapped })
    }

    async fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<[u8; 32]> {
        if wrapped.len() < 12 + 16 {
            return Err(AuditError::Crypto("wrapped key too short".into()));
        }
        let (iv, rest) = wrapped.split_at(12);
        let mut in_out = rest.to_vec();

        let unbound = UnboundKey::new(&AES_256_GCM, &self.kek)
            .map_err(|_| AuditError::Crypto("invalid local KEK".into()))?;
        let mut iv_arr = [0u8; 12];
        iv_arr.copy_from_slice(iv);
        let mut opening = OpeningKey::new(unbound, FixedNonce(Some(iv_arr)));

        let plaintext_slice = opening
            .open_in_place(aead::Aad::empty(), &mut in_out)
            .map_err(|_| AuditError::Crypto("DEK unwrap failed".into()))?;

        if plaintext_slice.len() != 32 {
            return Err(AuditError::Crypto(format!("unwrapped DEK has wrong length {}", plaintext_slice.len())));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(plaintext_slice);
        Ok(out)
    }
}
