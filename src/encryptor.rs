//! Encryptor (C4): envelope-encrypts the `{prompt, response}` bundle under
//! a fresh per-record DEK.

use std::collections::BTreeMap;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, SealingKey, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;
use std::sync::Arc;

use crate::canon::canonicalize;
use crate::error::{AuditError, Result};
use crate::keyring::Keyring;
use crate::metrics::PipelineMetrics;
use crate::record::{EncryptedBundle, SUITE_AES_256_GCM};

pub struct Encryptor {
    metrics: Arc<PipelineMetrics>,
}

struct OnceNonce(Option<[u8; 12]>);

impl NonceSequence for OnceNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        let bytes = self.0.take().ok_or(ring::error::Unspecified)?;
        Ok(Nonce::assume_unique_for_key(bytes))
    }
}

impl Encryptor {
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self { metrics }
    }

    /// Encrypt `{prompt, response}` under a fresh DEK from `keyring`,
    /// binding `encryption_context` as AAD so the ciphertext cannot be
    /// replayed under a different context.
    pub async fn encrypt(
        &self,
        keyring: &dyn Keyring,
        prompt: &Value,
        response: &Value,
        encryption_context: &BTreeMap<String, String>,
    ) -> Result<EncryptedBundle> {
        let start = Instant::now();

        let plaintext = canonicalize(&serde_json::json!({ "prompt": prompt, "response": response }))?;
        let aad_value: Value = serde_json::to_value(encryption_context)
            .map_err(|e| AuditError::Encoding(format!("encryption context encode failed: {e}")))?;
        let aad_bytes = canonicalize(&aad_value)?;

        let dek = keyring.generate_data_key().await?;

        let rng = SystemRandom::new();
        let mut iv = [0u8; 12];
        rng.fill(&mut iv).map_err(|_| AuditError::Crypto("IV generation failed".into()))?;

        let unbound = UnboundKey::new(&AES_256_GCM, &dek.plaintext)
            .map_err(|_| AuditError::Crypto("invalid DEK".into()))?;
        let mut sealing = SealingKey::new(unbound, OnceNonce(Some(iv)));

        let mut in_out = plaintext;
        sealing
            .seal_in_place_append_tag(Aad::from(aad_bytes), &mut in_out)
            .map_err(|_| AuditError::Crypto("encryption failed".into()))?;

        // framed ciphertext = 1-byte suite header || iv || ciphertext || tag
        let mut framed = Vec::with_capacity(1 + 12 + in_out.len());
        framed.push(SUITE_AES_256_GCM as u8);
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&in_out);

        self.metrics.encrypt_latency_seconds.observe(start.elapsed().as_secs_f64());

        Ok(EncryptedBundle {
            ciphertext: BASE64.encode(framed),
            encrypted_data_key: BASE64.encode(dek.wrapped),
            suite_id: SUITE_AES_256_GCM,
        })
    }

    /// Decrypt a bundle. Used by audit tooling, not by the ingest path.
    pub async fn decrypt(&self, keyring: &dyn Keyring, bundle: &EncryptedBundle) -> Result<Vec<u8>> {
        if bundle.suite_id != SUITE_AES_256_GCM {
            return Err(AuditError::Crypto(format!("unsupported suite id {}", bundle.suite_id)));
        }
        let framed = BASE64
            .decode(&bundle.ciphertext)
            .map_err(|e| AuditError::Crypto(format!("bad ciphertext base64: {e}")))?;
        if framed.len() < 1 + 12 + 16 {
            return Err(AuditError::Crypto("ciphertext too short".into()));
        }
        let (suite_byte, rest) = framed.split_at(1);
        if suite_byte[0] as u32 != SUITE_AES_256_GCM {
            return Err(AuditError::Crypto("suite header mismatch".into()));
        }
        let (iv, body) = rest.split_at(12);

        let wrapped = BASE64
            .decode(&bundle.encrypted_data_key)
            .map_err(|e| AuditError::Crypto(format!("bad wrapped key base64: {e}")))?;
        let dek = keyring.unwrap_data_key(&wrapped).await?;

        let unbound = UnboundKey::new(&AES_256_GCM, &dek).map_err(|_| AuditError::Crypto("invalid DEK".into()))?;
        let mut iv_arr = [0u8; 12];
        iv_arr.copy_from_slice(iv);
        let mut opening_key = ring::aead::OpeningKey::new(unbound, OnceNonce(Some(iv_arr)));

        let mut in_out = body.to_vec();
        let plaintext = opening_key
            .open_in_place(Aad::empty(), &mut in_out)
            .map_err(|_| AuditError::Crypto("decryption failed".into()))?;
        Ok(plaintext.to_vec())
    }
}
