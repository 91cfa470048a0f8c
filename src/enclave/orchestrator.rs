//! Request orchestration
//!
//! `detect` runs the full host-side sequence for one piece of text:
//! 1. Encrypt the plaintext under the configured KMS key
//! 2. Fetch fresh ambient credentials
//! 3. Send ciphertext and credentials to the enclave
//! 4. Decode the detection result
//!
//! Plaintext never leaves this module except as the encrypt call's input.

use super::channel::EnclaveChannel;
use super::credentials::CredentialRelay;
use super::kms::{CiphertextEnvelope, KeyManagement};
use super::protocol::{AttestationResult, DetectionResult, EnclaveRequest};
use crate::config::KmsConfig;
use crate::error::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Coordinates KMS, credentials and the enclave channel.
pub struct EnclaveOrchestrator {
    channel: EnclaveChannel,
    kms: Arc<dyn KeyManagement>,
    credentials: CredentialRelay,
    key_id: Option<String>,
    kms_timeout: Duration,
}

impl std::fmt::Debug for EnclaveOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveOrchestrator")
            .field("channel", &self.channel)
            .field("key_id", &self.key_id)
            .field("region", &self.credentials.region())
            .finish_non_exhaustive()
    }
}

impl EnclaveOrchestrator {
    pub fn new(
        channel: EnclaveChannel,
        kms: Arc<dyn KeyManagement>,
        credentials: CredentialRelay,
        config: &KmsConfig,
    ) -> Self {
        Self {
            channel,
            kms,
            credentials,
            key_id: config.key_id().map(str::to_string),
            kms_timeout: config.request_timeout(),
        }
    }

    /// The configured KMS key, if any.
    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// Run PII detection on `plaintext` inside the enclave.
    pub async fn detect(&self, plaintext: &str) -> Result<DetectionResult> {
        let key_id = self
            .key_id()
            .ok_or_else(|| Error::NotConfigured("KMS_KEY_ARN".to_string()))?;

        tracing::debug!(text_len = plaintext.len(), "Encrypting text for enclave");
        let ciphertext = self.encrypt(key_id, plaintext.as_bytes()).await?;
        let envelope = CiphertextEnvelope::new(&ciphertext, key_id);

        let credentials = self.credentials.fetch().await?;

        let request = EnclaveRequest::Detect {
            encrypted_data: &envelope.ciphertext_base64,
            key_id: &envelope.key_id,
            credentials: &credentials,
        }
        .to_message()?;

        let response = self.channel.call(&request).await?;
        let result = DetectionResult::from_message(&response)?;

        tracing::info!(
            status = ?result.status,
            entity_count = ?result.entity_count,
            "Detection completed"
        );
        Ok(result)
    }

    /// True if the enclave answers a ping with `status: "ok"`.
    pub async fn ping(&self) -> Result<bool> {
        let request = EnclaveRequest::Ping.to_message()?;
        let response = self.channel.call(&request).await?;
        Ok(matches!(response.get("status"), Some(Value::String(s)) if s == "ok"))
    }

    /// Fetch the enclave's base64 attestation document.
    pub async fn attestation(&self) -> Result<String> {
        let request = EnclaveRequest::Attestation.to_message()?;
        let response = self.channel.call(&request).await?;

        match AttestationResult::from_message(&response)? {
            AttestationResult::Document(document) => Ok(document),
            AttestationResult::Rejected(message) => Err(Error::Enclave(message)),
        }
    }

    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        match tokio::time::timeout(self.kms_timeout, self.kms.encrypt(key_id, plaintext)).await {
            Ok(Ok(ciphertext)) => Ok(ciphertext),
            Ok(Err(Error::EncryptionFailed(msg))) => Err(Error::EncryptionFailed(msg)),
            Ok(Err(e)) => Err(Error::EncryptionFailed(e.to_string())),
            Err(_) => Err(Error::EncryptionFailed(format!(
                "KMS encrypt timed out after {}s",
                self.kms_timeout.as_secs_f64()
            ))),
        }
    }
}
