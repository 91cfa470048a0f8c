//! Key-management client used to encrypt payloads before they leave the host.
//!
//! The host can encrypt under the enclave key but cannot decrypt: the key
//! policy only releases plaintext to an attested enclave.

use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client as KmsClient;
use base64::Engine;

/// Encrypt capability of the key-management service.
#[async_trait]
pub trait KeyManagement: Send + Sync {
    /// Encrypt `plaintext` under `key_id`, returning the ciphertext blob.
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>>;
}

/// Ciphertext ready to be placed in a `detect` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextEnvelope {
    pub ciphertext_base64: String,
    pub key_id: String,
}

impl CiphertextEnvelope {
    pub fn new(ciphertext: &[u8], key_id: impl Into<String>) -> Self {
        Self {
            ciphertext_base64: base64::engine::general_purpose::STANDARD.encode(ciphertext),
            key_id: key_id.into(),
        }
    }
}

/// AWS KMS implementation.
pub struct AwsKms {
    client: KmsClient,
}

impl AwsKms {
    pub fn new(client: KmsClient) -> Self {
        Self { client }
    }

    pub fn from_sdk_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(KmsClient::new(config))
    }
}

#[async_trait]
impl KeyManagement for AwsKms {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        tracing::debug!(key_id = %key_id, plaintext_len = plaintext.len(), "Encrypting payload");

        let response = self
            .client
            .encrypt()
            .key_id(key_id)
            .plaintext(Blob::new(plaintext))
            .send()
            .await
            .map_err(|e| Error::EncryptionFailed(e.to_string()))?;

        let ciphertext = response
            .ciphertext_blob
            .ok_or_else(|| Error::EncryptionFailed("No ciphertext in response".to_string()))?;

        Ok(ciphertext.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_base64() {
        let envelope = CiphertextEnvelope::new(&[0x01, 0x02], "key-1");
        assert_eq!(envelope.ciphertext_base64, "AQI=");
        assert_eq!(envelope.key_id, "key-1");
    }

    #[test]
    fn test_envelope_empty_ciphertext() {
        let envelope = CiphertextEnvelope::new(&[], "key-1");
        assert!(envelope.ciphertext_base64.is_empty());
    }
}
