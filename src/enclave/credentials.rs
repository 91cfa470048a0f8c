//! Ambient credential relay
//!
//! The enclave has no identity of its own, so every `detect` call carries a
//! fresh set of the host's short-lived AWS credentials. Nothing here caches:
//! each call goes back to the provider, and the values are wiped on drop.

use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Credentials relayed to the enclave for a single call.
#[derive(Clone, Serialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub region: String,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: session_token.into(),
            region: region.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &"** redacted **")
            .field("region", &self.region)
            .finish()
    }
}

/// Credentials as returned by a provider, before the region is attached.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ProviderCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// Source of ambient credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn retrieve(&self) -> Result<ProviderCredentials>;
}

/// Provider backed by the AWS SDK default credential chain.
pub struct AwsCredentialProvider {
    provider: SharedCredentialsProvider,
}

impl AwsCredentialProvider {
    pub fn new(provider: SharedCredentialsProvider) -> Self {
        Self { provider }
    }

    /// Use the credentials provider resolved by `aws_config`.
    pub fn from_sdk_config(config: &aws_config::SdkConfig) -> Result<Self> {
        config
            .credentials_provider()
            .map(Self::new)
            .ok_or_else(|| {
                Error::CredentialsUnavailable("AWS config has no credentials provider".to_string())
            })
    }
}

#[async_trait]
impl CredentialProvider for AwsCredentialProvider {
    async fn retrieve(&self) -> Result<ProviderCredentials> {
        let creds = self
            .provider
            .provide_credentials()
            .await
            .map_err(|e| Error::CredentialsUnavailable(e.to_string()))?;

        Ok(ProviderCredentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().map(str::to_string),
        })
    }
}

/// Fetches fresh credentials for every enclave call.
#[derive(Clone)]
pub struct CredentialRelay {
    provider: Arc<dyn CredentialProvider>,
    region: String,
    timeout: Duration,
}

impl CredentialRelay {
    pub fn new(provider: Arc<dyn CredentialProvider>, region: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider,
            region: region.into(),
            timeout,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Retrieve credentials from the provider. Never cached.
    pub async fn fetch(&self) -> Result<Credentials> {
        let raw = match tokio::time::timeout(self.timeout, self.provider.retrieve()).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(Error::CredentialsUnavailable(msg))) => {
                return Err(Error::CredentialsUnavailable(msg))
            }
            Ok(Err(e)) => return Err(Error::CredentialsUnavailable(e.to_string())),
            Err(_) => {
                return Err(Error::CredentialsUnavailable(format!(
                    "credential provider timed out after {}s",
                    self.timeout.as_secs_f64()
                )))
            }
        };

        tracing::debug!(region = %self.region, "Fetched ambient credentials");

        Ok(Credentials::new(
            raw.access_key_id.as_str(),
            raw.secret_access_key.as_str(),
            raw.session_token.as_deref().unwrap_or_default(),
            self.region.as_str(),
        ))
    }
}
