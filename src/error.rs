//! Enclave gateway error types

use std::time::Duration;
use thiserror::Error;

/// Enclave gateway error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not dial the enclave after exhausting all attempts
    #[error("Failed to connect to enclave after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or truncated length prefix / frame
    #[error("Framing error: {0}")]
    Framing(String),

    /// Payload was not the JSON shape the protocol expects
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Channel exchange exceeded its deadline
    #[error("Enclave call timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// IO error on an established connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key-management encrypt call failed
    #[error("KMS encryption failed: {0}")]
    EncryptionFailed(String),

    /// Ambient credentials could not be retrieved
    #[error("Failed to get credentials: {0}")]
    CredentialsUnavailable(String),

    /// A required setting is missing
    #[error("{0} not configured")]
    NotConfigured(String),

    /// The enclave answered with `status: "error"`
    #[error("Enclave error: {0}")]
    Enclave(String),

    /// Enclave lifecycle error
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// KMS tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for enclave gateway operations
pub type Result<T> = std::result::Result<T, Error>;
