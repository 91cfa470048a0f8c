//! Enclave request/response protocol
//!
//! Requests are tagged by `operation`; responses carry a `status` of `ok` or
//! `error`. Response fields are untyped JSON on the wire, so every decoder
//! here reads a field only when it is present with the expected type and
//! treats anything else as unset. Only `status` is mandatory.

use super::credentials::Credentials;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single framed message: a JSON object with heterogeneous values.
pub type ChannelMessage = serde_json::Map<String, Value>;

/// Error text used when the enclave reports an error without a message.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Requests understood by the enclave server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum EnclaveRequest<'a> {
    /// Liveness check
    Ping,
    /// Request an attestation document
    Attestation,
    /// Decrypt inside the enclave and run PII detection
    Detect {
        /// Base64 KMS ciphertext
        encrypted_data: &'a str,
        /// Key the ciphertext was produced under
        key_id: &'a str,
        /// Short-lived credentials the enclave uses to call KMS
        credentials: &'a Credentials,
    },
}

impl EnclaveRequest<'_> {
    /// Operation name as sent on the wire.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Attestation => "attestation",
            Self::Detect { .. } => "detect",
        }
    }

    /// Convert into the generic channel message.
    pub fn to_message(&self) -> Result<ChannelMessage> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(Error::Internal(format!(
                "{} request did not serialize to an object",
                self.operation()
            ))),
            Err(e) => Err(Error::Protocol(format!(
                "Failed to serialize {} request: {}",
                self.operation(),
                e
            ))),
        }
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

impl ResponseStatus {
    /// Read the mandatory `status` field.
    pub fn from_message(message: &ChannelMessage) -> Result<Self> {
        match message.get("status") {
            Some(Value::String(s)) if s == "ok" => Ok(Self::Ok),
            Some(Value::String(s)) if s == "error" => Ok(Self::Error),
            Some(Value::String(s)) => Err(Error::Protocol(format!(
                "Unrecognized response status '{}'",
                s
            ))),
            Some(_) => Err(Error::Protocol("Response status is not a string".to_string())),
            None => Err(Error::Protocol("Response is missing status".to_string())),
        }
    }
}

/// Result of a `detect` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacted_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<serde_json::Map<String, Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_count: Option<u64>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DetectionResult {
    /// Decode a detect response.
    pub fn from_message(message: &ChannelMessage) -> Result<Self> {
        let status = ResponseStatus::from_message(message)?;

        let error_message = match status {
            ResponseStatus::Error => Some(
                string_field(message, "message").unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
            ),
            ResponseStatus::Ok => string_field(message, "message"),
        };

        Ok(Self {
            status,
            redacted_text: string_field(message, "redacted_text"),
            entities: entities_field(message, "entities"),
            entity_count: count_field(message, "entity_count"),
            error_message,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// Result of an `attestation` call.
#[derive(Debug, Clone, PartialEq)]
pub enum AttestationResult {
    /// Base64 attestation document
    Document(String),
    /// Enclave-reported failure
    Rejected(String),
}

impl AttestationResult {
    /// Decode an attestation response. An ok response must carry the document.
    pub fn from_message(message: &ChannelMessage) -> Result<Self> {
        match ResponseStatus::from_message(message)? {
            ResponseStatus::Ok => string_field(message, "attestation_document")
                .map(Self::Document)
                .ok_or_else(|| {
                    Error::Protocol("Attestation response is missing attestation_document".to_string())
                }),
            ResponseStatus::Error => Ok(Self::Rejected(
                string_field(message, "message").unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
            )),
        }
    }
}

fn string_field(message: &ChannelMessage, key: &str) -> Option<String> {
    message.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Entity list; elements that are not objects are dropped.
fn entities_field(
    message: &ChannelMessage,
    key: &str,
) -> Option<Vec<serde_json::Map<String, Value>>> {
    message.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect()
    })
}

/// Non-negative integer count; integral floats are accepted.
fn count_field(message: &ChannelMessage, key: &str) -> Option<u64> {
    let value = message.get(key)?;
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64)
    })
}
