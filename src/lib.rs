//! Enclave Gateway - host-side gateway for confidential PII detection
//!
//! The gateway runs on the parent instance of an AWS Nitro Enclave. It never
//! sees plaintext beyond the encrypt call: text is encrypted under a KMS key
//! whose policy only releases it to the attested enclave, then sent over
//! vsock together with short-lived credentials for the enclave to decrypt.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────── Parent instance ─────────────────────────┐
//! │                                                                          │
//! │  HTTP API ──► EnclaveOrchestrator ──► KMS Encrypt                        │
//! │                     │                                                    │
//! │                     ├──► CredentialRelay (ambient AWS credentials)       │
//! │                     │                                                    │
//! │                     └──► EnclaveChannel ──── vsock (cid, 5000) ────┐     │
//! │                                                                    │     │
//! │  EnclaveLifecycle ── nitro-cli                                     │     │
//! │  KeyTunnel ───────── vsock-proxy 8000 ──► kms.<region>:443         │     │
//! └────────────────────────────────────────────────────────────────────┼─────┘
//!                                                                      │
//! ┌──────────────────────────────── Nitro Enclave ─────────────────────▼─────┐
//! │  Decrypt (via tunnel) ──► PII detection ──► redacted text                │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`enclave`]: Wire codec, channel, lifecycle, tunnel, credentials, orchestrator
//! - [`gateway`]: Startup and shutdown sequencing
//! - [`api`]: HTTP endpoints
//! - [`config`]: Configuration management

pub mod api;
pub mod config;
pub mod enclave;
pub mod error;
pub mod gateway;

pub use config::GatewayConfig;
pub use error::{Error, Result};
