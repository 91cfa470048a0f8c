//! Nitro Enclave integration
//!
//! Host-side plumbing for a PII detection enclave: the vsock wire codec and
//! channel, the enclave lifecycle, the KMS tunnel, credential relay and the
//! orchestrator tying them together.

pub mod channel;
pub mod codec;
pub mod credentials;
pub mod kms;
pub mod lifecycle;
pub mod orchestrator;
pub mod protocol;
pub mod runtime;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{Connector, EnclaveChannel, EnclaveStream, RetryPolicy, VsockConnector};
pub use codec::FrameCodec;
pub use credentials::{AwsCredentialProvider, CredentialProvider, CredentialRelay, Credentials};
pub use kms::{AwsKms, CiphertextEnvelope, KeyManagement};
pub use lifecycle::{EnclaveInstance, EnclaveLifecycle, EnclaveState};
pub use orchestrator::EnclaveOrchestrator;
pub use protocol::{AttestationResult, ChannelMessage, DetectionResult, EnclaveRequest, ResponseStatus};
pub use runtime::{EnclaveRuntime, LaunchSpec, NitroCli};
pub use tunnel::{KeyTunnel, RestartPolicy, TunnelCommand, TunnelHealth};
