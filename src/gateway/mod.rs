//! Gateway server for the enclave
//!
//! Owns the enclave and its KMS tunnel for the lifetime of the process and
//! exposes the orchestrator to the HTTP layer.

mod server;

pub use server::{Gateway, GatewayBuilder, GatewayState};

#[cfg(test)]
pub(crate) use server::tests as testing;
