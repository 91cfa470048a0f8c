//! Vsock communication channel to the enclave.
//!
//! The enclave server is connection-per-request: every call dials a fresh
//! connection, writes one frame, reads one frame and closes. There is no
//! pooling and no multiplexing, so concurrent callers never share a socket.
//!
//! Only the dial is retried. Once a request has been written the enclave may
//! already be processing it, and its processing is not idempotent.

use super::codec::FrameCodec;
use super::protocol::ChannelMessage;
use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::Instrument;

/// Byte stream to the enclave.
pub trait EnclaveStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> EnclaveStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Dials a new connection to the enclave.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> std::io::Result<Box<dyn EnclaveStream>>;

    /// Address for log lines.
    fn describe(&self) -> String;
}

/// `AF_VSOCK` connector addressing the enclave by context id and port.
#[derive(Debug, Clone, Copy)]
pub struct VsockConnector {
    cid: u32,
    port: u32,
}

impl VsockConnector {
    pub fn new(cid: u32, port: u32) -> Self {
        Self { cid, port }
    }
}

#[async_trait]
impl Connector for VsockConnector {
    #[cfg(target_os = "linux")]
    async fn connect(&self) -> std::io::Result<Box<dyn EnclaveStream>> {
        use tokio_vsock::{VsockAddr, VsockStream};

        let stream = VsockStream::connect(VsockAddr::new(self.cid, self.port)).await?;
        Ok(Box::new(stream))
    }

    #[cfg(not(target_os = "linux"))]
    async fn connect(&self) -> std::io::Result<Box<dyn EnclaveStream>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "vsock is only available on Linux",
        ))
    }

    fn describe(&self) -> String {
        format!("vsock://{}:{}", self.cid, self.port)
    }
}

/// Fixed-delay dial retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

/// Request/response channel to the enclave.
#[derive(Clone)]
pub struct EnclaveChannel {
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    codec: FrameCodec,
    call_timeout: Duration,
}

impl std::fmt::Debug for EnclaveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveChannel")
            .field("endpoint", &self.connector.describe())
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl EnclaveChannel {
    pub fn new(
        connector: Arc<dyn Connector>,
        retry: RetryPolicy,
        codec: FrameCodec,
        call_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            retry,
            codec,
            call_timeout,
        }
    }

    pub fn from_config(connector: Arc<dyn Connector>, config: &ChannelConfig) -> Self {
        Self::new(
            connector,
            RetryPolicy {
                max_attempts: config.connect_attempts.max(1),
                delay: config.retry_delay(),
            },
            FrameCodec::new(config.max_frame_bytes),
            config.call_timeout(),
        )
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Send one request and wait for its response using the default deadline.
    pub async fn call(&self, request: &ChannelMessage) -> Result<ChannelMessage> {
        self.call_with_timeout(request, self.call_timeout).await
    }

    /// Send one request with an explicit deadline for the write+read exchange.
    ///
    /// The connection is dropped before returning on every path.
    pub async fn call_with_timeout(
        &self,
        request: &ChannelMessage,
        timeout: Duration,
    ) -> Result<ChannelMessage> {
        let operation = request
            .get("operation")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let span = tracing::debug_span!(
            "enclave_call",
            request_id = %uuid::Uuid::new_v4(),
            operation = %operation,
        );

        async move {
            let mut stream = self.connect().await?;

            let codec = self.codec;
            let exchange = async {
                codec.write(&mut stream, request).await?;
                codec.read(&mut stream).await
            };

            let result = match tokio::time::timeout(timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(timeout)),
            };
            drop(stream);

            match &result {
                Ok(_) => tracing::debug!("Enclave call completed"),
                Err(e) => tracing::warn!(error = %e, "Enclave call failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Dial with fixed-delay retry.
    async fn connect(&self) -> Result<Box<dyn EnclaveStream>> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt >= attempts => {
                    tracing::error!(
                        endpoint = %self.connector.describe(),
                        attempts = attempts,
                        error = %e,
                        "Giving up connecting to enclave"
                    );
                    return Err(Error::Connection {
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = %self.connector.describe(),
                        attempt = attempt,
                        error = %e,
                        "Connection attempt failed"
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        }
    }
}
