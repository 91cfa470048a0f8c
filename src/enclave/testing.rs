//! Test doubles for the enclave collaborators.

use super::channel::{Connector, EnclaveStream};
use super::codec::{FrameCodec, LENGTH_PREFIX_LEN};
use super::credentials::{CredentialProvider, ProviderCredentials};
use super::kms::KeyManagement;
use super::protocol::ChannelMessage;
use super::runtime::{EnclaveRuntime, LaunchSpec};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::time::Instant;

pub fn message(value: serde_json::Value) -> ChannelMessage {
    value.as_object().cloned().expect("test message must be an object")
}

/// Stream wrapper that counts how many connections were closed (dropped).
pub struct TrackedStream {
    inner: DuplexStream,
    closed: Arc<AtomicUsize>,
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

type Handler = dyn Fn(&ChannelMessage) -> Option<ChannelMessage> + Send + Sync;

enum Reply {
    /// Decode the request and answer through the handler (None = never answer)
    Handler(Box<Handler>),
    /// Write this payload (framed) regardless of the request
    Raw(Vec<u8>),
    /// Read the request and close without answering
    HangUp,
}

/// Connector backed by an in-memory enclave peer.
pub struct ScriptedConnector {
    reply: Option<Arc<Reply>>,
    fail_first: usize,
    attempts: AtomicUsize,
    attempt_times: Mutex<Vec<Instant>>,
    closed: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<ChannelMessage>>>,
}

impl ScriptedConnector {
    fn with_reply(reply: Option<Reply>) -> Self {
        Self {
            reply: reply.map(Arc::new),
            fail_first: 0,
            attempts: AtomicUsize::new(0),
            attempt_times: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn responding<F>(handler: F) -> Self
    where
        F: Fn(&ChannelMessage) -> Option<ChannelMessage> + Send + Sync + 'static,
    {
        Self::with_reply(Some(Reply::Handler(Box::new(handler))))
    }

    pub fn raw_reply(payload: Vec<u8>) -> Self {
        Self::with_reply(Some(Reply::Raw(payload)))
    }

    pub fn hanging_up() -> Self {
        Self::with_reply(Some(Reply::HangUp))
    }

    /// Every dial fails.
    pub fn refusing() -> Self {
        Self::with_reply(None)
    }

    pub fn failing_first(mut self, count: usize) -> Self {
        self.fail_first = count;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChannelMessage> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> std::io::Result<Box<dyn EnclaveStream>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempt_times.lock().unwrap().push(Instant::now());

        let reply = match &self.reply {
            Some(reply) if attempt > self.fail_first => reply.clone(),
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("connection refused (attempt {})", attempt),
                ))
            }
        };

        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let requests = self.requests.clone();

        tokio::spawn(async move {
            let codec = FrameCodec::default();
            let request = match codec.read(&mut server).await {
                Ok(request) => request,
                Err(_) => return,
            };
            requests.lock().unwrap().push(request.clone());

            match reply.as_ref() {
                Reply::Handler(handler) => match handler(&request) {
                    Some(response) => {
                        let _ = codec.write(&mut server, &response).await;
                    }
                    None => std::future::pending::<()>().await,
                },
                Reply::Raw(payload) => {
                    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
                    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                    frame.extend_from_slice(payload);
                    let _ = server.write_all(&frame).await;
                }
                Reply::HangUp => {}
            }
        });

        Ok(Box::new(TrackedStream {
            inner: client,
            closed: self.closed.clone(),
        }))
    }

    fn describe(&self) -> String {
        "memory://enclave".to_string()
    }
}

/// In-memory enclave runtime.
#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicUsize,
    running: Mutex<Vec<String>>,
    pub fail_launch: AtomicBool,
    /// Launch never returns while set.
    pub hang_launch: AtomicBool,
    pub fail_terminate: AtomicBool,
    pub launches: Mutex<Vec<LaunchSpec>>,
    pub terminated: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> Vec<String> {
        self.running.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnclaveRuntime for FakeRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        self.launches.lock().unwrap().push(spec.clone());
        if self.hang_launch.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(Error::Lifecycle("insufficient enclave memory".to_string()));
        }
        let id = format!("i-0abc-enc{:04}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.running.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn terminate(&self, instance_id: &str) -> Result<()> {
        self.terminated.lock().unwrap().push(instance_id.to_string());
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(Error::Lifecycle("terminate-enclave failed".to_string()));
        }
        self.running.lock().unwrap().retain(|id| id != instance_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.running())
    }
}

/// Key-management double returning fixed ciphertext.
pub struct FakeKms {
    ciphertext: Option<Vec<u8>>,
    pub calls: AtomicUsize,
    pub last_key: Mutex<Option<String>>,
    pub last_plaintext: Mutex<Option<Vec<u8>>>,
}

impl FakeKms {
    pub fn returning(ciphertext: Vec<u8>) -> Self {
        Self {
            ciphertext: Some(ciphertext),
            calls: AtomicUsize::new(0),
            last_key: Mutex::new(None),
            last_plaintext: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            ciphertext: None,
            calls: AtomicUsize::new(0),
            last_key: Mutex::new(None),
            last_plaintext: Mutex::new(None),
        }
    }
}

#[async_trait]
impl KeyManagement for FakeKms {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_key.lock().unwrap() = Some(key_id.to_string());
        *self.last_plaintext.lock().unwrap() = Some(plaintext.to_vec());
        self.ciphertext
            .clone()
            .ok_or_else(|| Error::EncryptionFailed("AccessDeniedException".to_string()))
    }
}

/// Credential provider double.
pub struct FakeCredentialProvider {
    creds: Option<(String, String, Option<String>)>,
    error: Option<String>,
    pub calls: AtomicUsize,
}

impl FakeCredentialProvider {
    pub fn new(access_key_id: &str, secret_access_key: &str, session_token: Option<&str>) -> Self {
        Self {
            creds: Some((
                access_key_id.to_string(),
                secret_access_key.to_string(),
                session_token.map(str::to_string),
            )),
            error: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            creds: None,
            error: Some(reason.to_string()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentialProvider {
    async fn retrieve(&self) -> Result<ProviderCredentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.creds {
            Some((ak, sk, st)) => Ok(ProviderCredentials {
                access_key_id: ak.clone(),
                secret_access_key: sk.clone(),
                session_token: st.clone(),
            }),
            None => Err(Error::Internal(
                self.error.clone().unwrap_or_else(|| "no credentials".to_string()),
            )),
        }
    }
}
