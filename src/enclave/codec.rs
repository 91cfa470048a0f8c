//! Length-prefixed JSON framing for the enclave vsock channel.
//!
//! Each frame is a 4-byte big-endian unsigned length followed by exactly
//! that many bytes of UTF-8 JSON. The same framing is used in both
//! directions.

use super::protocol::ChannelMessage;
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default ceiling on a single frame's payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encoder/decoder for channel frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    /// Create a codec that rejects payloads larger than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(u32::MAX as usize),
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Serialize a message into a complete frame.
    pub fn encode(&self, message: &ChannelMessage) -> Result<Bytes> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| Error::Protocol(format!("Failed to serialize message: {}", e)))?;

        if payload.len() > self.max_frame_len {
            return Err(Error::Framing(format!(
                "Outgoing payload of {} bytes exceeds maximum {}",
                payload.len(),
                self.max_frame_len
            )));
        }

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Parse a payload (without its prefix) into a message.
    pub fn parse_payload(&self, payload: &[u8]) -> Result<ChannelMessage> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| Error::Protocol(format!("Invalid JSON payload: {}", e)))?;

        match value {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(Error::Protocol(format!(
                "Expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Write one frame to `writer` and flush it.
    pub async fn write<W>(&self, writer: &mut W, message: &ChannelMessage) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let frame = self.encode(message)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame from `reader`.
    ///
    /// `read_exact` loops until the requested byte count is satisfied, so
    /// transports that deliver the frame in fragments are handled. EOF before
    /// the header or payload is complete is a framing error.
    pub async fn read<R>(&self, reader: &mut R) -> Result<ChannelMessage>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; LENGTH_PREFIX_LEN];
        reader.read_exact(&mut header).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::Framing("Connection closed before length prefix was complete".to_string())
            }
            _ => Error::Io(e),
        })?;

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_len {
            return Err(Error::Framing(format!(
                "Declared frame length {} exceeds maximum {}",
                len, self.max_frame_len
            )));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Framing(format!(
                "Connection closed before {} payload bytes were read",
                len
            )),
            _ => Error::Io(e),
        })?;

        self.parse_payload(&payload)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
