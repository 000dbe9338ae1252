//! Reliable message exchange over a byte stream.
//!
//! Two framing styles are supported:
//!
//! - Fixed layouts (generations A and B): the caller knows every field size
//!   and reads them with [`FrameTransport::recv_exact`].
//! - Length-prefixed frames (generation C): `len:u64 LE | bytes[len]`, via
//!   [`FrameTransport::send_framed`] / [`FrameTransport::recv_framed`].
//!
//! Writes are always complete: a message is either fully written or the
//! call fails. A clean EOF in the middle of a read is reported as
//! [`RpcError::ServerDied`].

use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::stream::BoxedStream;
use crate::error::{RpcError, Result};

/// Default upper bound for a length-prefixed frame.
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// Per-transport I/O settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// Timeout for a single send or receive. `None` waits forever.
    pub io_timeout: Option<Duration>,
    /// Largest length prefix accepted by `recv_framed`.
    pub max_frame_size: u64,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            io_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Map stream errors that mean "peer is gone" to `ServerDied`.
fn classify_io(err: std::io::Error) -> RpcError {
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => RpcError::ServerDied,
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            RpcError::ResourceTemporarilyUnavailable(err.to_string())
        }
        _ => RpcError::Io(err),
    }
}

/// Message transport over any async byte stream.
pub struct FrameTransport<S = BoxedStream> {
    stream: S,
    options: TransportOptions,
}

impl<S> FrameTransport<S> {
    pub fn new(stream: S, options: TransportOptions) -> Self {
        Self { stream, options }
    }

    pub fn options(&self) -> TransportOptions {
        self.options
    }

    /// Change the per-operation timeout.
    pub fn set_io_timeout(&mut self, timeout: Option<Duration>) {
        self.options.io_timeout = timeout;
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn with_timeout<T, F>(timeout: Option<Duration>, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(res) => res.map_err(classify_io),
                Err(_) => Err(RpcError::ResourceTemporarilyUnavailable(format!(
                    "{what} timed out after {limit:?}"
                ))),
            },
            None => fut.await.map_err(classify_io),
        }
    }
}

impl<S: AsyncRead + AsyncWrite> FrameTransport<S> {
    /// Split into independently owned read and write halves.
    pub fn split(self) -> (FrameTransport<ReadHalf<S>>, FrameTransport<WriteHalf<S>>) {
        let (r, w) = tokio::io::split(self.stream);
        (
            FrameTransport::new(r, self.options),
            FrameTransport::new(w, self.options),
        )
    }
}

impl<S: AsyncRead + Unpin> FrameTransport<S> {
    /// Read exactly `buf.len()` bytes.
    pub async fn recv_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let timeout = self.options.io_timeout;
        Self::with_timeout(timeout, "receive", self.stream.read_exact(buf))
            .await
            .map(|_| ())
    }

    /// Read exactly `n` bytes.
    pub async fn recv_exact(&mut self, n: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(n);
        self.recv_into(&mut buf).await?;
        Ok(buf.freeze())
    }

    pub async fn recv_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.recv_into(&mut raw).await?;
        Ok(u32::from_le_bytes(raw))
    }

    pub async fn recv_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.recv_into(&mut raw).await?;
        Ok(u64::from_le_bytes(raw))
    }

    pub async fn recv_i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        self.recv_into(&mut raw).await?;
        Ok(i64::from_le_bytes(raw))
    }

    /// Read one `len:u64 | bytes` frame.
    ///
    /// # Errors
    ///
    /// `Protocol` when the length prefix exceeds the configured maximum.
    pub async fn recv_framed(&mut self) -> Result<Bytes> {
        let len = self.recv_u64().await?;
        if len > self.options.max_frame_size {
            return Err(RpcError::Protocol(format!(
                "frame length {} exceeds maximum {}",
                len, self.options.max_frame_size
            )));
        }
        self.recv_exact(len as usize).await
    }

    /// Read whatever is available, up to `buf.len()`. Returns 0 on EOF.
    ///
    /// No timeout applies; relay loops wait on this indefinitely.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf).await
    }
}

impl<S: AsyncWrite + Unpin> FrameTransport<S> {
    /// Write the whole buffer and flush.
    pub async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.options.io_timeout;
        let stream = &mut self.stream;
        Self::with_timeout(timeout, "send", async move {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
    }

    /// Write one `len:u64 | bytes` frame.
    pub async fn send_framed(&mut self, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(payload);
        self.send_all(&buf).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await.map_err(classify_io)
    }
}
