//! Same-socket 1:1 channel (generations A and B).
//!
//! The reply to a command arrives on the same socket, immediately after it,
//! with no id. One lock covers "send + read reply" so concurrent callers can
//! never interleave bytes or steal each other's replies.
//!
//! A caller that is dropped between sending and reading the whole reply
//! leaves bytes on the socket that belong to nobody. The channel is then
//! poisoned: every later exchange fails with `ConnectionClosed` and the
//! connection manager dials again before the next command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::reply::read_reply;
use crate::error::{RpcError, Result};
use crate::protocol::{Reply, Request};
use crate::transport::FrameTransport;

/// Lock-protected request/reply channel over one socket.
#[derive(Clone)]
pub struct ExclusiveChannel {
    transport: Arc<Mutex<FrameTransport>>,
    poisoned: Arc<AtomicBool>,
}

/// Poisons the channel unless disarmed once the reply has been read.
struct InFlight<'a> {
    poisoned: &'a AtomicBool,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Exchange abandoned mid-flight, poisoning channel");
            self.poisoned.store(true, Ordering::Release);
        }
    }
}

impl ExclusiveChannel {
    pub fn new(transport: FrameTransport) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True once the socket may hold bytes of an abandoned reply.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Send `request` and read its reply while holding the socket lock.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once the channel is poisoned. Any send or read
    /// failure also poisons it, since the reply may be partially consumed.
    pub async fn exchange(&self, request: Request) -> Result<Reply> {
        let mut transport = self.transport.lock().await;
        if self.is_poisoned() {
            return Err(RpcError::ConnectionClosed);
        }
        debug!(len = request.bytes.len(), shape = ?request.shape, "exchange");

        let in_flight = InFlight {
            poisoned: &self.poisoned,
            armed: true,
        };
        transport.send_all(&request.bytes).await?;
        let reply = read_reply(&mut transport, request.shape).await?;
        in_flight.disarm();
        Ok(reply)
    }

    /// Send a message that has no reply.
    pub async fn send_only(&self, bytes: &[u8]) -> Result<()> {
        let mut transport = self.transport.lock().await;
        if self.is_poisoned() {
            return Err(RpcError::ConnectionClosed);
        }
        let in_flight = InFlight {
            poisoned: &self.poisoned,
            armed: true,
        };
        transport.send_all(bytes).await?;
        in_flight.disarm();
        Ok(())
    }

    /// Mark the socket unusable, e.g. after an exec relay ends mid-stream.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    /// Take the socket for an exec relay. Commands wait until the guard drops.
    pub async fn lock_owned(&self) -> Result<OwnedMutexGuard<FrameTransport>> {
        let guard = self.transport.clone().lock_owned().await;
        if self.is_poisoned() {
            return Err(RpcError::ConnectionClosed);
        }
        Ok(guard)
    }
}
