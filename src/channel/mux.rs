//! Message-id multiplexed channel (generation C).
//!
//! A background task reads every incoming frame and routes it to the
//! waiting caller through [`PendingRegistry`]. Replies are matched by
//! `msg_id`, never by arrival order across ids. Within one reply id, waiters
//! are served first in, first out.
//!
//! `REP_ERROR` carries no request id. To keep it attributable, one lock
//! covers "send + await reply", so at most one live request is outstanding
//! and the error goes to the oldest registered waiter. A caller dropped
//! mid-request leaves its waiter registered; the late reply (or error) is
//! consumed by that dead waiter instead of reaching the next caller.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::codec::ProtoCodec;
use crate::error::{RpcError, Result};
use crate::protocol::proto::{msg_id, ReplyError, RpcMessage};
use crate::transport::{BoxedStream, FrameTransport};

type ReplySender = oneshot::Sender<Result<Bytes>>;

struct Waiter {
    seq: u64,
    sender: ReplySender,
}

/// Requests awaiting a reply, keyed by expected reply id.
#[derive(Default)]
pub struct PendingRegistry {
    waiters: StdMutex<HashMap<u32, VecDeque<Waiter>>>,
    next_seq: AtomicU64,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `reply_id`.
    pub fn register(&self, reply_id: u32) -> oneshot::Receiver<Result<Bytes>> {
        let (sender, receiver) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(reply_id)
            .or_default()
            .push_back(Waiter { seq, sender });
        receiver
    }

    /// Take the oldest waiter for `reply_id`.
    pub fn take(&self, reply_id: u32) -> Option<ReplySender> {
        let mut waiters = self.lock();
        let queue = waiters.get_mut(&reply_id)?;
        let waiter = queue.pop_front();
        if queue.is_empty() {
            waiters.remove(&reply_id);
        }
        waiter.map(|w| w.sender)
    }

    /// Take the oldest waiter across all reply ids.
    pub fn take_oldest(&self) -> Option<ReplySender> {
        let mut waiters = self.lock();
        let reply_id = waiters
            .iter()
            .filter_map(|(id, q)| q.front().map(|w| (w.seq, *id)))
            .min()
            .map(|(_, id)| id)?;
        let queue = waiters.get_mut(&reply_id)?;
        let waiter = queue.pop_front();
        if queue.is_empty() {
            waiters.remove(&reply_id);
        }
        waiter.map(|w| w.sender)
    }

    /// Fail every outstanding request.
    pub fn fail_all(&self, make_err: impl Fn() -> RpcError) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, queue) in drained {
            for waiter in queue {
                let _ = waiter.sender.send(Err(make_err()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, VecDeque<Waiter>>> {
        // A poisoned map is still structurally valid.
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Multiplexed request/reply channel.
pub struct MuxChannel {
    writer: Mutex<FrameTransport<WriteHalf<BoxedStream>>>,
    exchange: Mutex<()>,
    pending: Arc<PendingRegistry>,
    closed: Arc<AtomicBool>,
    client_id: u32,
    request_timeout: Option<Duration>,
    reader_task: JoinHandle<()>,
}

impl MuxChannel {
    /// Start the channel over a transport whose handshake is already done.
    pub fn start(
        transport: FrameTransport,
        client_id: u32,
        request_timeout: Option<Duration>,
    ) -> Self {
        let (mut reader, writer) = transport.split();
        // The reader waits indefinitely; per-request timeouts apply instead.
        reader.set_io_timeout(None);

        let pending = Arc::new(PendingRegistry::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_loop(reader, pending.clone(), closed.clone()));

        Self {
            writer: Mutex::new(writer),
            exchange: Mutex::new(()),
            pending,
            closed,
            client_id,
            request_timeout,
            reader_task,
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send request `id` with `payload` and wait for its reply payload.
    ///
    /// # Errors
    ///
    /// - `ServerResponse` when the agent answers with `REP_ERROR`
    /// - `ResourceTemporarilyUnavailable` when the request timeout fires
    /// - `ConnectionClosed` once the reader has stopped
    pub async fn request(&self, id: u32, payload: Vec<u8>) -> Result<Bytes> {
        let _exchange = self.exchange.lock().await;
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        let reply_id = msg_id::reply_for(id);
        let receiver = self.pending.register(reply_id);
        if self.is_closed() {
            // The reader stopped between the first check and registration.
            return Err(RpcError::ConnectionClosed);
        }
        let envelope = RpcMessage {
            client_id: self.client_id,
            msg_id: id,
            payload,
        };

        debug!(msg_id = id, reply_id, "mux request");
        if let Err(e) = self
            .writer
            .lock()
            .await
            .send_framed(&ProtoCodec::encode(&envelope))
            .await
        {
            self.closed.store(true, Ordering::Release);
            self.pending.fail_all(|| RpcError::ConnectionClosed);
            return Err(e);
        }

        let outcome = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(res) => res,
                Err(_) => {
                    // A late reply would be routed to the next waiter.
                    self.closed.store(true, Ordering::Release);
                    self.pending.fail_all(|| RpcError::ConnectionClosed);
                    return Err(RpcError::ResourceTemporarilyUnavailable(format!(
                        "no reply to message {id} within {limit:?}"
                    )));
                }
            },
            None => receiver.await,
        };

        outcome.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    /// Send a message without waiting for a reply.
    pub async fn notify(&self, id: u32, payload: Vec<u8>) -> Result<()> {
        let envelope = RpcMessage {
            client_id: self.client_id,
            msg_id: id,
            payload,
        };
        self.writer
            .lock()
            .await
            .send_framed(&ProtoCodec::encode(&envelope))
            .await
    }

    /// Number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for MuxChannel {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.pending.fail_all(|| RpcError::ConnectionClosed);
    }
}

/// Background reader: route every frame to its waiter.
async fn read_loop(
    mut reader: FrameTransport<ReadHalf<BoxedStream>>,
    pending: Arc<PendingRegistry>,
    closed: Arc<AtomicBool>,
) {
    let failure = loop {
        let frame = match reader.recv_framed().await {
            Ok(frame) => frame,
            Err(e) => break e,
        };
        let msg: RpcMessage = match ProtoCodec::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => break e,
        };

        if msg.msg_id == msg_id::REP_ERROR {
            let message = ProtoCodec::decode::<ReplyError>(&msg.payload)
                .map(|e| e.message)
                .unwrap_or_else(|e| format!("undecodable error reply: {e}"));
            match pending.take_oldest() {
                Some(sender) => {
                    let _ = sender.send(Err(RpcError::ServerResponse(message)));
                }
                None => warn!(%message, "Error reply with no outstanding request"),
            }
            continue;
        }

        match pending.take(msg.msg_id) {
            Some(sender) => {
                let _ = sender.send(Ok(Bytes::from(msg.payload)));
            }
            None => break RpcError::UnknownMessageId(msg.msg_id),
        }
    };

    closed.store(true, Ordering::Release);
    match &failure {
        RpcError::ServerDied => debug!("Agent closed the connection"),
        other => error!(error = %other, "Reader loop stopped"),
    }

    let description = failure.to_string();
    pending.fail_all(|| match &failure {
        RpcError::UnknownMessageId(id) => RpcError::UnknownMessageId(*id),
        RpcError::ServerDied => RpcError::ServerDied,
        _ => RpcError::Protocol(description.clone()),
    });
}
