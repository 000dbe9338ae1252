//! Connection lifecycle: connect, handshake, reconnect.
//!
//! ```text
//! Disconnected ──► Handshaking ──► Ready ──(fatal error)──► Disconnected
//!       ▲                                                        │
//!       └──────────────────── reconnect() ◄──────────────────────┘
//! ```
//!
//! Any error for which [`RpcError::is_fatal_to_connection`] holds marks the
//! connection for reconnect, as does a backend that reports itself poisoned
//! because a caller abandoned a request mid-flight. The next command tears down the old socket,
//! dials again and repeats the handshake before it is sent.

use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{LegacyBackend, ProtobufBackend, RemoteBackend, TaggedBackend};
use crate::channel::{EphemeralChannel, ExclusiveChannel, MuxChannel};
use crate::codec::ProtoCodec;
use crate::config::{ClientConfig, ReplyMode};
use crate::error::{RpcError, Result};
use crate::protocol::handshake::validate_server_magic;
use crate::protocol::proto;
use crate::protocol::{LegacyHandshake, PlatformInfo, ProtocolVersion, HANDSHAKE_SIZE};
use crate::transport::{connect, connect_with_local, BoxedStream, FrameTransport};

/// Lifecycle state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Ready,
}

/// Dial the configured endpoint with handshake-phase timeouts.
async fn dial(config: &ClientConfig) -> Result<FrameTransport> {
    let stream = connect(&config.endpoint, config.connect_timeout()).await?;
    Ok(handshake_transport(stream, config))
}

fn handshake_transport(stream: BoxedStream, config: &ClientConfig) -> FrameTransport {
    let mut transport = FrameTransport::new(stream, config.transport_options());
    transport.set_io_timeout(Some(config.connect_timeout()));
    transport
}

/// Read and validate the fixed 520-byte generation B handshake.
pub async fn read_tagged_handshake(
    transport: &mut FrameTransport,
    expected_magic: u32,
) -> Result<LegacyHandshake> {
    let raw = transport.recv_exact(HANDSHAKE_SIZE).await?;
    let handshake = LegacyHandshake::decode(&raw)?;
    handshake.validate(expected_magic)?;
    Ok(handshake)
}

/// Read and validate the framed generation C handshake.
pub async fn read_protobuf_handshake(
    transport: &mut FrameTransport,
    expected_magic: u32,
) -> Result<proto::Handshake> {
    let handshake: proto::Handshake = ProtoCodec::decode(&transport.recv_framed().await?)?;
    validate_server_magic(expected_magic, handshake.magic)?;
    Ok(handshake)
}

fn protobuf_platform(handshake: &proto::Handshake) -> PlatformInfo {
    let platform = (!handshake.platform.is_empty()).then(|| handshake.platform.clone());
    PlatformInfo::from_fields(
        &handshake.sysname,
        &handshake.machine,
        handshake.arch,
        platform,
    )
}

/// Open a fresh generation C connection and complete its handshake.
///
/// Exec sessions use this so their chunk stream never shares a socket with
/// multiplexed command traffic.
pub(crate) async fn open_protobuf_session(
    config: &ClientConfig,
) -> Result<(FrameTransport, proto::Handshake)> {
    let mut transport = dial(config).await?;
    let handshake = read_protobuf_handshake(&mut transport, config.expected_magic).await?;
    transport.set_io_timeout(config.request_timeout());
    Ok((transport, handshake))
}

/// Connect and build the backend for the configured protocol generation.
///
/// # Errors
///
/// `InvalidServerVersionMagic` when the handshake carries the wrong magic.
/// Nothing is ever sent on such a connection.
pub async fn establish(config: &Arc<ClientConfig>) -> Result<Arc<dyn RemoteBackend>> {
    let (stream, local) = connect_with_local(&config.endpoint, config.connect_timeout()).await?;
    establish_with(stream, local, config).await
}

/// Handshake over an already open stream.
///
/// Reconnects and generation C exec sessions still dial the configured
/// endpoint.
pub async fn establish_over(
    stream: BoxedStream,
    config: &Arc<ClientConfig>,
) -> Result<Arc<dyn RemoteBackend>> {
    establish_with(stream, None, config).await
}

async fn establish_with(
    stream: BoxedStream,
    local: Option<IpAddr>,
    config: &Arc<ClientConfig>,
) -> Result<Arc<dyn RemoteBackend>> {
    let mut transport = handshake_transport(stream, config);

    let backend: Arc<dyn RemoteBackend> = match config.protocol {
        ProtocolVersion::Legacy => {
            transport.set_io_timeout(config.request_timeout());
            match config.reply_mode {
                ReplyMode::SameSocket => {
                    Arc::new(LegacyBackend::same_socket(ExclusiveChannel::new(transport)))
                }
                ReplyMode::EphemeralListener => Arc::new(LegacyBackend::ephemeral(
                    EphemeralChannel::new(
                        transport,
                        config.reply_bind_for(local),
                        config.accept_timeout(),
                    ),
                )),
            }
        }
        ProtocolVersion::Tagged => {
            let handshake = read_tagged_handshake(&mut transport, config.expected_magic).await?;
            transport.set_io_timeout(config.request_timeout());
            Arc::new(TaggedBackend::new(
                ExclusiveChannel::new(transport),
                handshake.platform(),
            ))
        }
        ProtocolVersion::Protobuf => {
            let handshake = read_protobuf_handshake(&mut transport, config.expected_magic).await?;
            transport.set_io_timeout(config.request_timeout());
            let platform = protobuf_platform(&handshake);
            let channel = MuxChannel::start(transport, handshake.client_id, config.request_timeout());
            Arc::new(ProtobufBackend::new(channel, platform, config.clone()))
        }
    };

    debug!(
        endpoint = %config.endpoint,
        protocol = %config.protocol,
        sysname = %backend.platform().sysname_raw,
        machine = %backend.platform().machine,
        client_id = ?backend.client_id(),
        "Connected to agent"
    );
    Ok(backend)
}

/// Owns the live backend and replaces it after fatal errors.
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    backend: RwLock<Option<Arc<dyn RemoteBackend>>>,
    state: StdMutex<ConnectionState>,
    needs_reconnect: AtomicBool,
    reconnect_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Connect and handshake.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let manager = Self::disconnected(config);
        manager.reconnect().await?;
        Ok(manager)
    }

    /// Handshake over `stream` instead of dialing.
    pub async fn connect_over(stream: BoxedStream, config: ClientConfig) -> Result<Self> {
        let manager = Self::disconnected(config);
        let backend = establish_over(stream, &manager.config).await?;
        manager.replace(Some(backend));
        manager.needs_reconnect.store(false, Ordering::Release);
        manager.set_state(ConnectionState::Ready);
        Ok(manager)
    }

    /// A manager with no connection yet. The first command dials.
    pub fn disconnected(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
            backend: RwLock::new(None),
            state: StdMutex::new(ConnectionState::Disconnected),
            needs_reconnect: AtomicBool::new(true),
            reconnect_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn current(&self) -> Option<Arc<dyn RemoteBackend>> {
        self.backend
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn replace(&self, backend: Option<Arc<dyn RemoteBackend>>) -> Option<Arc<dyn RemoteBackend>> {
        std::mem::replace(
            &mut *self.backend.write().unwrap_or_else(|p| p.into_inner()),
            backend,
        )
    }

    /// Force a reconnect before the next command.
    pub fn mark_for_reconnect(&self) {
        if !self.needs_reconnect.swap(true, Ordering::AcqRel) {
            debug!("Connection marked for reconnect");
        }
    }

    pub fn needs_reconnect(&self) -> bool {
        self.needs_reconnect.load(Ordering::Acquire)
    }

    /// Tear down the current socket, dial again and repeat the handshake.
    pub async fn reconnect(&self) -> Result<()> {
        let _guard = self.reconnect_lock.lock().await;
        self.reconnect_locked().await
    }

    async fn reconnect_locked(&self) -> Result<()> {
        // Dropping the backend closes its socket once in-flight users finish.
        if self.replace(None).is_some() {
            debug!(endpoint = %self.config.endpoint, "Dropping old connection");
        }
        self.set_state(ConnectionState::Handshaking);

        match establish(&self.config).await {
            Ok(backend) => {
                self.replace(Some(backend));
                self.needs_reconnect.store(false, Ordering::Release);
                self.set_state(ConnectionState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                self.needs_reconnect.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// The live backend, reconnecting first if a fatal error was seen.
    pub async fn backend(&self) -> Result<Arc<dyn RemoteBackend>> {
        if self.current().is_some_and(|b| b.is_poisoned()) {
            self.mark_for_reconnect();
        }
        if self.needs_reconnect() {
            let _guard = self.reconnect_lock.lock().await;
            // Another caller may have reconnected while we waited.
            if self.needs_reconnect() || self.current().is_some_and(|b| b.is_poisoned()) {
                self.reconnect_locked().await?;
            }
        }
        self.current().ok_or(RpcError::ConnectionClosed)
    }

    /// Run one operation, marking the connection on fatal failures.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn RemoteBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backend = self.backend().await?;
        let result = op(backend).await;
        if let Err(e) = &result {
            if e.is_fatal_to_connection() {
                warn!(error = %e, "Fatal connection error");
                self.mark_for_reconnect();
            }
        }
        result
    }

    /// Platform of the live connection.
    pub fn platform(&self) -> PlatformInfo {
        self.current()
            .map(|b| b.platform().clone())
            .unwrap_or_else(PlatformInfo::unknown)
    }

    pub fn client_id(&self) -> Option<u32> {
        self.current().and_then(|b| b.client_id())
    }

    /// Say goodbye to the agent and drop the connection.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.reconnect_lock.lock().await;
        let result = match self.replace(None) {
            Some(backend) if !backend.is_poisoned() => backend.close().await,
            _ => Ok(()),
        };
        self.set_state(ConnectionState::Disconnected);
        self.needs_reconnect.store(true, Ordering::Release);
        result
    }
}
