//! Client configuration.
//!
//! [`ClientConfig`] can be built in code with [`ClientBuilder`] or loaded
//! from JSON:
//!
//! ```
//! use rpcwire_client::{ClientConfig, ProtocolVersion};
//!
//! let config = ClientConfig::from_json(r#"{
//!     "endpoint": { "tcp": { "host": "192.168.1.20", "port": 5910 } },
//!     "protocol": "protobuf",
//!     "request_timeout_ms": 30000
//! }"#).unwrap();
//! assert_eq!(config.protocol, ProtocolVersion::Protobuf);
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::protocol::chunk::DEFAULT_MAX_CHUNK_SIZE;
use crate::protocol::{ProtocolVersion, SERVER_MAGIC_VERSION};
use crate::transport::{Endpoint, TransportOptions, DEFAULT_MAX_FRAME_SIZE};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for the agent to connect back in ephemeral reply mode.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default size of one local-input chunk forwarded to a spawned process.
pub const DEFAULT_RELAY_CHUNK_SIZE: usize = 1024;

/// How generation A replies are matched to commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// Reply follows the command on the same socket.
    #[default]
    SameSocket,
    /// Agent connects back to a per-command listener.
    EphemeralListener,
}

/// Everything needed to reach and talk to an agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub protocol: ProtocolVersion,
    /// Only meaningful for [`ProtocolVersion::Legacy`].
    pub reply_mode: ReplyMode,
    /// Address the ephemeral reply listener binds to. `None` binds to the
    /// local address of the command connection.
    pub reply_bind_addr: Option<IpAddr>,
    /// Per-request timeout. `None` waits forever.
    pub request_timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    pub accept_timeout_ms: u64,
    /// Handshake magic the server must present.
    pub expected_magic: u32,
    /// Largest local-input read forwarded per relay iteration.
    pub relay_chunk_size: usize,
    pub max_frame_size: u64,
    pub max_chunk_size: u32,
    /// Put the local terminal in raw mode during interactive spawns.
    pub raw_terminal: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            protocol: ProtocolVersion::default(),
            reply_mode: ReplyMode::default(),
            reply_bind_addr: None,
            request_timeout_ms: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            accept_timeout_ms: DEFAULT_ACCEPT_TIMEOUT.as_millis() as u64,
            expected_magic: SERVER_MAGIC_VERSION,
            relay_chunk_size: DEFAULT_RELAY_CHUNK_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            raw_terminal: false,
        }
    }
}

impl ClientConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    /// Bind address for reply listeners, given the command connection's
    /// local address. Loopback when neither is known.
    pub fn reply_bind_for(&self, command_local: Option<IpAddr>) -> IpAddr {
        self.reply_bind_addr
            .or(command_local)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub(crate) fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            io_timeout: self.request_timeout(),
            max_frame_size: self.max_frame_size,
        }
    }
}

/// Fluent builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connect over TCP.
    pub fn tcp(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.endpoint = Endpoint::tcp(host, port);
        self
    }

    /// Connect over a Unix domain socket.
    pub fn unix(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.config.endpoint = Endpoint::unix(path);
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    pub fn protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Generation A reply matching.
    ///
    /// Default: [`ReplyMode::SameSocket`]
    pub fn reply_mode(mut self, mode: ReplyMode) -> Self {
        self.config.reply_mode = mode;
        self
    }

    /// Default: the local address of the command connection
    pub fn reply_bind_addr(mut self, addr: IpAddr) -> Self {
        self.config.reply_bind_addr = Some(addr);
        self
    }

    /// Default: none
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Default: 10 seconds
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.accept_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Default: `0x88888807`
    pub fn expected_magic(mut self, magic: u32) -> Self {
        self.config.expected_magic = magic;
        self
    }

    /// Default: 1024
    pub fn relay_chunk_size(mut self, size: usize) -> Self {
        self.config.relay_chunk_size = size.max(1);
        self
    }

    pub fn max_frame_size(mut self, size: u64) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn raw_terminal(mut self, enabled: bool) -> Self {
        self.config.raw_terminal = enabled;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }

    /// Connect and complete the handshake.
    pub async fn connect(self) -> Result<crate::Client> {
        crate::Client::connect(self.config).await
    }
}
