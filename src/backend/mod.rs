//! Backend module - one command strategy per wire generation.
//!
//! Every generation implements [`RemoteBackend`]. The facade only ever
//! talks to this trait; which implementation sits behind it is decided by
//! [`ProtocolVersion`](crate::protocol::ProtocolVersion) when connecting.
//!
//! Operations a generation does not offer return
//! [`RpcError::Unsupported`] through the default methods.

mod legacy;
mod protobuf;
mod tagged;

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::OwnedMutexGuard;

use crate::error::{RpcError, Result};
use crate::protocol::tagged::TaggedArg;
use crate::protocol::{DirEntry, PlatformInfo, ProtocolVersion, RegisterFile, Reply};
use crate::transport::FrameTransport;

pub use legacy::LegacyBackend;
pub use protobuf::ProtobufBackend;
pub use tagged::TaggedBackend;

/// Boxed future returned by backend operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A remote function call after argument marshaling.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub address: u64,
    pub args: Vec<TaggedArg>,
    pub va_list_index: u64,
}

/// Raw result of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallReturn {
    /// Single 64-bit return value.
    Word(u64),
    /// ARM64 register snapshot.
    Registers(RegisterFile),
}

/// Process creation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub background: bool,
}

/// A file-descriptor command carried natively by generation A.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOp {
    Open { filename: String, mode: i32 },
    Close { fd: i32 },
    Read { fd: i32, size: u64 },
    Write { fd: i32, data: Bytes },
    Remove { filename: String },
    Mkdir { filename: String, mode: u32 },
    Chmod { filename: String, mode: u32 },
}

/// Socket carrying an exec chunk stream.
///
/// Either the shared command socket, held exclusively until the relay ends,
/// or a connection opened for this session alone.
pub enum RelayTransport {
    Shared(OwnedMutexGuard<FrameTransport>),
    Dedicated(FrameTransport),
}

impl Deref for RelayTransport {
    type Target = FrameTransport;

    fn deref(&self) -> &FrameTransport {
        match self {
            RelayTransport::Shared(guard) => &**guard,
            RelayTransport::Dedicated(transport) => transport,
        }
    }
}

impl DerefMut for RelayTransport {
    fn deref_mut(&mut self) -> &mut FrameTransport {
        match self {
            RelayTransport::Shared(guard) => &mut **guard,
            RelayTransport::Dedicated(transport) => transport,
        }
    }
}

/// Outcome of an exec command.
pub struct ExecStart {
    pub pid: u32,
    /// Present for foreground spawns that the agent accepted.
    pub relay: Option<RelayTransport>,
}

fn unsupported<'a, T: Send + 'a>(
    protocol: ProtocolVersion,
    operation: &'static str,
) -> BoxFuture<'a, Result<T>> {
    Box::pin(async move {
        Err(RpcError::Unsupported {
            protocol: protocol.name(),
            operation,
        })
    })
}

/// Command strategy of one protocol generation.
pub trait RemoteBackend: Send + Sync {
    fn protocol(&self) -> ProtocolVersion;

    /// Platform identity from the handshake.
    fn platform(&self) -> &PlatformInfo;

    /// Session id issued by the agent, when the generation has one.
    fn client_id(&self) -> Option<u32> {
        None
    }

    fn dlopen<'a>(&'a self, filename: &'a str, mode: u32) -> BoxFuture<'a, Result<u64>>;

    fn dlclose(&self, handle: u64) -> BoxFuture<'_, Result<i64>>;

    fn dlsym<'a>(&'a self, handle: u64, name: &'a str) -> BoxFuture<'a, Result<u64>>;

    fn call(&self, call: CallRequest) -> BoxFuture<'_, Result<CallReturn>>;

    /// Read `size` bytes. An address the agent refuses is an argument error.
    fn peek(&self, address: u64, size: u64) -> BoxFuture<'_, Result<Bytes>>;

    fn poke(&self, address: u64, data: Bytes) -> BoxFuture<'_, Result<()>>;

    fn exec(&self, request: ExecRequest) -> BoxFuture<'_, Result<ExecStart>>;

    /// Tell the agent this client is going away.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    fn get_dummy_block(&self) -> BoxFuture<'_, Result<u64>> {
        unsupported(self.protocol(), "get_dummy_block")
    }

    fn listdir<'a>(&'a self, _path: &'a str) -> BoxFuture<'a, Result<Vec<DirEntry>>> {
        unsupported(self.protocol(), "listdir")
    }

    fn show_object(&self, _address: u64) -> BoxFuture<'_, Result<String>> {
        unsupported(self.protocol(), "show_object")
    }

    fn show_class(&self, _address: u64) -> BoxFuture<'_, Result<String>> {
        unsupported(self.protocol(), "show_class")
    }

    /// Native file-descriptor command. Only generation A has these; later
    /// generations go through libc calls instead.
    fn file_op(&self, _op: FileOp) -> BoxFuture<'_, Result<Reply>> {
        unsupported(self.protocol(), "file_op")
    }

    fn supports_file_ops(&self) -> bool {
        false
    }

    /// True when the socket can no longer be trusted to line replies up
    /// with requests, e.g. after a caller gave up mid-exchange.
    fn is_poisoned(&self) -> bool {
        false
    }
}
