//! Client facade.
//!
//! [`Client`] is the object callers hold. It is cheap to clone; clones share
//! one connection and one symbol cache. Every operation goes through the
//! [`ConnectionManager`], so a fatal failure in one call triggers a
//! reconnect before the next.
//!
//! # Example
//!
//! ```ignore
//! use rpcwire_client::{args, Client, ProtocolVersion};
//!
//! #[tokio::main]
//! async fn main() -> rpcwire_client::Result<()> {
//!     let client = Client::builder()
//!         .tcp("192.168.1.20", 5910)
//!         .protocol(ProtocolVersion::Tagged)
//!         .connect()
//!         .await?;
//!
//!     let getpid = client.resolve("getpid").await?;
//!     println!("agent pid: {}", getpid.call(args![]).await?.address());
//!
//!     let buf = client.calloc(64).await?;
//!     client.symbol(buf.address().unwrap_or(0)).poke(&b"hi"[..]).await?;
//!     buf.release().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use crate::backend::{BoxFuture, CallRequest, CallReturn, ExecRequest, RemoteBackend};
use crate::codec::nul_terminated_lossy;
use crate::config::{ClientBuilder, ClientConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{RpcError, Result};
use crate::guard::{AllocationGuard, Release, Resource};
use crate::marshal::{decode_return, Arg, ReturnKind, ReturnValue};
use crate::protocol::tagged::{TaggedArg, NO_VA_LIST};
use crate::protocol::{PlatformInfo, ProtocolVersion, RTLD_NOW};
use crate::spawn::{RelayOptions, SpawnOutcome, SpawnRequest, SpawnSession, SpawnStart};
use crate::symbol::Symbol;
use crate::transport::BoxedStream;

/// Longest string `peek_str` will follow before giving up.
pub const MAX_PEEK_STR_LEN: usize = 1024 * 1024;

/// Largest single `peek_str` read; reads never cross a page boundary.
const PEEK_STR_CHUNK: u64 = 256;
const PAGE_SIZE: u64 = 4096;

/// Largest single write used to zero-fill a `calloc` block.
const ZERO_FILL_CHUNK: usize = 64 * 1024;
static ZEROS: [u8; ZERO_FILL_CHUNK] = [0; ZERO_FILL_CHUNK];

/// Name to address map for global symbols.
///
/// Filled lazily by [`Client::resolve`]; cleared on explicit reconnect.
#[derive(Debug, Default)]
pub struct SymbolCache {
    entries: StdMutex<HashMap<String, u64>>,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.lock().get(name).copied()
    }

    pub fn insert(&self, name: impl Into<String>, address: u64) {
        self.lock().insert(name.into(), address);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached address of `name`, or the result of `fetch`.
    ///
    /// # Errors
    ///
    /// `SymbolNotFound` when `fetch` resolves to NULL. Misses are not cached.
    pub async fn resolve_or_fetch<F, Fut>(&self, name: &str, fetch: F) -> Result<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        if let Some(address) = self.get(name) {
            return Ok(address);
        }
        let address = fetch().await?;
        if address == 0 {
            return Err(RpcError::SymbolNotFound(name.to_string()));
        }
        debug!(name, address = format_args!("{address:#x}"), "Resolved symbol");
        self.insert(name, address);
        Ok(address)
    }
}

struct ClientInner {
    manager: ConnectionManager,
    symbols: SymbolCache,
}

/// Remote process-control client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn from_manager(manager: ConnectionManager) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                manager,
                symbols: SymbolCache::new(),
            }),
        }
    }

    /// Connect to the configured endpoint and handshake.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Ok(Self::from_manager(ConnectionManager::connect(config).await?))
    }

    /// Handshake over an already open stream.
    pub async fn connect_over(stream: BoxedStream, config: ClientConfig) -> Result<Self> {
        Ok(Self::from_manager(
            ConnectionManager::connect_over(stream, config).await?,
        ))
    }

    /// A client that dials on its first command.
    pub fn lazy(config: ClientConfig) -> Self {
        Self::from_manager(ConnectionManager::disconnected(config))
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.manager.config()
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.config().protocol
    }

    /// Identity of the connected platform.
    pub fn platform(&self) -> PlatformInfo {
        self.inner.manager.platform()
    }

    /// Session id assigned by a generation C agent.
    pub fn client_id(&self) -> Option<u32> {
        self.inner.manager.client_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    pub fn symbols(&self) -> &SymbolCache {
        &self.inner.symbols
    }

    /// Drop the connection and handshake again.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.symbols.clear();
        self.inner.manager.reconnect().await
    }

    /// Notify the agent and close the connection.
    pub async fn close(&self) -> Result<()> {
        self.inner.manager.close().await
    }

    pub(crate) async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn RemoteBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner.manager.run(op).await
    }

    pub(crate) fn guard(&self, resource: Resource) -> AllocationGuard {
        AllocationGuard::new(resource, Arc::new(self.clone()))
    }

    /// Wrap a raw address.
    pub fn symbol(&self, address: u64) -> Symbol {
        Symbol::new(address, self.clone())
    }

    // ---- symbols and libraries ----

    pub(crate) async fn resolve_with(
        &self,
        backend: &Arc<dyn RemoteBackend>,
        name: &str,
    ) -> Result<u64> {
        let handle = backend.platform().sysname.rtld_default();
        self.inner
            .symbols
            .resolve_or_fetch(name, || backend.dlsym(handle, name))
            .await
    }

    /// Global symbol by name, cached after the first lookup.
    pub async fn resolve(&self, name: &str) -> Result<Symbol> {
        let address = self
            .run(|backend| async move { self.resolve_with(&backend, name).await })
            .await?;
        Ok(self.symbol(address))
    }

    /// `dlopen` a library. The returned guard `dlclose`s it.
    pub async fn dlopen(&self, path: &str, mode: u32) -> Result<AllocationGuard> {
        let handle = self
            .run(|backend| async move { backend.dlopen(path, mode).await })
            .await?;
        if handle == 0 {
            return Err(RpcError::BadReturnValue(format!("dlopen {path} failed")));
        }
        debug!(path, handle = format_args!("{handle:#x}"), "Library loaded");
        Ok(self.guard(Resource::Library(handle)))
    }

    /// `dlopen` with `RTLD_NOW`.
    pub async fn load_library(&self, path: &str) -> Result<AllocationGuard> {
        self.dlopen(path, RTLD_NOW).await
    }

    /// Look up `name` in a library handle. The result may be NULL.
    pub async fn dlsym(&self, handle: u64, name: &str) -> Result<Symbol> {
        let address = self
            .run(|backend| async move { backend.dlsym(handle, name).await })
            .await?;
        Ok(self.symbol(address))
    }

    pub async fn dlclose(&self, handle: u64) -> Result<i64> {
        self.run(|backend| async move { backend.dlclose(handle).await })
            .await
    }

    // ---- memory ----

    /// Read `size` bytes of remote memory.
    ///
    /// # Errors
    ///
    /// `Argument` for a NULL address (detected locally) or an address the
    /// agent cannot read.
    pub async fn peek(&self, address: u64, size: u64) -> Result<Bytes> {
        if address == 0 {
            return Err(RpcError::Argument(format!("cannot read {size} bytes at NULL")));
        }
        if size == 0 {
            return Ok(Bytes::new());
        }
        self.run(|backend| async move { backend.peek(address, size).await })
            .await
    }

    /// Write `data` to remote memory.
    pub async fn poke(&self, address: u64, data: Bytes) -> Result<()> {
        if address == 0 {
            return Err(RpcError::Argument(format!(
                "cannot write {} bytes at NULL",
                data.len()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.run(|backend| async move { backend.poke(address, data).await })
            .await
    }

    /// Read a NUL-terminated string.
    pub async fn peek_str(&self, address: u64) -> Result<String> {
        let mut collected = BytesMut::new();
        let mut cursor = address;
        loop {
            let to_page_end = PAGE_SIZE - (cursor % PAGE_SIZE);
            let chunk = self.peek(cursor, PEEK_STR_CHUNK.min(to_page_end)).await?;
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                collected.extend_from_slice(&chunk[..nul]);
                return Ok(nul_terminated_lossy(&collected));
            }
            collected.extend_from_slice(&chunk);
            if collected.len() > MAX_PEEK_STR_LEN {
                return Err(RpcError::Argument(format!(
                    "no NUL within {MAX_PEEK_STR_LEN} bytes of {address:#x}"
                )));
            }
            cursor = cursor.wrapping_add(chunk.len() as u64);
        }
    }

    async fn call_word(
        &self,
        backend: &Arc<dyn RemoteBackend>,
        function: &str,
        args: Vec<TaggedArg>,
    ) -> Result<u64> {
        let address = self.resolve_with(backend, function).await?;
        let ret = backend
            .call(CallRequest {
                address,
                args,
                va_list_index: NO_VA_LIST,
            })
            .await?;
        decode_return(ret, ReturnKind::Word).as_word()
    }

    async fn malloc_raw(&self, backend: &Arc<dyn RemoteBackend>, size: u64) -> Result<u64> {
        let address = self
            .call_word(backend, "malloc", vec![TaggedArg::integer(size.max(1))])
            .await?;
        if address == 0 {
            return Err(RpcError::BadReturnValue(format!("malloc({size}) returned NULL")));
        }
        Ok(address)
    }

    async fn free_raw(&self, backend: &Arc<dyn RemoteBackend>, address: u64) -> Result<()> {
        self.call_word(backend, "free", vec![TaggedArg::integer(address)])
            .await
            .map(|_| ())
    }

    /// Allocate remote memory. The guard frees it.
    pub async fn malloc(&self, size: u64) -> Result<AllocationGuard> {
        let address = self
            .run(|backend| async move { self.malloc_raw(&backend, size).await })
            .await?;
        Ok(self.guard(Resource::Memory(address)))
    }

    /// Allocate zero-filled remote memory. One `free` releases it.
    ///
    /// The block is cleared in writes of at most 64 KiB.
    pub async fn calloc(&self, size: u64) -> Result<AllocationGuard> {
        let guard = self.malloc(size).await?;
        if let Resource::Memory(address) = guard.resource() {
            let zeros = Bytes::from_static(&ZEROS);
            let mut offset = 0u64;
            while offset < size {
                let remaining = size - offset;
                let len = usize::try_from(remaining).map_or(ZERO_FILL_CHUNK, |r| r.min(ZERO_FILL_CHUNK));
                self.poke(address + offset, zeros.slice(..len)).await?;
                offset += len as u64;
            }
        }
        Ok(guard)
    }

    pub async fn free(&self, address: u64) -> Result<()> {
        self.run(|backend| async move { self.free_raw(&backend, address).await })
            .await
    }

    /// `errno` of the agent thread serving this connection.
    pub(crate) async fn errno_with(&self, backend: &Arc<dyn RemoteBackend>) -> Result<i32> {
        let symbol = backend.platform().sysname.errno_location_symbol();
        let location = self.call_word(backend, symbol, Vec::new()).await?;
        if location == 0 {
            return Err(RpcError::BadReturnValue(format!("{symbol}() returned NULL")));
        }
        let raw = backend.peek(location, 4).await?;
        Ok(le_i32(&raw))
    }

    /// Typed error built from the agent's current errno.
    pub(crate) async fn last_error(
        &self,
        backend: &Arc<dyn RemoteBackend>,
        context: impl Into<String>,
    ) -> RpcError {
        let context = context.into();
        match self.errno_with(backend).await {
            Ok(errno) => RpcError::from_errno(backend.platform().sysname, errno, context),
            Err(e) => {
                warn!(error = %e, "Could not read remote errno");
                RpcError::BadReturnValue(context)
            }
        }
    }

    // ---- calls ----

    /// Materialize `args` and call, recording every temporary in `temps`.
    async fn marshal_and_call(
        &self,
        backend: &Arc<dyn RemoteBackend>,
        address: u64,
        args: Vec<Arg>,
        va_list_index: u64,
        temps: &mut Vec<u64>,
    ) -> Result<CallReturn> {
        let mut wire = Vec::with_capacity(args.len());
        for arg in &args {
            if let Some(inline) = arg.inline() {
                wire.push(inline);
                continue;
            }
            if let Some(data) = arg.materialize() {
                let block = self.malloc_raw(backend, data.len() as u64).await?;
                temps.push(block);
                if !data.is_empty() {
                    backend.poke(block, data).await?;
                }
                wire.push(TaggedArg::integer(block));
            }
        }
        backend
            .call(CallRequest {
                address,
                args: wire,
                va_list_index,
            })
            .await
    }

    async fn free_temps(&self, backend: &Arc<dyn RemoteBackend>, temps: Vec<u64>) -> Result<()> {
        let mut first_err = None;
        for block in temps {
            if let Err(e) = self.free_raw(backend, block).await {
                warn!(error = %e, block = format_args!("{block:#x}"), "Failed to free call argument");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Call `address` and return the raw register result.
    ///
    /// String and byte arguments are copied to temporary remote blocks that
    /// are freed after the call on every path.
    pub async fn call_raw(
        &self,
        address: u64,
        args: Vec<Arg>,
        va_list_index: u64,
    ) -> Result<CallReturn> {
        if address == 0 {
            return Err(RpcError::Argument("cannot call NULL".to_string()));
        }
        self.run(|backend| async move {
            let mut temps = Vec::new();
            let outcome = self
                .marshal_and_call(&backend, address, args, va_list_index, &mut temps)
                .await;
            let freed = self.free_temps(&backend, temps).await;
            match outcome {
                Ok(ret) => freed.map(|_| ret),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Call `address`; the return value (`x0`) becomes a symbol.
    pub async fn call(&self, address: u64, args: Vec<Arg>) -> Result<Symbol> {
        let ret = self.call_raw(address, args, NO_VA_LIST).await?;
        Ok(self.symbol(decode_return(ret, ReturnKind::Word).as_word()?))
    }

    /// Call `address` and decode the return value as `kind`.
    pub async fn call_with(
        &self,
        address: u64,
        args: Vec<Arg>,
        kind: ReturnKind,
    ) -> Result<ReturnValue> {
        let ret = self.call_raw(address, args, NO_VA_LIST).await?;
        Ok(decode_return(ret, kind))
    }

    /// Resolve `function` and call it.
    pub async fn call_function(&self, function: &str, args: Vec<Arg>) -> Result<Symbol> {
        let symbol = self.resolve(function).await?;
        self.call(symbol.address(), args).await
    }

    /// Call a libc-style function returning `int`; a negative result is
    /// turned into the typed errno error.
    pub(crate) async fn call_checked(
        &self,
        function: &str,
        args: Vec<Arg>,
        context: impl Into<String>,
    ) -> Result<i64> {
        let context = context.into();
        self.run(|backend| async move {
            let address = self.resolve_with(&backend, function).await?;
            let mut temps = Vec::new();
            let outcome = self
                .marshal_and_call(&backend, address, args, NO_VA_LIST, &mut temps)
                .await;
            let outcome = match outcome {
                Ok(ret) => {
                    let value = decode_return(ret, ReturnKind::Word).as_word()? as i64;
                    if value < 0 {
                        Err(self.last_error(&backend, context).await)
                    } else {
                        Ok(value)
                    }
                }
                Err(e) => Err(e),
            };
            let freed = self.free_temps(&backend, temps).await;
            match outcome {
                Ok(value) => freed.map(|_| value),
                Err(e) => Err(e),
            }
        })
        .await
    }

    // ---- agent introspection ----

    /// Scratch block provided by the agent.
    pub async fn get_dummy_block(&self) -> Result<Symbol> {
        let address = self
            .run(|backend| async move { backend.get_dummy_block().await })
            .await?;
        Ok(self.symbol(address))
    }

    /// Agent-side description of an object, as JSON.
    pub async fn show_object(&self, address: u64) -> Result<serde_json::Value> {
        let text = self
            .run(|backend| async move { backend.show_object(address).await })
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Agent-side description of a class, as JSON.
    pub async fn show_class(&self, address: u64) -> Result<serde_json::Value> {
        let text = self
            .run(|backend| async move { backend.show_class(address).await })
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    // ---- processes ----

    /// Run a process and relay its output to `sink`.
    ///
    /// Background requests return as soon as the pid is known. A failure
    /// while relaying on the shared command socket marks the connection for
    /// reconnect.
    pub async fn spawn<W>(&self, request: SpawnRequest, sink: &mut W) -> Result<SpawnOutcome>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let SpawnRequest {
            argv,
            envp,
            background,
            stdin,
        } = request;
        let exec = ExecRequest {
            argv,
            envp,
            background,
        };

        let start = self
            .run(|backend| async move { SpawnSession::start(backend.as_ref(), exec).await })
            .await?;
        let session = match start {
            SpawnStart::Background { pid } => return Ok(SpawnOutcome::Background { pid }),
            SpawnStart::Session(session) => session,
        };

        let config = self.config();
        let options = RelayOptions {
            input_chunk_size: config.relay_chunk_size,
            max_chunk_size: config.max_chunk_size,
            raw_terminal: config.raw_terminal,
        };
        let shared = session.uses_shared_socket();
        let outcome = session.run(stdin, sink, options).await;

        match &outcome {
            Err(e) if shared || e.is_fatal_to_connection() => {
                self.inner.manager.mark_for_reconnect();
            }
            Ok(SpawnOutcome::Disconnected { .. }) if shared => {
                self.inner.manager.mark_for_reconnect();
            }
            _ => {}
        }
        outcome
    }

    /// Start a detached process and return its pid.
    pub async fn spawn_background<I, S>(&self, argv: I) -> Result<u32>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sink = tokio::io::sink();
        let outcome = self
            .spawn(SpawnRequest::new(argv).background(), &mut sink)
            .await?;
        Ok(outcome.pid())
    }

    /// Send `signal` to a remote process.
    pub async fn kill(&self, pid: u32, signal: i32) -> Result<()> {
        self.call_checked("kill", vec![Arg::from(pid), Arg::from(signal)], format!("kill {pid}"))
            .await
            .map(|_| ())
    }

    /// Wait for a remote child and return its raw wait status.
    pub async fn waitpid(&self, pid: u32) -> Result<i32> {
        let status = self.calloc(4).await?;
        let address = status.address().unwrap_or(0);
        let outcome = async {
            self.call_checked(
                "waitpid",
                vec![Arg::from(pid), Arg::Int(address), Arg::Int(0)],
                format!("waitpid {pid}"),
            )
            .await?;
            let raw = self.peek(address, 4).await?;
            Ok(le_i32(&raw))
        }
        .await;
        let released = status.release().await;
        outcome.and_then(|code| released.map(|_| code))
    }
}

/// Little-endian `int` from the start of `raw`, zero-padded if short.
pub(crate) fn le_i32(raw: &[u8]) -> i32 {
    let mut word = [0u8; 4];
    let n = raw.len().min(4);
    word[..n].copy_from_slice(&raw[..n]);
    i32::from_le_bytes(word)
}

impl Release for Client {
    fn release(&self, resource: Resource) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match resource {
                Resource::Memory(address) => self.free(address).await,
                Resource::Fd(fd) => self.close_fd(fd).await,
                Resource::Library(handle) => {
                    let res = self.dlclose(handle).await?;
                    if res != 0 {
                        return Err(RpcError::BadReturnValue(format!(
                            "dlclose({handle:#x}) returned {res}"
                        )));
                    }
                    Ok(())
                }
            }
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.config().endpoint)
            .field("protocol", &self.config().protocol)
            .field("state", &self.state())
            .finish()
    }
}
