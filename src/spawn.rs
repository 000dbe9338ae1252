//! Remote process execution and stdio relay.
//!
//! ```text
//! Requested ──exec──► Running ──► Streaming ⇄ waiting ──► Exited(code)
//!     │                                  │
//!     ├── pid == INVALID_PID ──► Spawn error
//!     └── background ──► Background(pid)          reset ──► Disconnected
//! ```
//!
//! The relay waits on local input (when live) and the exec socket at the
//! same time. Local input is forwarded verbatim in bounded chunks. Socket
//! bytes are fed through a [`ChunkBuffer`]: `STDOUT` payloads go to the
//! sink, an `ERRORCODE` chunk ends the session with the exit code.

use std::io::{ErrorKind, IsTerminal};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::backend::{ExecRequest, RelayTransport, RemoteBackend};
use crate::error::{RpcError, Result};
use crate::protocol::{Chunk, ChunkBuffer, INVALID_PID};

/// Socket read size during the relay.
const RELAY_READ_SIZE: usize = 4096;

/// Local input for a spawned process.
#[derive(Default)]
pub enum StdinSource {
    /// No input.
    #[default]
    None,
    /// Written once, entirely, before the relay starts.
    Bytes(Bytes),
    /// Forwarded as it becomes readable.
    Reader(Box<dyn AsyncRead + Unpin + Send>),
}

impl std::fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdinSource::None => f.write_str("None"),
            StdinSource::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            StdinSource::Reader(_) => f.write_str("Reader"),
        }
    }
}

/// What to run and how.
#[derive(Debug, Default)]
pub struct SpawnRequest {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    /// Detach; no relay, the caller owns the pid.
    pub background: bool,
    pub stdin: StdinSource,
}

impl SpawnRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn env<I, S>(mut self, envp: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.envp = envp.into_iter().map(Into::into).collect();
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = stdin;
        self
    }
}

/// How a spawn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// Started detached.
    Background { pid: u32 },
    /// The process exited and reported its status.
    Exited { pid: u32, code: i32 },
    /// The agent closed the relay socket before an exit code arrived.
    Disconnected { pid: u32 },
}

impl SpawnOutcome {
    pub fn pid(&self) -> u32 {
        match self {
            SpawnOutcome::Background { pid }
            | SpawnOutcome::Exited { pid, .. }
            | SpawnOutcome::Disconnected { pid } => *pid,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SpawnOutcome::Exited { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Relay tuning.
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// Largest local-input read forwarded at once.
    pub input_chunk_size: usize,
    /// Largest exec chunk payload accepted.
    pub max_chunk_size: u32,
    /// Put the local terminal in raw mode while relaying live input.
    pub raw_terminal: bool,
}

/// Result of sending the exec command.
pub enum SpawnStart {
    Background { pid: u32 },
    Session(SpawnSession),
}

/// A running foreground process and its relay socket.
pub struct SpawnSession {
    pid: u32,
    relay: RelayTransport,
}

impl SpawnSession {
    /// Send the exec command.
    ///
    /// # Errors
    ///
    /// `Spawn` when the agent answers with the invalid-pid sentinel.
    pub async fn start(backend: &dyn RemoteBackend, request: ExecRequest) -> Result<SpawnStart> {
        let argv0 = request.argv.first().cloned().unwrap_or_default();
        let background = request.background;
        let started = backend.exec(request).await?;

        if started.pid == INVALID_PID {
            return Err(RpcError::Spawn(format!("failed to execute {argv0}")));
        }
        debug!(pid = started.pid, background, "Process started");

        match (background, started.relay) {
            (true, _) => Ok(SpawnStart::Background { pid: started.pid }),
            (false, Some(relay)) => Ok(SpawnStart::Session(SpawnSession {
                pid: started.pid,
                relay,
            })),
            (false, None) => Err(RpcError::Protocol(format!(
                "no relay socket for foreground pid {}",
                started.pid
            ))),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the relay holds the shared command socket.
    pub fn uses_shared_socket(&self) -> bool {
        matches!(self.relay, RelayTransport::Shared(_))
    }

    /// Relay stdio until the process exits or the socket resets.
    pub async fn run<W>(mut self, stdin: StdinSource, sink: &mut W, options: RelayOptions) -> Result<SpawnOutcome>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut input = match stdin {
            StdinSource::None => None,
            StdinSource::Bytes(data) => {
                self.relay.send_all(&data).await?;
                None
            }
            StdinSource::Reader(reader) => Some(reader),
        };

        let _raw = match &input {
            Some(_) if options.raw_terminal => RawModeGuard::enable(),
            _ => RawModeGuard::disabled(),
        };

        let mut chunks = ChunkBuffer::with_max_chunk(options.max_chunk_size);
        let mut socket_buf = vec![0u8; RELAY_READ_SIZE];
        let mut input_buf = vec![0u8; options.input_chunk_size.max(1)];

        loop {
            tokio::select! {
                read = self.relay.read_some(&mut socket_buf) => {
                    let n = match read {
                        Ok(0) => return Ok(self.bye()),
                        Ok(n) => n,
                        Err(e) if is_reset(e.kind()) => return Ok(self.bye()),
                        Err(e) => return Err(e.into()),
                    };
                    for chunk in chunks.push(&socket_buf[..n])? {
                        match chunk {
                            Chunk::Stdout(data) => {
                                sink.write_all(&data).await?;
                                sink.flush().await?;
                            }
                            Chunk::ExitCode(code) => {
                                debug!(pid = self.pid, code, "Process exited");
                                return Ok(SpawnOutcome::Exited { pid: self.pid, code });
                            }
                        }
                    }
                }
                read = read_input(&mut input, &mut input_buf), if input.is_some() => {
                    match read? {
                        0 => {
                            debug!(pid = self.pid, "Local input closed");
                            input = None;
                        }
                        n => self.relay.send_all(&input_buf[..n]).await?,
                    }
                }
            }
        }
    }

    fn bye(&self) -> SpawnOutcome {
        warn!(pid = self.pid, "Agent closed the relay socket");
        SpawnOutcome::Disconnected { pid: self.pid }
    }
}

fn is_reset(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

async fn read_input(
    input: &mut Option<Box<dyn AsyncRead + Unpin + Send>>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match input {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Local terminal raw mode, restored on drop.
struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    fn disabled() -> Self {
        Self { enabled: false }
    }

    fn enable() -> Self {
        if !std::io::stdin().is_terminal() {
            return Self::disabled();
        }
        match crossterm::terminal::enable_raw_mode() {
            Ok(()) => Self { enabled: true },
            Err(e) => {
                warn!(error = %e, "Could not enable raw terminal mode");
                Self::disabled()
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            if let Err(e) = crossterm::terminal::disable_raw_mode() {
                warn!(error = %e, "Could not restore terminal mode");
            }
        }
    }
}
