//! # rpcwire-client
//!
//! Async client for remote process-control agents.
//!
//! An agent runs on a remote host and executes primitive commands on
//! request: resolve symbols, call functions, read and write memory, run
//! processes. This crate speaks all three agent wire generations and gives
//! them one API.
//!
//! ## Architecture
//!
//! - **Transport**: TCP or Unix stream, framed with explicit lengths
//! - **Channels**: exclusive (one request in flight), ephemeral (reply on a
//!   side socket) or multiplexed (correlated by message id)
//! - **Backends**: one per protocol generation, behind [`backend::RemoteBackend`]
//! - **Facade**: [`Client`], [`Symbol`] and [`AllocationGuard`]
//!
//! ## Example
//!
//! ```ignore
//! use rpcwire_client::{args, Client, ProtocolVersion, SpawnRequest};
//!
//! #[tokio::main]
//! async fn main() -> rpcwire_client::Result<()> {
//!     let client = Client::builder()
//!         .tcp("device.local", 5910)
//!         .protocol(ProtocolVersion::Tagged)
//!         .connect()
//!         .await?;
//!
//!     let puts = client.resolve("puts").await?;
//!     puts.call(args!["hello from the other side"]).await?;
//!
//!     let mut out = tokio::io::stdout();
//!     let outcome = client
//!         .spawn(SpawnRequest::new(["/bin/uname", "-a"]), &mut out)
//!         .await?;
//!     println!("exit code {:?}", outcome.exit_code());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod guard;
pub mod marshal;
pub mod protocol;
pub mod spawn;
pub mod symbol;
pub mod transport;

mod client;
mod files;

pub use client::{Client, SymbolCache, MAX_PEEK_STR_LEN};
pub use config::{ClientBuilder, ClientConfig, ReplyMode};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{Result, RpcError};
pub use files::{OpenMode, TRANSFER_CHUNK_SIZE};
pub use guard::{AllocationGuard, Release, Resource};
pub use marshal::{Arg, ReturnKind, ReturnValue};
pub use protocol::{DirEntry, PlatformInfo, ProtocolVersion, Stat64, Sysname};
pub use spawn::{SpawnOutcome, SpawnRequest, StdinSource};
pub use symbol::Symbol;
pub use transport::Endpoint;
