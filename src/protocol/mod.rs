//! Protocol module - wire formats of the three agent generations.
//!
//! - [`legacy`]: generation A, fixed structs, raw replies
//! - [`tagged`]: generation B, server handshake, tagged call arguments
//! - [`proto`]: generation C, length-prefixed protobuf with message ids
//! - [`chunk`]: exec output stream shared by all generations
//!
//! The generations are not wire compatible and are kept as separate
//! modules; [`ProtocolVersion`] selects one at connect time.

pub mod chunk;
pub mod handshake;
pub mod legacy;
pub mod proto;
pub mod reply;
pub mod structs;
pub mod tagged;

use serde::Deserialize;

pub use chunk::{Chunk, ChunkBuffer, ChunkHeader, ChunkType, CHUNK_HEADER_SIZE};
pub use handshake::{Arch, LegacyHandshake, PlatformInfo, Sysname, HANDSHAKE_SIZE};
pub use reply::{RegisterFile, Reply, ReplyShape, Request};
pub use structs::{DirEntry, Stat64};

/// Default agent port for every generation.
pub const DEFAULT_PORT: u16 = 5910;

/// Magic at the start of every command header (generations A and B).
pub const MAGIC: u32 = 0x1234_5678;

/// Handshake magic of the current server protocol version.
pub const SERVER_MAGIC_VERSION: u32 = 0x8888_8807;

/// Pid returned by the agent when spawning failed.
pub const INVALID_PID: u32 = 0xffff_ffff;

/// Width of path fields.
pub const MAX_PATH_LEN: usize = 1024;

/// Width of `utsname` fields in the handshake.
pub const UNAME_FIELD_LEN: usize = 256;

/// Width of the generation A `dlsym` symbol field.
pub const SYMBOL_NAME_LEN: usize = 256;

/// `dlopen` mode used by the client helpers.
pub const RTLD_NOW: u32 = 2;

/// Wire protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Generation A: no handshake, fixed-size raw replies.
    Legacy,
    /// Generation B: 520-byte handshake, tagged call arguments.
    #[default]
    Tagged,
    /// Generation C: framed protobuf, message-id multiplexing.
    Protobuf,
}

impl ProtocolVersion {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolVersion::Legacy => "legacy",
            ProtocolVersion::Tagged => "tagged",
            ProtocolVersion::Protobuf => "protobuf",
        }
    }

    /// Whether the server sends a handshake on connect.
    pub fn has_handshake(&self) -> bool {
        !matches!(self, ProtocolVersion::Legacy)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
