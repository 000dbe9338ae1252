//! Handshake records and platform identity.
//!
//! Generation B servers send a fixed 520-byte record immediately on connect:
//!
//! ```text
//! ┌──────────┬──────────┬─────────────────┬─────────────────┐
//! │ magic    │ arch     │ sysname         │ machine         │
//! │ u32 LE   │ u32 LE   │ char[256]       │ char[256]       │
//! └──────────┴──────────┴─────────────────┴─────────────────┘
//! ```
//!
//! Generation C carries the same fields in a protobuf `Handshake`; both are
//! normalized into [`PlatformInfo`].

use bytes::Bytes;
use serde::Serialize;

use super::UNAME_FIELD_LEN;
use crate::codec::{WireReader, WireWriter};
use crate::error::{RpcError, Result};

/// Size of the generation B handshake record.
pub const HANDSHAKE_SIZE: usize = 4 + 4 + UNAME_FIELD_LEN * 2;

/// Remote operating system family, as reported by `uname().sysname`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sysname {
    Darwin,
    Linux,
    Unknown,
}

impl Sysname {
    /// Parse a `uname` sysname field (case-insensitive).
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "darwin" => Sysname::Darwin,
            "linux" => Sysname::Linux,
            _ => Sysname::Unknown,
        }
    }

    /// Name of the function returning a pointer to the thread's errno.
    pub fn errno_location_symbol(&self) -> &'static str {
        match self {
            Sysname::Linux => "__errno_location",
            Sysname::Darwin | Sysname::Unknown => "__error",
        }
    }

    /// `RTLD_DEFAULT` pseudo-handle for global `dlsym` lookups.
    pub fn rtld_default(&self) -> u64 {
        match self {
            Sysname::Linux => 0,
            Sysname::Darwin | Sysname::Unknown => (-2i64) as u64,
        }
    }
}

/// Remote CPU architecture as encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Unknown,
    Arm64,
}

impl Arch {
    /// Decode the handshake `arch` field. Unrecognized values are `Unknown`.
    pub fn from_wire(v: u32) -> Self {
        match v {
            1 => Arch::Arm64,
            _ => Arch::Unknown,
        }
    }

    /// Encode for the handshake `arch` field.
    pub fn to_wire(self) -> u32 {
        match self {
            Arch::Unknown => 0,
            Arch::Arm64 => 1,
        }
    }
}

/// Identity of the target platform, surfaced from the handshake.
///
/// Higher layers use this to pick a platform-specific client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    /// Raw `uname().sysname`.
    pub sysname_raw: String,
    /// Raw `uname().machine`.
    pub machine: String,
    /// Parsed OS family.
    pub sysname: Sysname,
    /// Parsed architecture.
    pub arch: Arch,
    /// Platform hint (generation C only, e.g. "ios").
    pub platform: Option<String>,
}

impl PlatformInfo {
    /// Placeholder identity for generation A, which has no handshake.
    pub fn unknown() -> Self {
        Self {
            sysname_raw: String::new(),
            machine: String::new(),
            sysname: Sysname::Unknown,
            arch: Arch::Unknown,
            platform: None,
        }
    }

    /// Build from raw handshake fields.
    pub fn from_fields(sysname: &str, machine: &str, arch: u32, platform: Option<String>) -> Self {
        Self {
            sysname_raw: sysname.to_string(),
            machine: machine.to_string(),
            sysname: Sysname::parse(sysname),
            arch: Arch::from_wire(arch),
            platform,
        }
    }
}

/// Generation B handshake record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHandshake {
    pub magic: u32,
    pub arch: u32,
    pub sysname: String,
    pub machine: String,
}

impl LegacyHandshake {
    /// Decode a handshake record. Does not validate the magic.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != HANDSHAKE_SIZE {
            return Err(RpcError::Protocol(format!(
                "handshake must be {} bytes, got {}",
                HANDSHAKE_SIZE,
                buf.len()
            )));
        }
        let mut r = WireReader::new(buf);
        Ok(Self {
            magic: r.get_u32()?,
            arch: r.get_u32()?,
            sysname: r.get_padded_str(UNAME_FIELD_LEN)?,
            machine: r.get_padded_str(UNAME_FIELD_LEN)?,
        })
    }

    /// Encode a handshake record (used by test agents).
    pub fn encode(&self) -> Result<Bytes> {
        let mut w = WireWriter::with_capacity(HANDSHAKE_SIZE);
        w.put_u32(self.magic);
        w.put_u32(self.arch);
        w.put_padded_str(&self.sysname, UNAME_FIELD_LEN)?;
        w.put_padded_str(&self.machine, UNAME_FIELD_LEN)?;
        Ok(w.freeze())
    }

    /// Check the magic against the expected server protocol version.
    pub fn validate(&self, expected: u32) -> Result<()> {
        validate_server_magic(expected, self.magic)
    }

    /// Platform identity carried by this handshake.
    pub fn platform(&self) -> PlatformInfo {
        PlatformInfo::from_fields(&self.sysname, &self.machine, self.arch, None)
    }
}

/// Reject a handshake whose magic is not the expected version constant.
pub fn validate_server_magic(expected: u32, actual: u32) -> Result<()> {
    if actual != expected {
        return Err(RpcError::InvalidServerVersionMagic { expected, actual });
    }
    Ok(())
}
