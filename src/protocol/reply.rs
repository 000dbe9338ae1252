//! Reply shapes shared by the fixed-layout generations (A and B).
//!
//! Generations A and B have no generic reply envelope: the layout of each
//! reply is implied by the command that was sent. Every encoded request
//! therefore carries a [`ReplyShape`] telling the channel how many bytes to
//! read and how to decode them.

use bytes::Bytes;

use super::structs::DirEntry;

/// Number of integer and FP registers in an ARM64 call reply.
pub const ARM64_REGISTER_COUNT: usize = 8;

/// How to read the reply for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// No reply is sent.
    None,
    /// `u32` (exec pid).
    U32,
    /// `i64` result, negative values are `-errno`.
    I64,
    /// `u64` (addresses, handles).
    U64,
    /// Exactly `n` raw bytes.
    Raw(usize),
    /// `result:i64` followed by `result` bytes when positive.
    CountedData,
    /// `magic:u32 | cmd_type:u32` status header, followed by `size` bytes
    /// when the status is not an error.
    Status { size: usize },
    /// ARM64 register snapshot `x[8]:u64 | d[8]:f64`.
    Registers,
    /// `len:u64 | utf8[len]`.
    SizedText,
    /// Status header then a stream of directory entries.
    DirEntries,
}

impl ReplyShape {
    /// Fixed byte size of the reply, when it has one.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ReplyShape::None => Some(0),
            ReplyShape::U32 => Some(4),
            ReplyShape::I64 | ReplyShape::U64 => Some(8),
            ReplyShape::Raw(n) => Some(*n),
            ReplyShape::Registers => Some(ARM64_REGISTER_COUNT * 16),
            ReplyShape::CountedData
            | ReplyShape::Status { .. }
            | ReplyShape::SizedText
            | ReplyShape::DirEntries => None,
        }
    }
}

/// ARM64 return-register snapshot.
///
/// `d` holds raw register bits so callers can reinterpret `d0` as a
/// half, single or double precision value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterFile {
    pub x: [u64; ARM64_REGISTER_COUNT],
    pub d: [u64; ARM64_REGISTER_COUNT],
}

/// Decoded reply for generations A and B.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    None,
    U32(u32),
    I64(i64),
    U64(u64),
    Data(Bytes),
    Registers(RegisterFile),
    Text(String),
    Entries(Vec<DirEntry>),
    /// The agent answered with its error status (generation B).
    Error,
}

impl Reply {
    fn kind(&self) -> &'static str {
        match self {
            Reply::None => "none",
            Reply::U32(_) => "u32",
            Reply::I64(_) => "i64",
            Reply::U64(_) => "u64",
            Reply::Data(_) => "data",
            Reply::Registers(_) => "registers",
            Reply::Text(_) => "text",
            Reply::Entries(_) => "entries",
            Reply::Error => "error",
        }
    }

    fn mismatch(&self, wanted: &str) -> crate::error::RpcError {
        crate::error::RpcError::Protocol(format!(
            "expected {} reply, got {}",
            wanted,
            self.kind()
        ))
    }

    pub fn into_u32(self) -> crate::error::Result<u32> {
        match self {
            Reply::U32(v) => Ok(v),
            other => Err(other.mismatch("u32")),
        }
    }

    pub fn into_i64(self) -> crate::error::Result<i64> {
        match self {
            Reply::I64(v) => Ok(v),
            other => Err(other.mismatch("i64")),
        }
    }

    pub fn into_u64(self) -> crate::error::Result<u64> {
        match self {
            Reply::U64(v) => Ok(v),
            other => Err(other.mismatch("u64")),
        }
    }

    pub fn into_data(self) -> crate::error::Result<Bytes> {
        match self {
            Reply::Data(v) => Ok(v),
            other => Err(other.mismatch("data")),
        }
    }

    pub fn into_text(self) -> crate::error::Result<String> {
        match self {
            Reply::Text(v) => Ok(v),
            other => Err(other.mismatch("text")),
        }
    }

    pub fn into_entries(self) -> crate::error::Result<Vec<DirEntry>> {
        match self {
            Reply::Entries(v) => Ok(v),
            other => Err(other.mismatch("entries")),
        }
    }
}

/// An encoded command plus the shape of its reply.
#[derive(Debug, Clone)]
pub struct Request {
    /// Complete message bytes, header included.
    pub bytes: Bytes,
    /// How to read the reply.
    pub shape: ReplyShape,
}

impl Request {
    pub fn new(bytes: Bytes, shape: ReplyShape) -> Self {
        Self { bytes, shape }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(ReplyShape::U32.fixed_size(), Some(4));
        assert_eq!(ReplyShape::Registers.fixed_size(), Some(128));
        assert_eq!(ReplyShape::Raw(16).fixed_size(), Some(16));
        assert_eq!(ReplyShape::CountedData.fixed_size(), None);
    }

    #[test]
    fn test_reply_accessors() {
        assert_eq!(Reply::U64(7).into_u64().unwrap(), 7);
        let err = Reply::I64(-1).into_u64().unwrap_err();
        assert!(err.to_string().contains("expected u64 reply, got i64"));
    }
}
