//! Exec chunk stream.
//!
//! After a foreground spawn, the agent streams the process output as chunks:
//!
//! ```text
//! ┌────────────┬──────────┬─────────────────┐
//! │ chunk_type │ size     │ payload[size]   │
//! │ u32 LE     │ u32 LE   │                 │
//! └────────────┴──────────┴─────────────────┘
//! ```
//!
//! `STDOUT` payloads are process output; `ERRORCODE` carries the exit status
//! as an `i32` and ends the stream.
//!
//! [`ChunkBuffer`] accumulates socket reads of arbitrary size and yields
//! whole chunks in arrival order:
//! - `WaitingForHeader`: need 8 bytes
//! - `WaitingForPayload`: header parsed, need `size` more bytes

use bytes::{Bytes, BytesMut};

use crate::error::{RpcError, Result};

/// Chunk header size.
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Largest chunk payload accepted by default.
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Chunk discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChunkType {
    Stdout = 0,
    ErrorCode = 1,
}

impl TryFrom<u32> for ChunkType {
    type Error = RpcError;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            0 => Ok(ChunkType::Stdout),
            1 => Ok(ChunkType::ErrorCode),
            other => Err(RpcError::Protocol(format!("unknown chunk type {other}"))),
        }
    }
}

/// Decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: ChunkType,
    pub size: u32,
}

impl ChunkHeader {
    pub fn new(chunk_type: ChunkType, size: u32) -> Self {
        Self { chunk_type, size }
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut out = [0u8; CHUNK_HEADER_SIZE];
        out[..4].copy_from_slice(&(self.chunk_type as u32).to_le_bytes());
        out[4..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Decode from exactly [`CHUNK_HEADER_SIZE`] bytes.
    pub fn decode(buf: &[u8; CHUNK_HEADER_SIZE]) -> Result<Self> {
        let raw_type = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Self {
            chunk_type: ChunkType::try_from(raw_type)?,
            size,
        })
    }
}

/// A complete chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Stdout(Bytes),
    ExitCode(i32),
}

impl Chunk {
    /// Encode a full chunk (header and payload).
    pub fn encode(&self) -> Vec<u8> {
        let (chunk_type, payload): (ChunkType, &[u8]) = match self {
            Chunk::Stdout(data) => (ChunkType::Stdout, data),
            Chunk::ExitCode(code) => {
                let mut out = ChunkHeader::new(ChunkType::ErrorCode, 4).encode().to_vec();
                out.extend_from_slice(&code.to_le_bytes());
                return out;
            }
        };
        let mut out = ChunkHeader::new(chunk_type, payload.len() as u32)
            .encode()
            .to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn from_parts(header: ChunkHeader, payload: Bytes) -> Result<Self> {
        match header.chunk_type {
            ChunkType::Stdout => Ok(Chunk::Stdout(payload)),
            ChunkType::ErrorCode => {
                let raw: [u8; 4] = payload.as_ref().try_into().map_err(|_| {
                    RpcError::Protocol(format!(
                        "exit code chunk must be 4 bytes, got {}",
                        payload.len()
                    ))
                })?;
                Ok(Chunk::ExitCode(i32::from_le_bytes(raw)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: ChunkHeader },
}

/// Accumulates partial reads and extracts complete chunks.
pub struct ChunkBuffer {
    buffer: BytesMut,
    state: State,
    max_chunk_size: u32,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::with_max_chunk(DEFAULT_MAX_CHUNK_SIZE)
    }

    pub fn with_max_chunk(max_chunk_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForHeader,
            max_chunk_size,
        }
    }

    /// Append socket data and return every chunk it completes.
    ///
    /// # Errors
    ///
    /// Unknown chunk types, oversized chunks and malformed exit codes.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Chunk>> {
        self.buffer.extend_from_slice(data);

        let mut chunks = Vec::new();
        while let Some(chunk) = self.try_extract_one()? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    fn try_extract_one(&mut self) -> Result<Option<Chunk>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < CHUNK_HEADER_SIZE {
                        return Ok(None);
                    }
                    let mut raw = [0u8; CHUNK_HEADER_SIZE];
                    raw.copy_from_slice(&self.buffer[..CHUNK_HEADER_SIZE]);
                    let header = ChunkHeader::decode(&raw)?;

                    if header.size > self.max_chunk_size {
                        return Err(RpcError::Protocol(format!(
                            "chunk size {} exceeds maximum {}",
                            header.size, self.max_chunk_size
                        )));
                    }

                    let _ = self.buffer.split_to(CHUNK_HEADER_SIZE);
                    self.state = State::WaitingForPayload { header };
                }
                State::WaitingForPayload { header } => {
                    let size = header.size as usize;
                    if self.buffer.len() < size {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(size).freeze();
                    self.state = State::WaitingForHeader;
                    return Chunk::from_parts(header, payload).map(Some);
                }
            }
        }
    }

    /// Bytes buffered but not yet part of a complete chunk.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout(data: &'static [u8]) -> Chunk {
        Chunk::Stdout(Bytes::from_static(data))
    }

    #[test]
    fn test_interleaved_chunks_in_order() {
        let mut stream = Vec::new();
        stream.extend(stdout(b"hello ").encode());
        stream.extend(stdout(b"world\n").encode());
        stream.extend(Chunk::ExitCode(-3).encode());

        let mut buffer = ChunkBuffer::new();
        let chunks = buffer.push(&stream).unwrap();
        assert_eq!(
            chunks,
            vec![stdout(b"hello "), stdout(b"world\n"), Chunk::ExitCode(-3)]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header_and_payload() {
        let bytes = stdout(b"abcdef").encode();
        let mut buffer = ChunkBuffer::new();

        assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        assert!(buffer.push(&bytes[3..10]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        let chunks = buffer.push(&bytes[10..]).unwrap();
        assert_eq!(chunks, vec![stdout(b"abcdef")]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut bytes = stdout(b"hi").encode();
        bytes.extend(Chunk::ExitCode(0).encode());

        let mut buffer = ChunkBuffer::new();
        let mut all = Vec::new();
        for b in &bytes {
            all.extend(buffer.push(&[*b]).unwrap());
        }
        assert_eq!(all, vec![stdout(b"hi"), Chunk::ExitCode(0)]);
    }

    #[test]
    fn test_empty_stdout_chunk() {
        let mut buffer = ChunkBuffer::new();
        let chunks = buffer.push(&stdout(b"").encode()).unwrap();
        assert_eq!(chunks, vec![stdout(b"")]);
    }

    #[test]
    fn test_unknown_chunk_type_rejected() {
        let mut raw = ChunkHeader::new(ChunkType::Stdout, 0).encode();
        raw[0] = 2;
        let err = ChunkBuffer::new().push(&raw).unwrap_err();
        assert!(err.to_string().contains("unknown chunk type 2"));
    }

    #[test]
    fn test_bad_exit_code_size_rejected() {
        let mut raw = ChunkHeader::new(ChunkType::ErrorCode, 2).encode().to_vec();
        raw.extend_from_slice(&[0, 0]);
        assert!(ChunkBuffer::new().push(&raw).is_err());
    }

    #[test]
    fn test_max_chunk_size() {
        let raw = ChunkHeader::new(ChunkType::Stdout, 1000).encode();
        let err = ChunkBuffer::with_max_chunk(100).push(&raw).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }
}
