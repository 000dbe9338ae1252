//! Fixed-layout binary encoding matching the agent's C structs.
//!
//! All integers are little-endian. Two string encodings are supported:
//!
//! ```text
//! PaddedString[N]     N bytes, NUL-padded, split on first NUL when decoding
//! PascalString        len:u32 LE | bytes[len]
//! PrefixedArray       count:u32 LE | count × PascalString
//! ```
//!
//! Variable-length payloads are always preceded by an explicit size field;
//! the reader never infers a length from the remaining buffer.
//!
//! # Example
//!
//! ```
//! use rpcwire_client::codec::{WireReader, WireWriter};
//!
//! let mut w = WireWriter::new();
//! w.put_u32(0x12345678);
//! w.put_padded_str("/bin/ls", 16).unwrap();
//! let bytes = w.freeze();
//!
//! let mut r = WireReader::new(&bytes);
//! assert_eq!(r.get_u32().unwrap(), 0x12345678);
//! assert_eq!(r.get_padded_str(16).unwrap(), "/bin/ls");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{RpcError, Result};

/// Append-only encoder for wire structs.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    /// Create a writer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    #[inline]
    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    /// Big-endian u16, for BSD socket fields such as `sin_port`.
    #[inline]
    pub fn put_u16_be(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    #[inline]
    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    #[inline]
    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    #[inline]
    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    #[inline]
    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    #[inline]
    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Raw bytes, no length prefix.
    #[inline]
    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Zero bytes for struct padding.
    #[inline]
    pub fn put_padding(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    /// `size:u64 | data[size]`.
    pub fn put_sized_bytes(&mut self, data: &[u8]) {
        self.put_u64(data.len() as u64);
        self.put_bytes(data);
    }

    /// Fixed-width NUL-padded string.
    ///
    /// A string of exactly `width` bytes is written without a terminator.
    /// Strings with interior NULs or longer than `width` are rejected.
    pub fn put_padded_str(&mut self, s: &str, width: usize) -> Result<()> {
        let bytes = s.as_bytes();
        if bytes.len() > width {
            return Err(RpcError::Argument(format!(
                "string of {} bytes does not fit a {}-byte field",
                bytes.len(),
                width
            )));
        }
        if bytes.contains(&0) {
            return Err(RpcError::Argument(
                "string contains an interior NUL byte".to_string(),
            ));
        }
        self.put_bytes(bytes);
        self.put_padding(width - bytes.len());
        Ok(())
    }

    /// `len:u32 | bytes[len]`.
    pub fn put_pascal_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.put_bytes(s.as_bytes());
    }

    /// `count:u32 | count × PascalString`.
    pub fn put_prefixed_array<S: AsRef<str>>(&mut self, items: &[S]) {
        self.put_u32(items.len() as u32);
        for item in items {
            self.put_pascal_str(item.as_ref());
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and return the encoded bytes (zero-copy).
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor-based decoder for wire structs.
///
/// Every getter fails with a protocol error on truncated input instead of
/// reading past the end.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Create a reader at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                RpcError::Protocol(format!(
                    "truncated message: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn get_u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Borrow exactly `n` raw bytes.
    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Skip struct padding.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// `size:u64 | data[size]`.
    pub fn get_sized_bytes(&mut self) -> Result<&'a [u8]> {
        let size = self.get_u64()?;
        let size = usize::try_from(size)
            .map_err(|_| RpcError::Protocol(format!("size field {size} overflows usize")))?;
        self.take(size)
    }

    /// Fixed-width NUL-padded string, truncated at the first NUL.
    pub fn get_padded_str(&mut self, width: usize) -> Result<String> {
        let raw = self.take(width)?;
        Ok(nul_terminated_lossy(raw))
    }

    /// `len:u32 | bytes[len]`.
    pub fn get_pascal_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let raw = self.take(len)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// `count:u32 | count × PascalString`.
    pub fn get_prefixed_array(&mut self) -> Result<Vec<String>> {
        let count = self.get_u32()? as usize;
        // Each element needs at least its 4-byte length prefix.
        if count > self.remaining() / 4 {
            return Err(RpcError::Protocol(format!(
                "array count {count} exceeds remaining input"
            )));
        }
        (0..count).map(|_| self.get_pascal_str()).collect()
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Current offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Decode a C string buffer: split on the first NUL, lossy UTF-8.
pub fn nul_terminated_lossy(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
