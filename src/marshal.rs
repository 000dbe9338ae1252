//! Remote call argument marshaling and return decoding.
//!
//! Integers, booleans and symbols pass through as 64-bit words. Strings and
//! byte buffers never travel inline: each is copied into a fresh remote
//! `malloc` block (strings NUL-terminated) and the block address is passed
//! instead. Every such temporary is freed exactly once after the call,
//! whether it succeeded or not.
//!
//! Floating-point arguments are tagged
//! [`ArgKind::Double`](crate::protocol::tagged::ArgKind::Double) so the agent
//! loads them into FP registers.

use bytes::Bytes;

use crate::backend::CallReturn;
use crate::error::{RpcError, Result};
use crate::protocol::tagged::TaggedArg;
use crate::symbol::Symbol;

/// One argument of a remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(u64),
    Double(f64),
    Bool(bool),
    /// Copied to remote memory with a trailing NUL.
    Str(String),
    /// Copied to remote memory as-is.
    Bytes(Bytes),
}

macro_rules! arg_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Arg {
            fn from(v: $t) -> Self {
                // Sign extension keeps negative values two's complement.
                Arg::Int(v as i64 as u64)
            }
        })*
    };
}

arg_from_int!(i8, i16, i32, i64, isize, u8, u16, u32);

impl From<u64> for Arg {
    fn from(v: u64) -> Self {
        Arg::Int(v)
    }
}

impl From<usize> for Arg {
    fn from(v: usize) -> Self {
        Arg::Int(v as u64)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Double(v)
    }
}

impl From<f32> for Arg {
    fn from(v: f32) -> Self {
        Arg::Double(f64::from(v))
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

impl From<&[u8]> for Arg {
    fn from(v: &[u8]) -> Self {
        Arg::Bytes(Bytes::copy_from_slice(v))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Arg::Bytes(Bytes::from(v))
    }
}

impl From<Bytes> for Arg {
    fn from(v: Bytes) -> Self {
        Arg::Bytes(v)
    }
}

impl From<&Symbol> for Arg {
    fn from(v: &Symbol) -> Self {
        Arg::Int(v.address())
    }
}

impl From<Symbol> for Arg {
    fn from(v: Symbol) -> Self {
        Arg::Int(v.address())
    }
}

/// Build an argument list from mixed values.
///
/// ```
/// use rpcwire_client::args;
/// let argv = args!["/tmp/log", 0x601, 0o644];
/// assert_eq!(argv.len(), 3);
/// ```
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::marshal::Arg::from($arg)),*]
    };
}

impl Arg {
    /// Bytes to place in remote memory, if this argument needs a block.
    pub fn materialize(&self) -> Option<Bytes> {
        match self {
            Arg::Str(s) => {
                let mut buf = Vec::with_capacity(s.len() + 1);
                buf.extend_from_slice(s.as_bytes());
                buf.push(0);
                Some(Bytes::from(buf))
            }
            Arg::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }

    /// Wire form of an argument that travels inline.
    ///
    /// Returns `None` for arguments that must be materialized first.
    pub fn inline(&self) -> Option<TaggedArg> {
        match self {
            Arg::Int(v) => Some(TaggedArg::integer(*v)),
            Arg::Bool(b) => Some(TaggedArg::integer(u64::from(*b))),
            Arg::Double(d) => Some(TaggedArg::double(*d)),
            Arg::Str(_) | Arg::Bytes(_) => None,
        }
    }
}

/// How to interpret a call's return registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnKind {
    /// Integer or pointer in `x0`.
    #[default]
    Word,
    /// Half-precision float in `d0`.
    F16,
    /// Single-precision float in `d0`.
    F32,
    /// Double-precision float in `d0`.
    F64,
}

/// Decoded return value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReturnValue {
    Word(u64),
    Float(f64),
}

impl ReturnValue {
    pub fn as_word(&self) -> Result<u64> {
        match self {
            ReturnValue::Word(v) => Ok(*v),
            ReturnValue::Float(_) => Err(RpcError::Argument(
                "return value is a float, not a word".to_string(),
            )),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            ReturnValue::Float(v) => Ok(*v),
            ReturnValue::Word(_) => Err(RpcError::Argument(
                "return value is a word, not a float".to_string(),
            )),
        }
    }
}

/// Select and decode the return value from a raw call result.
///
/// Without a register snapshot, the single returned word is reinterpreted
/// as the requested float width.
pub fn decode_return(ret: CallReturn, kind: ReturnKind) -> ReturnValue {
    let (x0, d0) = match ret {
        CallReturn::Registers(regs) => (regs.x[0], regs.d[0]),
        CallReturn::Word(v) => (v, v),
    };
    match kind {
        ReturnKind::Word => ReturnValue::Word(x0),
        ReturnKind::F64 => ReturnValue::Float(f64::from_bits(d0)),
        ReturnKind::F32 => ReturnValue::Float(f64::from(f32::from_bits(d0 as u32))),
        ReturnKind::F16 => ReturnValue::Float(f64::from(f16_bits_to_f32(d0 as u16))),
    }
}

/// IEEE 754 binary16 to binary32.
pub fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = u32::from((bits >> 10) & 0x1f);
    let mant = u32::from(bits & 0x3ff);

    let out = match (exp, mant) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: normalize into an f32 exponent.
            let mut e: i32 = -14;
            let mut m = mant;
            while m & 0x400 == 0 {
                m <<= 1;
                e -= 1;
            }
            sign | (((e + 127) as u32) << 23) | ((m & 0x3ff) << 13)
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, _) => sign | 0x7fc0_0000 | (mant << 13),
        _ => sign | ((exp + 127 - 15) << 23) | (mant << 13),
    };
    f32::from_bits(out)
}
