//! Generation A wire format.
//!
//! Every message starts with a fixed header:
//!
//! ```text
//! ┌──────────┬──────────┬───────────────────────┐
//! │ magic    │ cmd_type │ payload (per cmd_type) │
//! │ u32 LE   │ u32 LE   │                        │
//! └──────────┴──────────┴───────────────────────┘
//! ```
//!
//! In the ephemeral-reply variant a `reply_port:u32` follows `cmd_type`.
//! Replies are raw fixed-size values whose layout depends on the command.

use bytes::Bytes;

use super::reply::{ReplyShape, Request};
use super::{MAGIC, MAX_PATH_LEN, SYMBOL_NAME_LEN};
use crate::codec::{WireReader, WireWriter};
use crate::error::{RpcError, Result};

/// Generation A command discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LegacyCmdType {
    Exec = 0,
    Open = 1,
    Close = 2,
    Write = 3,
    Read = 4,
    Remove = 5,
    Mkdir = 6,
    Chmod = 7,
    Dlopen = 8,
    Dlclose = 9,
    Dlsym = 10,
    Call = 11,
    Peek = 12,
    Poke = 13,
}

impl TryFrom<u32> for LegacyCmdType {
    type Error = RpcError;

    fn try_from(v: u32) -> Result<Self> {
        use LegacyCmdType::*;
        Ok(match v {
            0 => Exec,
            1 => Open,
            2 => Close,
            3 => Write,
            4 => Read,
            5 => Remove,
            6 => Mkdir,
            7 => Chmod,
            8 => Dlopen,
            9 => Dlclose,
            10 => Dlsym,
            11 => Call,
            12 => Peek,
            13 => Poke,
            other => return Err(RpcError::UnknownCommand(other)),
        })
    }
}

/// A generation A command.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyCommand {
    Exec { argv: Vec<String> },
    Open { filename: String, mode: i32 },
    Close { fd: i32 },
    Write { fd: i32, data: Bytes },
    Read { fd: i32, size: u64 },
    Remove { filename: String },
    Mkdir { filename: String, mode: u32 },
    Chmod { filename: String, mode: u32 },
    Dlopen { filename: String, mode: i32 },
    Dlclose { lib: u64 },
    Dlsym { lib: u64, symbol_name: String },
    Call { address: u64, argv: Vec<u64> },
    Peek { address: u64, size: u64 },
    Poke { address: u64, data: Bytes },
}

impl LegacyCommand {
    /// Discriminant for this command.
    pub fn cmd_type(&self) -> LegacyCmdType {
        match self {
            LegacyCommand::Exec { .. } => LegacyCmdType::Exec,
            LegacyCommand::Open { .. } => LegacyCmdType::Open,
            LegacyCommand::Close { .. } => LegacyCmdType::Close,
            LegacyCommand::Write { .. } => LegacyCmdType::Write,
            LegacyCommand::Read { .. } => LegacyCmdType::Read,
            LegacyCommand::Remove { .. } => LegacyCmdType::Remove,
            LegacyCommand::Mkdir { .. } => LegacyCmdType::Mkdir,
            LegacyCommand::Chmod { .. } => LegacyCmdType::Chmod,
            LegacyCommand::Dlopen { .. } => LegacyCmdType::Dlopen,
            LegacyCommand::Dlclose { .. } => LegacyCmdType::Dlclose,
            LegacyCommand::Dlsym { .. } => LegacyCmdType::Dlsym,
            LegacyCommand::Call { .. } => LegacyCmdType::Call,
            LegacyCommand::Peek { .. } => LegacyCmdType::Peek,
            LegacyCommand::Poke { .. } => LegacyCmdType::Poke,
        }
    }

    /// Layout of the agent's reply to this command.
    pub fn reply_shape(&self) -> ReplyShape {
        match self {
            LegacyCommand::Exec { .. } => ReplyShape::U32,
            LegacyCommand::Dlopen { .. } | LegacyCommand::Dlsym { .. } => ReplyShape::U64,
            LegacyCommand::Call { .. } => ReplyShape::U64,
            LegacyCommand::Read { .. } => ReplyShape::CountedData,
            LegacyCommand::Peek { size, .. } => ReplyShape::Raw(*size as usize),
            LegacyCommand::Open { .. }
            | LegacyCommand::Close { .. }
            | LegacyCommand::Write { .. }
            | LegacyCommand::Remove { .. }
            | LegacyCommand::Mkdir { .. }
            | LegacyCommand::Chmod { .. }
            | LegacyCommand::Dlclose { .. }
            | LegacyCommand::Poke { .. } => ReplyShape::I64,
        }
    }

    /// Encode the full message. `reply_port` selects the ephemeral-reply
    /// header variant.
    pub fn encode(&self, reply_port: Option<u16>) -> Result<Bytes> {
        let mut w = WireWriter::with_capacity(64);
        w.put_u32(MAGIC);
        w.put_u32(self.cmd_type() as u32);
        if let Some(port) = reply_port {
            w.put_u32(u32::from(port));
        }

        match self {
            LegacyCommand::Exec { argv } => w.put_prefixed_array(argv),
            LegacyCommand::Open { filename, mode } | LegacyCommand::Dlopen { filename, mode } => {
                w.put_padded_str(filename, MAX_PATH_LEN)?;
                w.put_i32(*mode);
            }
            LegacyCommand::Close { fd } => w.put_i32(*fd),
            LegacyCommand::Write { fd, data } => {
                w.put_i32(*fd);
                w.put_sized_bytes(data);
            }
            LegacyCommand::Read { fd, size } => {
                w.put_i32(*fd);
                w.put_u64(*size);
            }
            LegacyCommand::Remove { filename } => w.put_padded_str(filename, MAX_PATH_LEN)?,
            LegacyCommand::Mkdir { filename, mode } | LegacyCommand::Chmod { filename, mode } => {
                w.put_padded_str(filename, MAX_PATH_LEN)?;
                w.put_u32(*mode);
            }
            LegacyCommand::Dlclose { lib } => w.put_u64(*lib),
            LegacyCommand::Dlsym { lib, symbol_name } => {
                w.put_u64(*lib);
                w.put_padded_str(symbol_name, SYMBOL_NAME_LEN)?;
            }
            LegacyCommand::Call { address, argv } => {
                w.put_u64(*address);
                w.put_u64(argv.len() as u64);
                for arg in argv {
                    w.put_u64(*arg);
                }
            }
            LegacyCommand::Peek { address, size } => {
                w.put_u64(*address);
                w.put_u64(*size);
            }
            LegacyCommand::Poke { address, data } => {
                w.put_u64(*address);
                w.put_sized_bytes(data);
            }
        }

        Ok(w.freeze())
    }

    /// Encode into a [`Request`] carrying the reply shape.
    pub fn to_request(&self, reply_port: Option<u16>) -> Result<Request> {
        Ok(Request::new(self.encode(reply_port)?, self.reply_shape()))
    }

    /// Decode a full message. Returns the command and the reply port when
    /// `with_reply_port` is set.
    ///
    /// Fails fast on a bad magic or an unknown discriminant.
    pub fn decode(buf: &[u8], with_reply_port: bool) -> Result<(Self, Option<u16>)> {
        let mut r = WireReader::new(buf);
        let magic = r.get_u32()?;
        if magic != MAGIC {
            return Err(RpcError::InvalidMagic {
                expected: MAGIC,
                actual: magic,
            });
        }
        let cmd_type = LegacyCmdType::try_from(r.get_u32()?)?;
        let reply_port = if with_reply_port {
            let port = r.get_u32()?;
            Some(u16::try_from(port).map_err(|_| {
                RpcError::Protocol(format!("reply port {port} out of range"))
            })?)
        } else {
            None
        };

        let cmd = match cmd_type {
            LegacyCmdType::Exec => LegacyCommand::Exec {
                argv: r.get_prefixed_array()?,
            },
            LegacyCmdType::Open => LegacyCommand::Open {
                filename: r.get_padded_str(MAX_PATH_LEN)?,
                mode: r.get_i32()?,
            },
            LegacyCmdType::Close => LegacyCommand::Close { fd: r.get_i32()? },
            LegacyCmdType::Write => LegacyCommand::Write {
                fd: r.get_i32()?,
                data: Bytes::copy_from_slice(r.get_sized_bytes()?),
            },
            LegacyCmdType::Read => LegacyCommand::Read {
                fd: r.get_i32()?,
                size: r.get_u64()?,
            },
            LegacyCmdType::Remove => LegacyCommand::Remove {
                filename: r.get_padded_str(MAX_PATH_LEN)?,
            },
            LegacyCmdType::Mkdir => LegacyCommand::Mkdir {
                filename: r.get_padded_str(MAX_PATH_LEN)?,
                mode: r.get_u32()?,
            },
            LegacyCmdType::Chmod => LegacyCommand::Chmod {
                filename: r.get_padded_str(MAX_PATH_LEN)?,
                mode: r.get_u32()?,
            },
            LegacyCmdType::Dlopen => LegacyCommand::Dlopen {
                filename: r.get_padded_str(MAX_PATH_LEN)?,
                mode: r.get_i32()?,
            },
            LegacyCmdType::Dlclose => LegacyCommand::Dlclose { lib: r.get_u64()? },
            LegacyCmdType::Dlsym => LegacyCommand::Dlsym {
                lib: r.get_u64()?,
                symbol_name: r.get_padded_str(SYMBOL_NAME_LEN)?,
            },
            LegacyCmdType::Call => {
                let address = r.get_u64()?;
                let argc = r.get_u64()?;
                if argc > (r.remaining() / 8) as u64 {
                    return Err(RpcError::Protocol(format!(
                        "argc {argc} exceeds remaining input"
                    )));
                }
                let argv = (0..argc).map(|_| r.get_u64()).collect::<Result<_>>()?;
                LegacyCommand::Call { address, argv }
            }
            LegacyCmdType::Peek => LegacyCommand::Peek {
                address: r.get_u64()?,
                size: r.get_u64()?,
            },
            LegacyCmdType::Poke => LegacyCommand::Poke {
                address: r.get_u64()?,
                data: Bytes::copy_from_slice(r.get_sized_bytes()?),
            },
        };

        Ok((cmd, reply_port))
    }
}

/// Size of the fixed part of a generation A message for `cmd_type`, header
/// included. Variable-length commands return the size up to and including
/// their length field; fake agents read the rest from that field.
pub fn fixed_prefix_len(cmd_type: LegacyCmdType, with_reply_port: bool) -> usize {
    let header = if with_reply_port { 12 } else { 8 };
    header
        + match cmd_type {
            LegacyCmdType::Exec => 4,
            LegacyCmdType::Open | LegacyCmdType::Dlopen => MAX_PATH_LEN + 4,
            LegacyCmdType::Close => 4,
            LegacyCmdType::Write => 4 + 8,
            LegacyCmdType::Read => 4 + 8,
            LegacyCmdType::Remove => MAX_PATH_LEN,
            LegacyCmdType::Mkdir | LegacyCmdType::Chmod => MAX_PATH_LEN + 4,
            LegacyCmdType::Dlclose => 8,
            LegacyCmdType::Dlsym => 8 + SYMBOL_NAME_LEN,
            LegacyCmdType::Call => 16,
            LegacyCmdType::Peek => 16,
            LegacyCmdType::Poke => 16,
        }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_exact_layout() {
        let cmd = LegacyCommand::Peek {
            address: 0x1000,
            size: 16,
        };
        let bytes = cmd.encode(None).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"\x78\x56\x34\x12");
        expected.extend_from_slice(b"\x0c\x00\x00\x00");
        expected.extend_from_slice(b"\x00\x10\x00\x00\x00\x00\x00\x00");
        expected.extend_from_slice(b"\x10\x00\x00\x00\x00\x00\x00\x00");
        assert_eq!(&bytes[..], &expected[..]);
        assert_eq!(cmd.reply_shape(), ReplyShape::Raw(16));
    }

    #[test]
    fn test_cmd_type_indices() {
        assert_eq!(LegacyCmdType::Exec as u32, 0);
        assert_eq!(LegacyCmdType::Call as u32, 11);
        assert_eq!(LegacyCmdType::Peek as u32, 12);
        assert_eq!(LegacyCmdType::Poke as u32, 13);
    }

    #[test]
    fn test_roundtrip_representative_commands() {
        let long_name = "x".repeat(MAX_PATH_LEN);
        let commands = vec![
            LegacyCommand::Exec {
                argv: vec!["/bin/sh".into(), "-c".into(), "echo hi".into()],
            },
            LegacyCommand::Exec { argv: vec![] },
            LegacyCommand::Open {
                filename: long_name,
                mode: 0x601,
            },
            LegacyCommand::Write {
                fd: 3,
                data: Bytes::from_static(b"payload"),
            },
            LegacyCommand::Dlsym {
                lib: 0xffff_ffff_ffff_fffe,
                symbol_name: "malloc".into(),
            },
            LegacyCommand::Call {
                address: 0x1_8000_0000,
                argv: vec![1, 2, 3],
            },
            LegacyCommand::Poke {
                address: 0x4000,
                data: Bytes::new(),
            },
        ];

        for cmd in commands {
            let bytes = cmd.encode(None).unwrap();
            let (decoded, port) = LegacyCommand::decode(&bytes, false).unwrap();
            assert_eq!(decoded, cmd);
            assert_eq!(port, None);
        }
    }

    #[test]
    fn test_reply_port_header_variant() {
        let cmd = LegacyCommand::Close { fd: 7 };
        let bytes = cmd.encode(Some(40000)).unwrap();
        assert_eq!(&bytes[8..12], &40000u32.to_le_bytes());

        let (decoded, port) = LegacyCommand::decode(&bytes, true).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(port, Some(40000));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = LegacyCommand::Close { fd: 1 }.encode(None).unwrap().to_vec();
        bytes[0] = 0;
        let err = LegacyCommand::decode(&bytes, false).unwrap_err();
        assert!(matches!(err, RpcError::InvalidMagic { .. }));
    }

    #[test]
    fn test_decode_rejects_unknown_cmd_type() {
        let mut bytes = LegacyCommand::Close { fd: 1 }.encode(None).unwrap().to_vec();
        bytes[4] = 99;
        let err = LegacyCommand::decode(&bytes, false).unwrap_err();
        assert!(matches!(err, RpcError::UnknownCommand(99)));
    }

    #[test]
    fn test_filename_too_long_is_argument_error() {
        let cmd = LegacyCommand::Remove {
            filename: "y".repeat(MAX_PATH_LEN + 1),
        };
        assert!(matches!(cmd.encode(None), Err(RpcError::Argument(_))));
    }

    #[test]
    fn test_fixed_prefix_len_matches_encoding() {
        let cmd = LegacyCommand::Dlsym {
            lib: 1,
            symbol_name: "free".into(),
        };
        let bytes = cmd.encode(None).unwrap();
        assert_eq!(fixed_prefix_len(LegacyCmdType::Dlsym, false), bytes.len());

        let cmd = LegacyCommand::Peek {
            address: 1,
            size: 2,
        };
        assert_eq!(
            fixed_prefix_len(LegacyCmdType::Peek, true),
            cmd.encode(Some(1)).unwrap().len()
        );
    }
}
