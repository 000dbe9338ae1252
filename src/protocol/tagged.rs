//! Generation B wire format.
//!
//! Same `magic | cmd_type` header as generation A but a different command
//! table, a server handshake, tagged call arguments and status-prefixed
//! replies for memory access:
//!
//! ```text
//! CALL     address:u64 | va_list_index:u64 | argc:u64 | argc × {type:u64, value:u64}
//! PEEK     address:u64 | size:u64           -> magic | REPLY_PEEK | data[size]
//!                                            -> magic | REPLY_ERROR
//! LISTDIR  filename:char[1024]              -> magic | status | entries... | end
//! ```

use bytes::Bytes;

use super::handshake::Arch;
use super::reply::{ReplyShape, Request};
use super::{MAGIC, MAX_PATH_LEN};
use crate::codec::{WireReader, WireWriter};
use crate::error::{RpcError, Result};

/// Generation B command discriminants, replies included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaggedCmdType {
    Exec = 0,
    Dlopen = 1,
    Dlclose = 2,
    Dlsym = 3,
    Call = 4,
    Peek = 5,
    Poke = 6,
    ReplyError = 7,
    ReplyPeek = 8,
    GetDummyBlock = 9,
    Close = 10,
    ReplyPoke = 11,
    Listdir = 12,
    ShowObject = 13,
    ShowClass = 14,
}

impl TryFrom<u32> for TaggedCmdType {
    type Error = RpcError;

    fn try_from(v: u32) -> Result<Self> {
        use TaggedCmdType::*;
        Ok(match v {
            0 => Exec,
            1 => Dlopen,
            2 => Dlclose,
            3 => Dlsym,
            4 => Call,
            5 => Peek,
            6 => Poke,
            7 => ReplyError,
            8 => ReplyPeek,
            9 => GetDummyBlock,
            10 => Close,
            11 => ReplyPoke,
            12 => Listdir,
            13 => ShowObject,
            14 => ShowClass,
            other => return Err(RpcError::UnknownCommand(other)),
        })
    }
}

/// Register class a call argument is loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ArgKind {
    Integer = 0,
    Double = 1,
}

/// One call argument with its register class.
///
/// `value` holds raw bits; doubles are stored with `f64::to_bits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedArg {
    pub kind: ArgKind,
    pub value: u64,
}

impl TaggedArg {
    pub fn integer(value: u64) -> Self {
        Self {
            kind: ArgKind::Integer,
            value,
        }
    }

    pub fn double(value: f64) -> Self {
        Self {
            kind: ArgKind::Double,
            value: value.to_bits(),
        }
    }
}

/// A generation B command.
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedCommand {
    Exec {
        background: bool,
        argv: Vec<String>,
        envp: Vec<String>,
    },
    Dlopen { filename: String, mode: u32 },
    Dlclose { lib: u64 },
    Dlsym { lib: u64, symbol_name: String },
    Call {
        address: u64,
        va_list_index: u64,
        args: Vec<TaggedArg>,
    },
    Peek { address: u64, size: u64 },
    Poke { address: u64, data: Bytes },
    GetDummyBlock,
    Close,
    Listdir { filename: String },
    ShowObject { address: u64 },
    ShowClass { address: u64 },
}

/// `va_list_index` value for calls without variadic arguments.
pub const NO_VA_LIST: u64 = 0xffff;

impl TaggedCommand {
    pub fn cmd_type(&self) -> TaggedCmdType {
        match self {
            TaggedCommand::Exec { .. } => TaggedCmdType::Exec,
            TaggedCommand::Dlopen { .. } => TaggedCmdType::Dlopen,
            TaggedCommand::Dlclose { .. } => TaggedCmdType::Dlclose,
            TaggedCommand::Dlsym { .. } => TaggedCmdType::Dlsym,
            TaggedCommand::Call { .. } => TaggedCmdType::Call,
            TaggedCommand::Peek { .. } => TaggedCmdType::Peek,
            TaggedCommand::Poke { .. } => TaggedCmdType::Poke,
            TaggedCommand::GetDummyBlock => TaggedCmdType::GetDummyBlock,
            TaggedCommand::Close => TaggedCmdType::Close,
            TaggedCommand::Listdir { .. } => TaggedCmdType::Listdir,
            TaggedCommand::ShowObject { .. } => TaggedCmdType::ShowObject,
            TaggedCommand::ShowClass { .. } => TaggedCmdType::ShowClass,
        }
    }

    /// Layout of the agent's reply. Call replies depend on the remote arch.
    pub fn reply_shape(&self, arch: Arch) -> ReplyShape {
        match self {
            TaggedCommand::Exec { .. } => ReplyShape::U32,
            TaggedCommand::Dlopen { .. }
            | TaggedCommand::Dlclose { .. }
            | TaggedCommand::Dlsym { .. }
            | TaggedCommand::GetDummyBlock => ReplyShape::U64,
            TaggedCommand::Call { .. } => match arch {
                Arch::Arm64 => ReplyShape::Registers,
                Arch::Unknown => ReplyShape::U64,
            },
            TaggedCommand::Peek { size, .. } => ReplyShape::Status {
                size: *size as usize,
            },
            TaggedCommand::Poke { .. } => ReplyShape::Status { size: 0 },
            TaggedCommand::Close => ReplyShape::None,
            TaggedCommand::Listdir { .. } => ReplyShape::DirEntries,
            TaggedCommand::ShowObject { .. } | TaggedCommand::ShowClass { .. } => {
                ReplyShape::SizedText
            }
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut w = WireWriter::with_capacity(64);
        w.put_u32(MAGIC);
        w.put_u32(self.cmd_type() as u32);

        match self {
            TaggedCommand::Exec {
                background,
                argv,
                envp,
            } => {
                w.put_u8(u8::from(*background));
                w.put_prefixed_array(argv);
                w.put_prefixed_array(envp);
            }
            TaggedCommand::Dlopen { filename, mode } => {
                w.put_padded_str(filename, MAX_PATH_LEN)?;
                w.put_u32(*mode);
            }
            TaggedCommand::Dlclose { lib } => w.put_u64(*lib),
            TaggedCommand::Dlsym { lib, symbol_name } => {
                w.put_u64(*lib);
                w.put_padded_str(symbol_name, MAX_PATH_LEN)?;
            }
            TaggedCommand::Call {
                address,
                va_list_index,
                args,
            } => {
                w.put_u64(*address);
                w.put_u64(*va_list_index);
                w.put_u64(args.len() as u64);
                for arg in args {
                    w.put_u64(arg.kind as u64);
                    w.put_u64(arg.value);
                }
            }
            TaggedCommand::Peek { address, size } => {
                w.put_u64(*address);
                w.put_u64(*size);
            }
            TaggedCommand::Poke { address, data } => {
                w.put_u64(*address);
                w.put_sized_bytes(data);
            }
            TaggedCommand::GetDummyBlock | TaggedCommand::Close => {}
            TaggedCommand::Listdir { filename } => w.put_padded_str(filename, MAX_PATH_LEN)?,
            TaggedCommand::ShowObject { address } | TaggedCommand::ShowClass { address } => {
                w.put_u64(*address)
            }
        }

        Ok(w.freeze())
    }

    pub fn to_request(&self, arch: Arch) -> Result<Request> {
        Ok(Request::new(self.encode()?, self.reply_shape(arch)))
    }

    /// Decode a full message. Reply discriminants are rejected.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let magic = r.get_u32()?;
        if magic != MAGIC {
            return Err(RpcError::InvalidMagic {
                expected: MAGIC,
                actual: magic,
            });
        }
        let raw = r.get_u32()?;
        let cmd = match TaggedCmdType::try_from(raw)? {
            TaggedCmdType::Exec => TaggedCommand::Exec {
                background: r.get_u8()? != 0,
                argv: r.get_prefixed_array()?,
                envp: r.get_prefixed_array()?,
            },
            TaggedCmdType::Dlopen => TaggedCommand::Dlopen {
                filename: r.get_padded_str(MAX_PATH_LEN)?,
                mode: r.get_u32()?,
            },
            TaggedCmdType::Dlclose => TaggedCommand::Dlclose { lib: r.get_u64()? },
            TaggedCmdType::Dlsym => TaggedCommand::Dlsym {
                lib: r.get_u64()?,
                symbol_name: r.get_padded_str(MAX_PATH_LEN)?,
            },
            TaggedCmdType::Call => {
                let address = r.get_u64()?;
                let va_list_index = r.get_u64()?;
                let argc = r.get_u64()?;
                if argc > (r.remaining() / 16) as u64 {
                    return Err(RpcError::Protocol(format!(
                        "argc {argc} exceeds remaining input"
                    )));
                }
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    let kind = match r.get_u64()? {
                        0 => ArgKind::Integer,
                        1 => ArgKind::Double,
                        other => {
                            return Err(RpcError::Protocol(format!(
                                "unknown argument type {other}"
                            )))
                        }
                    };
                    args.push(TaggedArg {
                        kind,
                        value: r.get_u64()?,
                    });
                }
                TaggedCommand::Call {
                    address,
                    va_list_index,
                    args,
                }
            }
            TaggedCmdType::Peek => TaggedCommand::Peek {
                address: r.get_u64()?,
                size: r.get_u64()?,
            },
            TaggedCmdType::Poke => TaggedCommand::Poke {
                address: r.get_u64()?,
                data: Bytes::copy_from_slice(r.get_sized_bytes()?),
            },
            TaggedCmdType::GetDummyBlock => TaggedCommand::GetDummyBlock,
            TaggedCmdType::Close => TaggedCommand::Close,
            TaggedCmdType::Listdir => TaggedCommand::Listdir {
                filename: r.get_padded_str(MAX_PATH_LEN)?,
            },
            TaggedCmdType::ShowObject => TaggedCommand::ShowObject {
                address: r.get_u64()?,
            },
            TaggedCmdType::ShowClass => TaggedCommand::ShowClass {
                address: r.get_u64()?,
            },
            TaggedCmdType::ReplyError | TaggedCmdType::ReplyPeek | TaggedCmdType::ReplyPoke => {
                return Err(RpcError::UnknownCommand(raw))
            }
        };
        Ok(cmd)
    }
}

/// Encode a `magic | cmd_type` reply status header.
pub fn status_header(cmd_type: TaggedCmdType) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&MAGIC.to_le_bytes());
    out[4..].copy_from_slice(&(cmd_type as u32).to_le_bytes());
    out
}
