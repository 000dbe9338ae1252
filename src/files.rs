//! Remote file operations.
//!
//! Generation A agents carry file commands natively. Generations B and C do
//! not, so the same operations are performed by calling the libc functions
//! through the agent and reading `errno` on failure. Either way errors come
//! back as the typed errno variants of [`RpcError`].

use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::args;
use crate::backend::FileOp;
use crate::client::Client;
use crate::error::{RpcError, Result};
use crate::guard::{AllocationGuard, Resource};
use crate::protocol::{DirEntry, Reply, Sysname};

/// Chunk size used by [`Client::pull`] and [`Client::push`].
pub const TRANSFER_CHUNK_SIZE: u64 = 64 * 1024;

/// Permission bits for files created by `open`.
const CREATE_MODE: u32 = 0o644;

/// `fopen`-style open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
    ReadUpdate,
    WriteUpdate,
    AppendUpdate,
}

impl FromStr for OpenMode {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(OpenMode::Read),
            "w" => Ok(OpenMode::Write),
            "a" => Ok(OpenMode::Append),
            "r+" => Ok(OpenMode::ReadUpdate),
            "w+" => Ok(OpenMode::WriteUpdate),
            "a+" => Ok(OpenMode::AppendUpdate),
            other => Err(RpcError::Argument(format!("unknown open mode {other:?}"))),
        }
    }
}

struct OpenFlags {
    append: i32,
    creat: i32,
    trunc: i32,
}

const DARWIN_FLAGS: OpenFlags = OpenFlags {
    append: 0x8,
    creat: 0x200,
    trunc: 0x400,
};

const LINUX_FLAGS: OpenFlags = OpenFlags {
    append: 0x400,
    creat: 0x40,
    trunc: 0x200,
};

const O_RDONLY: i32 = 0;
const O_WRONLY: i32 = 1;
const O_RDWR: i32 = 2;

impl OpenMode {
    /// `open(2)` flags for the given remote OS.
    pub fn flags(&self, sysname: Sysname) -> i32 {
        let t = match sysname {
            Sysname::Linux => &LINUX_FLAGS,
            Sysname::Darwin | Sysname::Unknown => &DARWIN_FLAGS,
        };
        match self {
            OpenMode::Read => O_RDONLY,
            OpenMode::Write => O_WRONLY | t.creat | t.trunc,
            OpenMode::Append => O_WRONLY | t.creat | t.append,
            OpenMode::ReadUpdate => O_RDWR,
            OpenMode::WriteUpdate => O_RDWR | t.creat | t.trunc,
            OpenMode::AppendUpdate => O_RDWR | t.creat | t.append,
        }
    }
}

/// Map a generation A `i64` result, where negatives are `-errno`.
fn check_native(sysname: Sysname, result: i64, context: &str) -> Result<i64> {
    if result < 0 {
        return Err(RpcError::from_errno(sysname, result.unsigned_abs() as i32, context));
    }
    Ok(result)
}

impl Client {
    async fn file_op_native(&self, op: FileOp) -> Result<Option<Reply>> {
        self.run(|backend| async move {
            if !backend.supports_file_ops() {
                return Ok(None);
            }
            backend.file_op(op).await.map(Some)
        })
        .await
    }

    fn native_i64(&self, reply: Reply, context: &str) -> Result<i64> {
        check_native(self.platform().sysname, reply.into_i64()?, context)
    }

    /// Open `path` with an `fopen`-style mode string.
    ///
    /// The returned guard closes the descriptor. An unknown mode is rejected
    /// before any traffic.
    pub async fn open(&self, path: &str, mode: &str) -> Result<AllocationGuard> {
        let mode: OpenMode = mode.parse()?;
        let sysname = self
            .run(|backend| async move { Ok(backend.platform().sysname) })
            .await?;
        let flags = mode.flags(sysname);

        let op = FileOp::Open {
            filename: path.to_string(),
            mode: flags,
        };
        let fd = match self.file_op_native(op).await? {
            Some(reply) => self.native_i64(reply, path)?,
            None => {
                self.call_checked("open", args![path, flags, CREATE_MODE], path)
                    .await?
            }
        };
        debug!(path, fd, "Opened remote file");
        Ok(self.guard(Resource::Fd(fd as i32)))
    }

    /// Close a raw descriptor.
    pub async fn close_fd(&self, fd: i32) -> Result<()> {
        let context = format!("close fd {fd}");
        match self.file_op_native(FileOp::Close { fd }).await? {
            Some(reply) => self.native_i64(reply, &context).map(|_| ()),
            None => self
                .call_checked("close", args![fd], context)
                .await
                .map(|_| ()),
        }
    }

    /// Read up to `size` bytes. An empty result means end of file.
    pub async fn read_fd(&self, fd: i32, size: u64) -> Result<Bytes> {
        let context = format!("read fd {fd}");
        if size == 0 {
            return Ok(Bytes::new());
        }
        if let Some(reply) = self.file_op_native(FileOp::Read { fd, size }).await? {
            return match reply {
                Reply::Data(data) => Ok(data),
                other => {
                    self.native_i64(other, &context)?;
                    Ok(Bytes::new())
                }
            };
        }

        let buf = self.malloc(size).await?;
        let address = buf.address().unwrap_or(0);
        buf.scoped(|_| async move {
            let n = self
                .call_checked("read", args![fd, address, size], context)
                .await?;
            self.peek(address, n as u64).await
        })
        .await
    }

    /// Write `data`; returns the number of bytes the agent accepted.
    pub async fn write_fd(&self, fd: i32, data: Bytes) -> Result<u64> {
        let context = format!("write fd {fd}");
        if data.is_empty() {
            return Ok(0);
        }
        let len = data.len() as u64;
        let written = match self
            .file_op_native(FileOp::Write {
                fd,
                data: data.clone(),
            })
            .await?
        {
            Some(reply) => self.native_i64(reply, &context)?,
            None => {
                self.call_checked("write", args![fd, data, len], context)
                    .await?
            }
        };
        Ok(written as u64)
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        let op = FileOp::Remove {
            filename: path.to_string(),
        };
        match self.file_op_native(op).await? {
            Some(reply) => self.native_i64(reply, path).map(|_| ()),
            None => self.call_checked("remove", args![path], path).await.map(|_| ()),
        }
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let op = FileOp::Mkdir {
            filename: path.to_string(),
            mode,
        };
        match self.file_op_native(op).await? {
            Some(reply) => self.native_i64(reply, path).map(|_| ()),
            None => self
                .call_checked("mkdir", args![path, mode], path)
                .await
                .map(|_| ()),
        }
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let op = FileOp::Chmod {
            filename: path.to_string(),
            mode,
        };
        match self.file_op_native(op).await? {
            Some(reply) => self.native_i64(reply, path).map(|_| ()),
            None => self
                .call_checked("chmod", args![path, mode], path)
                .await
                .map(|_| ()),
        }
    }

    /// Read a whole remote file.
    pub async fn pull(&self, path: &str) -> Result<Vec<u8>> {
        let file = self.open(path, "r").await?;
        file.scoped(|resource| async move {
            let Resource::Fd(fd) = resource else {
                return Err(RpcError::Argument("not a file descriptor".to_string()));
            };
            let mut out = BytesMut::new();
            loop {
                let chunk = self.read_fd(fd, TRANSFER_CHUNK_SIZE).await?;
                if chunk.is_empty() {
                    break;
                }
                out.extend_from_slice(&chunk);
            }
            debug!(path, bytes = out.len(), "Pulled remote file");
            Ok(out.to_vec())
        })
        .await
    }

    /// Create or truncate a remote file and write `data` to it.
    pub async fn push(&self, path: &str, data: &[u8]) -> Result<()> {
        let file = self.open(path, "w").await?;
        let data = Bytes::copy_from_slice(data);
        file.scoped(|resource| async move {
            let Resource::Fd(fd) = resource else {
                return Err(RpcError::Argument("not a file descriptor".to_string()));
            };
            let mut rest = data;
            while !rest.is_empty() {
                let take = rest.len().min(TRANSFER_CHUNK_SIZE as usize);
                let written = self.write_fd(fd, rest.slice(..take)).await?;
                if written == 0 {
                    return Err(RpcError::BadReturnValue(format!("short write to {path}")));
                }
                rest = rest.slice(written as usize..);
            }
            debug!(path, "Pushed remote file");
            Ok(())
        })
        .await
    }

    /// List a remote directory (generations B and C).
    pub async fn listdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.run(|backend| async move { backend.listdir(path).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("r".parse::<OpenMode>().unwrap(), OpenMode::Read);
        assert_eq!("a+".parse::<OpenMode>().unwrap(), OpenMode::AppendUpdate);
        assert!(matches!(
            "rw".parse::<OpenMode>(),
            Err(RpcError::Argument(_))
        ));
    }

    #[test]
    fn test_flags_per_os() {
        assert_eq!(OpenMode::Read.flags(Sysname::Darwin), 0);
        assert_eq!(OpenMode::Write.flags(Sysname::Darwin), 0x601);
        assert_eq!(OpenMode::Append.flags(Sysname::Darwin), 0x209);
        assert_eq!(OpenMode::Write.flags(Sysname::Linux), 0x241);
        assert_eq!(OpenMode::AppendUpdate.flags(Sysname::Linux), 0x442);
        assert_eq!(OpenMode::ReadUpdate.flags(Sysname::Unknown), 2);
    }

    #[test]
    fn test_native_errors_map_to_errno() {
        assert!(matches!(
            check_native(Sysname::Darwin, -2, "/nope"),
            Err(RpcError::NotFound(p)) if p == "/nope"
        ));
        assert_eq!(check_native(Sysname::Darwin, 5, "x").unwrap(), 5);
    }

    #[tokio::test]
    async fn test_unknown_mode_rejected_before_connecting() {
        let client = Client::lazy(crate::config::ClientConfig::default());
        let err = client.open("/tmp/x", "x").await.unwrap_err();
        assert!(matches!(err, RpcError::Argument(_)));
        assert_eq!(client.state(), crate::connection::ConnectionState::Disconnected);
    }
}
