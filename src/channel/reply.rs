//! Reading fixed-layout replies off a transport.

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::codec::WireReader;
use crate::error::{RpcError, Result};
use crate::protocol::reply::ARM64_REGISTER_COUNT;
use crate::protocol::structs::{DirEntry, STAT64_SIZE};
use crate::protocol::tagged::TaggedCmdType;
use crate::protocol::{RegisterFile, Reply, ReplyShape, MAGIC};
use crate::transport::FrameTransport;

/// Largest `CountedData` / `SizedText` body accepted from the agent.
const MAX_REPLY_BODY: u64 = 256 * 1024 * 1024;

/// Read one reply of the given shape.
pub async fn read_reply<S: AsyncRead + Unpin>(
    transport: &mut FrameTransport<S>,
    shape: ReplyShape,
) -> Result<Reply> {
    match shape {
        ReplyShape::None => Ok(Reply::None),
        ReplyShape::U32 => Ok(Reply::U32(transport.recv_u32().await?)),
        ReplyShape::I64 => Ok(Reply::I64(transport.recv_i64().await?)),
        ReplyShape::U64 => Ok(Reply::U64(transport.recv_u64().await?)),
        ReplyShape::Raw(n) => Ok(Reply::Data(transport.recv_exact(n).await?)),
        ReplyShape::CountedData => {
            let result = transport.recv_i64().await?;
            if result <= 0 {
                return Ok(Reply::I64(result));
            }
            check_body_len(result as u64)?;
            Ok(Reply::Data(transport.recv_exact(result as usize).await?))
        }
        ReplyShape::Status { size } => {
            if !read_status(transport).await? {
                return Ok(Reply::Error);
            }
            Ok(Reply::Data(transport.recv_exact(size).await?))
        }
        ReplyShape::Registers => {
            let raw = transport.recv_exact(ARM64_REGISTER_COUNT * 16).await?;
            let mut r = WireReader::new(&raw);
            let mut regs = RegisterFile::default();
            for x in regs.x.iter_mut() {
                *x = r.get_u64()?;
            }
            for d in regs.d.iter_mut() {
                *d = r.get_u64()?;
            }
            Ok(Reply::Registers(regs))
        }
        ReplyShape::SizedText => {
            let len = transport.recv_u64().await?;
            check_body_len(len)?;
            let raw = transport.recv_exact(len as usize).await?;
            Ok(Reply::Text(String::from_utf8_lossy(&raw).into_owned()))
        }
        ReplyShape::DirEntries => {
            if !read_status(transport).await? {
                return Ok(Reply::Error);
            }
            read_dir_entries(transport).await.map(Reply::Entries)
        }
    }
}

fn check_body_len(len: u64) -> Result<()> {
    if len > MAX_REPLY_BODY {
        return Err(RpcError::Protocol(format!(
            "reply body of {len} bytes exceeds maximum {MAX_REPLY_BODY}"
        )));
    }
    Ok(())
}

/// Read a `magic | cmd_type` status header. Returns `false` on REPLY_ERROR.
async fn read_status<S: AsyncRead + Unpin>(transport: &mut FrameTransport<S>) -> Result<bool> {
    let magic = transport.recv_u32().await?;
    if magic != MAGIC {
        return Err(RpcError::InvalidMagic {
            expected: MAGIC,
            actual: magic,
        });
    }
    let cmd_type = TaggedCmdType::try_from(transport.recv_u32().await?)?;
    match cmd_type {
        TaggedCmdType::ReplyError => Ok(false),
        TaggedCmdType::ReplyPeek | TaggedCmdType::ReplyPoke | TaggedCmdType::Listdir => Ok(true),
        other => Err(RpcError::Protocol(format!(
            "unexpected reply status {other:?}"
        ))),
    }
}

async fn read_dir_entries<S: AsyncRead + Unpin>(
    transport: &mut FrameTransport<S>,
) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    loop {
        // An entry whose magic is not MAGIC terminates the listing.
        if transport.recv_u64().await? != u64::from(MAGIC) {
            return Ok(entries);
        }
        let d_type = transport.recv_u64().await?;
        let namelen = transport.recv_u64().await?;
        check_body_len(namelen)?;

        let mut body = Vec::with_capacity(24 + namelen as usize + 2 * STAT64_SIZE);
        body.extend_from_slice(&d_type.to_le_bytes());
        body.extend_from_slice(&namelen.to_le_bytes());
        body.extend_from_slice(&transport.recv_exact(namelen as usize).await?);
        body.extend_from_slice(&transport.recv_exact(2 * STAT64_SIZE).await?);

        let mut r = WireReader::new(&body);
        entries.push(DirEntry::decode_body(&mut r)?);
    }
}

/// Encode a status header followed by `body`, as the agent would.
pub fn status_reply(cmd_type: TaggedCmdType, body: &[u8]) -> Bytes {
    let mut out = crate::protocol::tagged::status_header(cmd_type).to_vec();
    out.extend_from_slice(body);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireWriter;
    use crate::protocol::Stat64;
    use crate::transport::TransportOptions;
    use tokio::io::{duplex, AsyncWriteExt};

    async fn read_from(bytes: &[u8], shape: ReplyShape) -> Result<Reply> {
        let (a, mut b) = duplex(64 * 1024);
        b.write_all(bytes).await.unwrap();
        drop(b);
        let mut transport = FrameTransport::new(a, TransportOptions::default());
        read_reply(&mut transport, shape).await
    }

    #[tokio::test]
    async fn test_counted_data() {
        let mut raw = 3i64.to_le_bytes().to_vec();
        raw.extend_from_slice(b"abc");
        let reply = read_from(&raw, ReplyShape::CountedData).await.unwrap();
        assert_eq!(reply, Reply::Data(Bytes::from_static(b"abc")));

        let reply = read_from(&(-2i64).to_le_bytes(), ReplyShape::CountedData)
            .await
            .unwrap();
        assert_eq!(reply, Reply::I64(-2));
    }

    #[tokio::test]
    async fn test_status_peek_and_error() {
        let raw = status_reply(TaggedCmdType::ReplyPeek, b"\x01\x02\x03\x04");
        let reply = read_from(&raw, ReplyShape::Status { size: 4 }).await.unwrap();
        assert_eq!(reply, Reply::Data(Bytes::from_static(b"\x01\x02\x03\x04")));

        let raw = status_reply(TaggedCmdType::ReplyError, b"");
        let reply = read_from(&raw, ReplyShape::Status { size: 4 }).await.unwrap();
        assert_eq!(reply, Reply::Error);
    }

    #[tokio::test]
    async fn test_status_bad_magic() {
        let mut raw = status_reply(TaggedCmdType::ReplyPeek, b"").to_vec();
        raw[0] = 0;
        let err = read_from(&raw, ReplyShape::Status { size: 0 }).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidMagic { .. }));
    }

    #[tokio::test]
    async fn test_registers() {
        let mut w = WireWriter::new();
        for i in 0..8u64 {
            w.put_u64(i + 100);
        }
        for i in 0..8 {
            w.put_f64(i as f64);
        }
        let reply = read_from(&w.freeze(), ReplyShape::Registers).await.unwrap();
        let Reply::Registers(regs) = reply else {
            panic!("expected registers");
        };
        assert_eq!(regs.x[0], 100);
        assert_eq!(f64::from_bits(regs.d[3]), 3.0);
    }

    #[tokio::test]
    async fn test_dir_entries_until_terminator() {
        let mut w = WireWriter::new();
        w.put_bytes(&crate::protocol::tagged::status_header(TaggedCmdType::Listdir));
        for name in ["a", "bc"] {
            DirEntry {
                d_type: 8,
                name: name.to_string(),
                lstat: Stat64::default(),
                stat: Stat64::default(),
            }
            .encode(u64::from(MAGIC), &mut w);
        }
        w.put_u64(0);
        let reply = read_from(&w.freeze(), ReplyShape::DirEntries).await.unwrap();
        let names: Vec<_> = reply
            .into_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "bc"]);
    }

    #[tokio::test]
    async fn test_sized_text() {
        let mut raw = 7u64.to_le_bytes().to_vec();
        raw.extend_from_slice(b"{\"a\":1}");
        let reply = read_from(&raw, ReplyShape::SizedText).await.unwrap();
        assert_eq!(reply.into_text().unwrap(), "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_truncated_reply_is_server_died() {
        let err = read_from(&[1, 2], ReplyShape::U64).await.unwrap_err();
        assert!(matches!(err, RpcError::ServerDied));
    }
}
