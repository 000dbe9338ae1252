//! Generation C backend.

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use tracing::debug;

use super::{
    BoxFuture, CallRequest, CallReturn, ExecRequest, ExecStart, RelayTransport, RemoteBackend,
};
use crate::channel::MuxChannel;
use crate::codec::{ProtoCodec, WireReader};
use crate::config::ClientConfig;
use crate::connection::open_protobuf_session;
use crate::error::{RpcError, Result};
use crate::protocol::proto::{self, msg_id};
use crate::protocol::reply::ARM64_REGISTER_COUNT;
use crate::protocol::{
    DirEntry, PlatformInfo, ProtocolVersion, RegisterFile, Stat64, INVALID_PID,
};

/// Generation C: framed protobuf messages over a multiplexed channel.
pub struct ProtobufBackend {
    channel: MuxChannel,
    platform: PlatformInfo,
    config: Arc<ClientConfig>,
}

impl ProtobufBackend {
    /// `config` is used to open dedicated exec connections.
    pub fn new(channel: MuxChannel, platform: PlatformInfo, config: Arc<ClientConfig>) -> Self {
        Self {
            channel,
            platform,
            config,
        }
    }

    async fn request<Req: Message, Rep: Message + Default>(&self, id: u32, req: &Req) -> Result<Rep> {
        let payload = self.channel.request(id, ProtoCodec::encode(req)).await?;
        ProtoCodec::decode(&payload)
    }

    /// Peek and poke failures are bad addresses, not server faults.
    fn address_error(err: RpcError, what: String) -> RpcError {
        match err {
            RpcError::ServerResponse(message) => RpcError::Argument(format!("{what}: {message}")),
            other => other,
        }
    }

    async fn exec_inner(&self, request: ExecRequest) -> Result<ExecStart> {
        let background = request.background;
        let (mut transport, handshake) = open_protobuf_session(&self.config).await?;

        let envelope = proto::RpcMessage {
            client_id: handshake.client_id,
            msg_id: msg_id::EXEC,
            payload: ProtoCodec::encode(&proto::ReqExec {
                background,
                argv: request.argv,
                envp: request.envp,
            }),
        };
        transport.send_framed(&ProtoCodec::encode(&envelope)).await?;

        let reply: proto::RpcMessage = ProtoCodec::decode(&transport.recv_framed().await?)?;
        let pid = match reply.msg_id {
            id if id == msg_id::reply_for(msg_id::EXEC) => {
                ProtoCodec::decode::<proto::RepExec>(&reply.payload)?.pid
            }
            msg_id::REP_ERROR => {
                let err: proto::ReplyError = ProtoCodec::decode(&reply.payload)?;
                return Err(RpcError::Spawn(err.message));
            }
            other => return Err(RpcError::UnknownMessageId(other)),
        };
        debug!(pid, background, client_id = handshake.client_id, "exec started");

        let relay = if background || pid == INVALID_PID {
            None
        } else {
            Some(RelayTransport::Dedicated(transport))
        };
        Ok(ExecStart { pid, relay })
    }
}

fn registers_from(regs: &proto::ReturnRegisters) -> RegisterFile {
    let mut file = RegisterFile::default();
    for (dst, src) in file.x.iter_mut().zip(regs.x.iter().take(ARM64_REGISTER_COUNT)) {
        *dst = *src;
    }
    for (dst, src) in file.d.iter_mut().zip(regs.d.iter().take(ARM64_REGISTER_COUNT)) {
        *dst = *src;
    }
    file
}

fn dir_entry_from(entry: proto::ProtoDirEntry) -> Result<DirEntry> {
    Ok(DirEntry {
        d_type: entry.d_type,
        name: entry.name,
        lstat: Stat64::decode(&mut WireReader::new(&entry.lstat))?,
        stat: Stat64::decode(&mut WireReader::new(&entry.stat))?,
    })
}

impl RemoteBackend for ProtobufBackend {
    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::Protobuf
    }

    fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    fn client_id(&self) -> Option<u32> {
        Some(self.channel.client_id())
    }

    fn is_poisoned(&self) -> bool {
        self.channel.is_closed()
    }

    fn dlopen<'a>(&'a self, filename: &'a str, mode: u32) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let rep: proto::RepDlopen = self
                .request(
                    msg_id::DLOPEN,
                    &proto::ReqDlopen {
                        filename: filename.to_string(),
                        mode,
                    },
                )
                .await?;
            Ok(rep.handle)
        })
    }

    fn dlclose(&self, handle: u64) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let rep: proto::RepDlclose = self
                .request(msg_id::DLCLOSE, &proto::ReqDlclose { handle })
                .await?;
            Ok(rep.res as i64)
        })
    }

    fn dlsym<'a>(&'a self, handle: u64, name: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let rep: proto::RepDlsym = self
                .request(
                    msg_id::DLSYM,
                    &proto::ReqDlsym {
                        handle,
                        symbol_name: name.to_string(),
                    },
                )
                .await?;
            Ok(rep.ptr)
        })
    }

    fn call(&self, call: CallRequest) -> BoxFuture<'_, Result<CallReturn>> {
        Box::pin(async move {
            let req = proto::ReqCall {
                address: call.address,
                va_list_index: call.va_list_index,
                argv: call
                    .args
                    .iter()
                    .map(|arg| proto::Argument {
                        kind: arg.kind as u64,
                        value: arg.value,
                    })
                    .collect(),
            };
            let rep: proto::RepCall = self.request(msg_id::CALL, &req).await?;
            Ok(match &rep.arm_registers {
                Some(regs) => CallReturn::Registers(registers_from(regs)),
                None => CallReturn::Word(rep.return_value),
            })
        })
    }

    fn peek(&self, address: u64, size: u64) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            let rep: proto::RepPeek = self
                .request(msg_id::PEEK, &proto::ReqPeek { address, size })
                .await
                .map_err(|e| {
                    Self::address_error(e, format!("failed to read {size} bytes at {address:#x}"))
                })?;
            if rep.data.len() as u64 != size {
                return Err(RpcError::Protocol(format!(
                    "peek returned {} bytes, expected {size}",
                    rep.data.len()
                )));
            }
            Ok(Bytes::from(rep.data))
        })
    }

    fn poke(&self, address: u64, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let len = data.len();
            let _: proto::RepPoke = self
                .request(
                    msg_id::POKE,
                    &proto::ReqPoke {
                        address,
                        data: data.to_vec(),
                    },
                )
                .await
                .map_err(|e| {
                    Self::address_error(e, format!("failed to write {len} bytes at {address:#x}"))
                })?;
            Ok(())
        })
    }

    fn exec(&self, request: ExecRequest) -> BoxFuture<'_, Result<ExecStart>> {
        Box::pin(self.exec_inner(request))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.channel
                .notify(msg_id::CLOSE_CLIENT, ProtoCodec::encode(&proto::ReqCloseClient {}))
                .await
        })
    }

    fn get_dummy_block(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let rep: proto::RepDummyBlock = self
                .request(msg_id::DUMMY_BLOCK, &proto::ReqDummyBlock {})
                .await?;
            Ok(rep.address)
        })
    }

    fn listdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<DirEntry>>> {
        Box::pin(async move {
            let rep: proto::RepListDir = self
                .request(
                    msg_id::LISTDIR,
                    &proto::ReqListDir {
                        path: path.to_string(),
                    },
                )
                .await?;
            rep.entries.into_iter().map(dir_entry_from).collect()
        })
    }

    fn show_object(&self, address: u64) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let rep: proto::RepDescription = self
                .request(msg_id::SHOW_OBJECT, &proto::ReqShowObject { address })
                .await?;
            Ok(rep.description)
        })
    }

    fn show_class(&self, address: u64) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let rep: proto::RepDescription = self
                .request(msg_id::SHOW_CLASS, &proto::ReqShowClass { address })
                .await?;
            Ok(rep.description)
        })
    }
}
