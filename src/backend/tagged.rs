//! Generation B backend.

use bytes::Bytes;
use tracing::debug;

use super::{
    BoxFuture, CallRequest, CallReturn, ExecRequest, ExecStart, RelayTransport, RemoteBackend,
};
use crate::channel::ExclusiveChannel;
use crate::error::{RpcError, Result};
use crate::protocol::tagged::TaggedCommand;
use crate::protocol::{DirEntry, PlatformInfo, ProtocolVersion, Reply, INVALID_PID};

/// Generation B: handshake, tagged arguments, status-prefixed replies.
pub struct TaggedBackend {
    channel: ExclusiveChannel,
    platform: PlatformInfo,
}

impl TaggedBackend {
    pub fn new(channel: ExclusiveChannel, platform: PlatformInfo) -> Self {
        Self { channel, platform }
    }

    async fn send(&self, cmd: TaggedCommand) -> Result<Reply> {
        let request = cmd.to_request(self.platform.arch)?;
        self.channel.exchange(request).await
    }

    async fn exec_inner(&self, request: ExecRequest) -> Result<ExecStart> {
        let background = request.background;
        let bytes = TaggedCommand::Exec {
            background,
            argv: request.argv,
            envp: request.envp,
        }
        .encode()?;

        let mut transport = self.channel.lock_owned().await?;
        transport.send_all(&bytes).await?;
        let pid = transport.recv_u32().await?;
        debug!(pid, background, "exec started");

        let relay = if background || pid == INVALID_PID {
            None
        } else {
            Some(RelayTransport::Shared(transport))
        };
        Ok(ExecStart { pid, relay })
    }
}

impl RemoteBackend for TaggedBackend {
    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::Tagged
    }

    fn is_poisoned(&self) -> bool {
        self.channel.is_poisoned()
    }

    fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    fn dlopen<'a>(&'a self, filename: &'a str, mode: u32) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            self.send(TaggedCommand::Dlopen {
                filename: filename.to_string(),
                mode,
            })
            .await?
            .into_u64()
        })
    }

    fn dlclose(&self, handle: u64) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let res = self
                .send(TaggedCommand::Dlclose { lib: handle })
                .await?
                .into_u64()?;
            Ok(res as i64)
        })
    }

    fn dlsym<'a>(&'a self, handle: u64, name: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            self.send(TaggedCommand::Dlsym {
                lib: handle,
                symbol_name: name.to_string(),
            })
            .await?
            .into_u64()
        })
    }

    fn call(&self, call: CallRequest) -> BoxFuture<'_, Result<CallReturn>> {
        Box::pin(async move {
            let reply = self
                .send(TaggedCommand::Call {
                    address: call.address,
                    va_list_index: call.va_list_index,
                    args: call.args,
                })
                .await?;
            match reply {
                Reply::Registers(regs) => Ok(CallReturn::Registers(regs)),
                other => other.into_u64().map(CallReturn::Word),
            }
        })
    }

    fn peek(&self, address: u64, size: u64) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            match self.send(TaggedCommand::Peek { address, size }).await? {
                Reply::Error => Err(RpcError::Argument(format!(
                    "failed to read {size} bytes at {address:#x}"
                ))),
                other => other.into_data(),
            }
        })
    }

    fn poke(&self, address: u64, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let len = data.len();
            match self.send(TaggedCommand::Poke { address, data }).await? {
                Reply::Error => Err(RpcError::Argument(format!(
                    "failed to write {len} bytes at {address:#x}"
                ))),
                other => other.into_data().map(|_| ()),
            }
        })
    }

    fn exec(&self, request: ExecRequest) -> BoxFuture<'_, Result<ExecStart>> {
        Box::pin(self.exec_inner(request))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let bytes = TaggedCommand::Close.encode()?;
            self.channel.send_only(&bytes).await
        })
    }

    fn get_dummy_block(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { self.send(TaggedCommand::GetDummyBlock).await?.into_u64() })
    }

    fn listdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<DirEntry>>> {
        Box::pin(async move {
            let reply = self
                .send(TaggedCommand::Listdir {
                    filename: path.to_string(),
                })
                .await?;
            match reply {
                Reply::Error => Err(RpcError::BadReturnValue(format!(
                    "failed to list directory {path}"
                ))),
                other => other.into_entries(),
            }
        })
    }

    fn show_object(&self, address: u64) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.send(TaggedCommand::ShowObject { address })
                .await?
                .into_text()
        })
    }

    fn show_class(&self, address: u64) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.send(TaggedCommand::ShowClass { address })
                .await?
                .into_text()
        })
    }
}
