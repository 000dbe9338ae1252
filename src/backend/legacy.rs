//! Generation A backend.

use bytes::Bytes;
use tracing::debug;

use super::{
    BoxFuture, CallRequest, CallReturn, ExecRequest, ExecStart, FileOp, RelayTransport,
    RemoteBackend,
};
use crate::channel::{EphemeralChannel, ExclusiveChannel};
use crate::error::{RpcError, Result};
use crate::protocol::legacy::LegacyCommand;
use crate::protocol::tagged::ArgKind;
use crate::protocol::{PlatformInfo, ProtocolVersion, Reply, INVALID_PID};

enum LegacyChannel {
    SameSocket(ExclusiveChannel),
    Ephemeral(EphemeralChannel),
}

/// Generation A: no handshake, raw fixed-size replies.
pub struct LegacyBackend {
    channel: LegacyChannel,
    platform: PlatformInfo,
}

impl LegacyBackend {
    pub fn same_socket(channel: ExclusiveChannel) -> Self {
        Self {
            channel: LegacyChannel::SameSocket(channel),
            platform: PlatformInfo::unknown(),
        }
    }

    pub fn ephemeral(channel: EphemeralChannel) -> Self {
        Self {
            channel: LegacyChannel::Ephemeral(channel),
            platform: PlatformInfo::unknown(),
        }
    }

    async fn send(&self, cmd: LegacyCommand) -> Result<Reply> {
        match &self.channel {
            LegacyChannel::SameSocket(channel) => channel.exchange(cmd.to_request(None)?).await,
            LegacyChannel::Ephemeral(channel) => channel.exchange(&cmd).await,
        }
    }

    async fn exec_inner(&self, request: ExecRequest) -> Result<ExecStart> {
        if request.background {
            return Err(RpcError::Unsupported {
                protocol: ProtocolVersion::Legacy.name(),
                operation: "background exec",
            });
        }
        if !request.envp.is_empty() {
            return Err(RpcError::Argument(
                "generation A exec does not carry an environment".to_string(),
            ));
        }

        let cmd = LegacyCommand::Exec { argv: request.argv };
        let (pid, relay) = match &self.channel {
            LegacyChannel::SameSocket(channel) => {
                let bytes = cmd.encode(None)?;
                let mut transport = channel.lock_owned().await?;
                transport.send_all(&bytes).await?;
                let pid = transport.recv_u32().await?;
                (pid, RelayTransport::Shared(transport))
            }
            LegacyChannel::Ephemeral(channel) => {
                let (reply, side) = channel.open_exchange(&cmd).await?;
                (reply.into_u32()?, RelayTransport::Dedicated(side))
            }
        };

        debug!(pid, "exec started");
        Ok(ExecStart {
            pid,
            relay: (pid != INVALID_PID).then_some(relay),
        })
    }
}

impl RemoteBackend for LegacyBackend {
    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::Legacy
    }

    fn is_poisoned(&self) -> bool {
        match &self.channel {
            LegacyChannel::SameSocket(channel) => channel.is_poisoned(),
            LegacyChannel::Ephemeral(_) => false,
        }
    }

    fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    fn dlopen<'a>(&'a self, filename: &'a str, mode: u32) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            self.send(LegacyCommand::Dlopen {
                filename: filename.to_string(),
                mode: mode as i32,
            })
            .await?
            .into_u64()
        })
    }

    fn dlclose(&self, handle: u64) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            self.send(LegacyCommand::Dlclose { lib: handle })
                .await?
                .into_i64()
        })
    }

    fn dlsym<'a>(&'a self, handle: u64, name: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            self.send(LegacyCommand::Dlsym {
                lib: handle,
                symbol_name: name.to_string(),
            })
            .await?
            .into_u64()
        })
    }

    fn call(&self, call: CallRequest) -> BoxFuture<'_, Result<CallReturn>> {
        Box::pin(async move {
            let argv = call
                .args
                .iter()
                .map(|arg| match arg.kind {
                    ArgKind::Integer => Ok(arg.value),
                    ArgKind::Double => Err(RpcError::Argument(
                        "generation A cannot pass floating-point arguments".to_string(),
                    )),
                })
                .collect::<Result<Vec<_>>>()?;
            let value = self
                .send(LegacyCommand::Call {
                    address: call.address,
                    argv,
                })
                .await?
                .into_u64()?;
            Ok(CallReturn::Word(value))
        })
    }

    fn peek(&self, address: u64, size: u64) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            self.send(LegacyCommand::Peek { address, size })
                .await?
                .into_data()
        })
    }

    fn poke(&self, address: u64, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let len = data.len();
            let result = self
                .send(LegacyCommand::Poke { address, data })
                .await?
                .into_i64()?;
            if result < 0 {
                return Err(RpcError::Argument(format!(
                    "failed to write {len} bytes at {address:#x}"
                )));
            }
            Ok(())
        })
    }

    fn exec(&self, request: ExecRequest) -> BoxFuture<'_, Result<ExecStart>> {
        Box::pin(self.exec_inner(request))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        // Generation A has no goodbye message; dropping the socket suffices.
        Box::pin(async { Ok(()) })
    }

    fn file_op(&self, op: FileOp) -> BoxFuture<'_, Result<Reply>> {
        let cmd = match op {
            FileOp::Open { filename, mode } => LegacyCommand::Open { filename, mode },
            FileOp::Close { fd } => LegacyCommand::Close { fd },
            FileOp::Read { fd, size } => LegacyCommand::Read { fd, size },
            FileOp::Write { fd, data } => LegacyCommand::Write { fd, data },
            FileOp::Remove { filename } => LegacyCommand::Remove { filename },
            FileOp::Mkdir { filename, mode } => LegacyCommand::Mkdir { filename, mode },
            FileOp::Chmod { filename, mode } => LegacyCommand::Chmod { filename, mode },
        };
        Box::pin(self.send(cmd))
    }

    fn supports_file_ops(&self) -> bool {
        true
    }
}
