//! Ephemeral reply-socket channel (generation A variant).
//!
//! Each command binds its own listener and embeds the port in the header
//! (`magic | cmd_type | reply_port`). The agent connects back once and
//! writes the reply on that side socket. Only the send on the main socket
//! is serialized; replies for different commands proceed in parallel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::debug;

use super::reply::read_reply;
use crate::error::{RpcError, Result};
use crate::protocol::legacy::LegacyCommand;
use crate::protocol::Reply;
use crate::transport::{BoxedStream, FrameTransport, TransportOptions};

/// Channel that receives every reply on a fresh side connection.
#[derive(Clone)]
pub struct EphemeralChannel {
    transport: Arc<Mutex<FrameTransport>>,
    bind_addr: IpAddr,
    accept_timeout: Duration,
    options: TransportOptions,
}

impl EphemeralChannel {
    /// `bind_addr` must be reachable from the agent.
    pub fn new(transport: FrameTransport, bind_addr: IpAddr, accept_timeout: Duration) -> Self {
        let options = transport.options();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            bind_addr,
            accept_timeout,
            options,
        }
    }

    /// Loopback channel, for agents on the same host.
    pub fn loopback(transport: FrameTransport, accept_timeout: Duration) -> Self {
        Self::new(transport, IpAddr::V4(Ipv4Addr::LOCALHOST), accept_timeout)
    }

    /// Send `cmd` and return its reply.
    pub async fn exchange(&self, cmd: &LegacyCommand) -> Result<Reply> {
        let (reply, _side) = self.open_exchange(cmd).await?;
        Ok(reply)
    }

    /// Send `cmd`, read its reply and keep the side socket open.
    ///
    /// Exec sessions continue on the returned transport.
    pub async fn open_exchange(&self, cmd: &LegacyCommand) -> Result<(Reply, FrameTransport)> {
        let listener = TcpListener::bind(SocketAddr::new(self.bind_addr, 0)).await?;
        let port = listener.local_addr()?.port();
        let bytes = cmd.encode(Some(port))?;

        debug!(cmd = ?cmd.cmd_type(), port, "ephemeral exchange");
        self.transport.lock().await.send_all(&bytes).await?;

        let (side, peer) = tokio::time::timeout(self.accept_timeout, listener.accept())
            .await
            .map_err(|_| {
                RpcError::ResourceTemporarilyUnavailable(format!(
                    "agent did not connect back on port {port} within {:?}",
                    self.accept_timeout
                ))
            })??;
        drop(listener);
        debug!(%peer, port, "reply socket accepted");

        side.set_nodelay(true)?;
        let mut side = FrameTransport::new(Box::new(side) as BoxedStream, self.options);
        let reply = read_reply(&mut side, cmd.reply_shape()).await?;
        Ok((reply, side))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::legacy::{fixed_prefix_len, LegacyCmdType};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_reply_arrives_on_side_socket() {
        let (a, mut agent) = duplex(4096);
        let channel = EphemeralChannel::loopback(
            FrameTransport::new(Box::new(a), TransportOptions::default()),
            Duration::from_secs(5),
        );

        let server = tokio::spawn(async move {
            let mut req = vec![0u8; fixed_prefix_len(LegacyCmdType::Dlclose, true)];
            agent.read_exact(&mut req).await.unwrap();
            let (cmd, port) = LegacyCommand::decode(&req, true).unwrap();
            assert_eq!(cmd, LegacyCommand::Dlclose { lib: 0x77 });

            let mut side = TcpStream::connect(("127.0.0.1", port.unwrap()))
                .await
                .unwrap();
            side.write_all(&0i64.to_le_bytes()).await.unwrap();
            agent
        });

        let reply = channel
            .exchange(&LegacyCommand::Dlclose { lib: 0x77 })
            .await
            .unwrap();
        assert_eq!(reply, Reply::I64(0));
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_never_connects_back() {
        let (a, _agent) = duplex(4096);
        let channel = EphemeralChannel::loopback(
            FrameTransport::new(Box::new(a), TransportOptions::default()),
            Duration::from_secs(1),
        );
        let err = channel
            .exchange(&LegacyCommand::Close { fd: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ResourceTemporarilyUnavailable(_)));
    }
}
