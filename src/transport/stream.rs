//! Agent endpoints and connection establishment.
//!
//! - TCP: `host:port`, the usual case
//! - Unix domain socket: a local pipe to an agent on the same machine
//!
//! Both are returned as a [`BoxedStream`] so the rest of the client, and
//! tests using in-memory duplex pairs, share one code path.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{RpcError, Result};
use crate::protocol::DEFAULT_PORT;

/// Byte stream usable as an agent connection.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased agent connection.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Where the agent listens.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix { path: path.into() }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::tcp("127.0.0.1", DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Open a stream to `endpoint`.
///
/// # Errors
///
/// - `ConnectionRefused` when nothing listens on the endpoint
/// - `ResourceTemporarilyUnavailable` when `timeout` elapses
/// - `FailedToConnect` for every other failure
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<BoxedStream> {
    connect_with_local(endpoint, timeout)
        .await
        .map(|(stream, _)| stream)
}

/// Like [`connect`], also returning the local address of a TCP connection.
///
/// The agent can reach that address, so reply listeners bind to it.
pub async fn connect_with_local(
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<(BoxedStream, Option<IpAddr>)> {
    debug!(%endpoint, "Connecting to agent");

    let attempt = async {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                let local = stream.local_addr()?.ip();
                Ok::<_, std::io::Error>((Box::new(stream) as BoxedStream, Some(local)))
            }
            Endpoint::Unix { path } => Ok((connect_unix(path).await?, None)),
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Err(_) => Err(RpcError::ResourceTemporarilyUnavailable(format!(
            "connect to {endpoint} timed out after {timeout:?}"
        ))),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(RpcError::ConnectionRefused(endpoint.to_string()))
        }
        Ok(Err(source)) => Err(RpcError::FailedToConnect {
            endpoint: endpoint.to_string(),
            source,
        }),
        Ok(Ok(connected)) => Ok(connected),
    }
}

#[cfg(unix)]
async fn connect_unix(path: &std::path::Path) -> std::io::Result<BoxedStream> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn connect_unix(_path: &std::path::Path) -> std::io::Result<BoxedStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "unix domain sockets are not available on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::tcp("10.0.0.2", 5910).to_string(), "10.0.0.2:5910");
        assert_eq!(
            Endpoint::unix("/tmp/agent.sock").to_string(),
            "unix:/tmp/agent.sock"
        );
        assert_eq!(Endpoint::default().to_string(), "127.0.0.1:5910");
    }

    #[test]
    fn test_endpoint_deserialize() {
        let ep: Endpoint = serde_json::from_str(r#"{"tcp":{"host":"dev","port":1}}"#).unwrap();
        assert_eq!(ep, Endpoint::tcp("dev", 1));
        let ep: Endpoint = serde_json::from_str(r#"{"unix":{"path":"/tmp/a"}}"#).unwrap();
        assert_eq!(ep, Endpoint::unix("/tmp/a"));
    }

    #[tokio::test]
    async fn test_tcp_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"ok").await.unwrap();
        });

        let mut stream = connect(&Endpoint::tcp("127.0.0.1", port), Duration::from_secs(5))
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connect_reports_local_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let (_stream, local) =
            connect_with_local(&Endpoint::tcp("127.0.0.1", port), Duration::from_secs(5))
                .await
                .unwrap();
        assert_eq!(local, Some(IpAddr::from([127, 0, 0, 1])));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = connect(&Endpoint::tcp("127.0.0.1", port), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RpcError::ConnectionRefused(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_connect() {
        let path = std::env::temp_dir().join(format!("rpcwire-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"pipe").await.unwrap();
        });

        let mut stream = connect(&Endpoint::unix(&path), Duration::from_secs(5))
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pipe");
        server.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
