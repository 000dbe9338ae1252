//! Error types for rpcwire-client.
//!
//! Errors fall into five families: protocol violations, transport failures,
//! errno values reported by the agent, locally detected argument errors and
//! spawn failures. Callers match on variants instead of parsing messages.

use thiserror::Error;

use crate::protocol::Sysname;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message header carried the wrong magic.
    #[error("Invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },

    /// The handshake magic does not match the expected protocol version.
    /// The connection must not be used further.
    #[error("Invalid server version magic: expected {expected:#x}, got {actual:#x}")]
    InvalidServerVersionMagic { expected: u32, actual: u32 },

    /// Protocol error (malformed frame, bad length, unexpected reply).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A reply carried a message id that no pending request expects.
    #[error("Unknown message id: {0}")]
    UnknownMessageId(u32),

    /// Unknown command discriminant while decoding.
    #[error("Unknown command type: {0}")]
    UnknownCommand(u32),

    /// Peer closed the socket mid-message.
    #[error("Server died")]
    ServerDied,

    /// Could not establish the transport.
    #[error("Failed to connect to {endpoint}: {source}")]
    FailedToConnect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection refused, either locally or reported by the agent.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// A socket timeout fired, or the agent reported EAGAIN.
    #[error("Resource temporarily unavailable: {0}")]
    ResourceTemporarilyUnavailable(String),

    /// The agent answered with an explicit error reply.
    #[error("Server response error: {0}")]
    ServerResponse(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("File exists: {0}")]
    Exists(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Broken pipe: {0}")]
    BrokenPipe(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Unmapped errno or failed return value.
    #[error("Bad return value: {0}")]
    BadReturnValue(String),

    /// Invalid argument detected before (or instead of) wire traffic.
    #[error("Argument error: {0}")]
    Argument(String),

    /// The agent failed to spawn the requested process.
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// A symbol resolved to NULL on the agent.
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// Operation not offered by the negotiated protocol generation.
    #[error("Operation not supported by {protocol}: {operation}")]
    Unsupported {
        protocol: &'static str,
        operation: &'static str,
    },

    /// Protobuf decoding error (generation C).
    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    /// JSON decoding error (object descriptions, configuration).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection closed and not yet re-established.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

/// errno values that have a dedicated error variant.
///
/// Numbering is per remote OS; the agent's errno is never interpreted with
/// the local platform's table.
struct ErrnoTable {
    eperm: i32,
    enoent: i32,
    eacces: i32,
    eexist: i32,
    enotdir: i32,
    eisdir: i32,
    epipe: i32,
    eagain: i32,
    enotempty: i32,
    econnrefused: i32,
}

const DARWIN_ERRNO: ErrnoTable = ErrnoTable {
    eperm: 1,
    enoent: 2,
    eacces: 13,
    eexist: 17,
    enotdir: 20,
    eisdir: 21,
    epipe: 32,
    eagain: 35,
    enotempty: 66,
    econnrefused: 61,
};

const LINUX_ERRNO: ErrnoTable = ErrnoTable {
    eperm: 1,
    enoent: 2,
    eacces: 13,
    eexist: 17,
    enotdir: 20,
    eisdir: 21,
    epipe: 32,
    eagain: 11,
    enotempty: 39,
    econnrefused: 111,
};

impl RpcError {
    /// Map a remote errno to a typed error.
    ///
    /// `context` is usually the path or operation that failed. Unknown OSes
    /// use the Darwin table, which is what the agent family primarily runs on.
    pub fn from_errno(sysname: Sysname, errno: i32, context: impl Into<String>) -> Self {
        let table = match sysname {
            Sysname::Linux => &LINUX_ERRNO,
            Sysname::Darwin | Sysname::Unknown => &DARWIN_ERRNO,
        };
        let context = context.into();

        match errno {
            e if e == table.eperm || e == table.eacces => RpcError::PermissionDenied(context),
            e if e == table.enoent => RpcError::NotFound(context),
            e if e == table.eexist => RpcError::Exists(context),
            e if e == table.enotdir => RpcError::NotADirectory(context),
            e if e == table.eisdir => RpcError::IsADirectory(context),
            e if e == table.epipe => RpcError::BrokenPipe(context),
            e if e == table.eagain => RpcError::ResourceTemporarilyUnavailable(context),
            e if e == table.enotempty => RpcError::DirectoryNotEmpty(context),
            e if e == table.econnrefused => RpcError::ConnectionRefused(context),
            e => RpcError::BadReturnValue(format!("{context} (errno {e})")),
        }
    }

    /// Whether this failure leaves the shared socket in an unknown state.
    ///
    /// Such errors mark the connection for reconnect before the next command.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_)
                | RpcError::ServerDied
                | RpcError::InvalidMagic { .. }
                | RpcError::Protocol(_)
                | RpcError::UnknownMessageId(_)
                | RpcError::UnknownCommand(_)
                | RpcError::ProtobufDecode(_)
                | RpcError::ResourceTemporarilyUnavailable(_)
                | RpcError::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping_darwin() {
        assert!(matches!(
            RpcError::from_errno(Sysname::Darwin, 2, "/tmp/x"),
            RpcError::NotFound(p) if p == "/tmp/x"
        ));
        assert!(matches!(
            RpcError::from_errno(Sysname::Darwin, 66, "d"),
            RpcError::DirectoryNotEmpty(_)
        ));
        assert!(matches!(
            RpcError::from_errno(Sysname::Darwin, 35, "read"),
            RpcError::ResourceTemporarilyUnavailable(_)
        ));
        assert!(matches!(
            RpcError::from_errno(Sysname::Darwin, 13, "f"),
            RpcError::PermissionDenied(_)
        ));
    }

    #[test]
    fn test_errno_mapping_linux_differs() {
        // 39 is ENOTEMPTY on Linux but EDESTADDRREQ on Darwin.
        assert!(matches!(
            RpcError::from_errno(Sysname::Linux, 39, "d"),
            RpcError::DirectoryNotEmpty(_)
        ));
        assert!(matches!(
            RpcError::from_errno(Sysname::Darwin, 39, "d"),
            RpcError::BadReturnValue(_)
        ));
        assert!(matches!(
            RpcError::from_errno(Sysname::Linux, 111, "c"),
            RpcError::ConnectionRefused(_)
        ));
    }

    #[test]
    fn test_unmapped_errno_is_bad_return_value() {
        let err = RpcError::from_errno(Sysname::Linux, 9999, "ioctl");
        assert!(err.to_string().contains("errno 9999"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RpcError::ServerDied.is_fatal_to_connection());
        assert!(!RpcError::NotFound("x".into()).is_fatal_to_connection());
        assert!(!RpcError::Argument("x".into()).is_fatal_to_connection());
    }
}
