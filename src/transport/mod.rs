//! Transport module - agent connections and message framing.
//!
//! Provides:
//! - [`Endpoint`] and [`connect`] for TCP and Unix domain sockets
//! - [`FrameTransport`] for exact reads, full writes and `u64` length-prefixed frames

mod frame;
mod stream;

pub use frame::{FrameTransport, TransportOptions, DEFAULT_MAX_FRAME_SIZE};
pub use stream::{connect, connect_with_local, AsyncStream, BoxedStream, Endpoint};
