//! Channel module - pairing commands with their replies.
//!
//! Three strategies, one per wire generation family:
//! - [`ExclusiveChannel`]: same-socket 1:1 replies under a lock (A, B)
//! - [`EphemeralChannel`]: a fresh reply socket per command (A variant)
//! - [`MuxChannel`]: message-id tagged replies routed by a background reader (C)

mod ephemeral;
mod exclusive;
mod mux;
mod reply;

pub use ephemeral::EphemeralChannel;
pub use exclusive::ExclusiveChannel;
pub use mux::{MuxChannel, PendingRegistry};
pub use reply::{read_reply, status_reply};
