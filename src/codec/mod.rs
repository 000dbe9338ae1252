//! Codec module - byte-level encoding for command and reply payloads.
//!
//! - [`WireWriter`] / [`WireReader`] - fixed-layout little-endian structs
//!   matching the agent's C definitions (generations A and B)
//! - [`ProtoCodec`] - protobuf via `prost` (generation C)
//!
//! # Design
//!
//! Codecs are plain structs with inherent methods rather than trait objects,
//! so each protocol generation picks its codec at compile time.

mod protobuf;
mod wire;

pub use protobuf::ProtoCodec;
pub use wire::{nul_terminated_lossy, WireReader, WireWriter};
