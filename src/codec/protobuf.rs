//! Protobuf codec using `prost`, for generation C payloads.
//!
//! # Example
//!
//! ```
//! use rpcwire_client::codec::ProtoCodec;
//! use rpcwire_client::protocol::proto::ReqPeek;
//!
//! let req = ReqPeek { address: 0x1000, size: 16 };
//! let encoded = ProtoCodec::encode(&req);
//! let decoded: ReqPeek = ProtoCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, req);
//! ```

use crate::error::Result;

/// Protobuf codec for generation C messages.
pub struct ProtoCodec;

impl ProtoCodec {
    /// Encode a message to protobuf bytes.
    #[inline]
    pub fn encode<M: prost::Message>(msg: &M) -> Vec<u8> {
        msg.encode_to_vec()
    }

    /// Decode protobuf bytes to a message.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid encoding of `M`.
    #[inline]
    pub fn decode<M: prost::Message + Default>(bytes: &[u8]) -> Result<M> {
        Ok(M::decode(bytes)?)
    }
}
