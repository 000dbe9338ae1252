//! Generation C protobuf messages.
//!
//! Every message travels inside an [`RpcMessage`] envelope, framed as
//! `len:u64 LE | protobuf bytes`. Replies reuse the request's id shifted by
//! [`msg_id::RPC_MAX_REQ_MSG_ID`]; errors use [`msg_id::REP_ERROR`] with a
//! [`ReplyError`] payload.

/// Message ids. Replies are `request + RPC_MAX_REQ_MSG_ID`.
pub mod msg_id {
    pub const EXEC: u32 = 1;
    pub const DLOPEN: u32 = 2;
    pub const DLCLOSE: u32 = 3;
    pub const DLSYM: u32 = 4;
    pub const CALL: u32 = 5;
    pub const PEEK: u32 = 6;
    pub const POKE: u32 = 7;
    pub const DUMMY_BLOCK: u32 = 8;
    pub const LISTDIR: u32 = 9;
    pub const SHOW_OBJECT: u32 = 10;
    pub const SHOW_CLASS: u32 = 11;
    pub const CLOSE_CLIENT: u32 = 12;

    /// Upper bound of the request id space.
    pub const RPC_MAX_REQ_MSG_ID: u32 = 100;

    /// Error reply, valid for any request.
    pub const REP_ERROR: u32 = 2 * RPC_MAX_REQ_MSG_ID;

    /// Reply id expected for a request id.
    pub const fn reply_for(request: u32) -> u32 {
        request + RPC_MAX_REQ_MSG_ID
    }

    /// Whether `id` is a known request id.
    pub const fn is_request(id: u32) -> bool {
        id >= EXEC && id <= CLOSE_CLIENT
    }

    /// Whether `id` is a known reply id (error reply included).
    pub const fn is_reply(id: u32) -> bool {
        id == REP_ERROR || is_request(id.wrapping_sub(RPC_MAX_REQ_MSG_ID))
    }
}

/// Sent by the server immediately after accept.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Handshake {
    #[prost(uint32, tag = "1")]
    pub magic: u32,
    #[prost(uint32, tag = "2")]
    pub client_id: u32,
    #[prost(string, tag = "3")]
    pub sysname: String,
    #[prost(string, tag = "4")]
    pub machine: String,
    #[prost(uint32, tag = "5")]
    pub arch: u32,
    #[prost(string, tag = "6")]
    pub platform: String,
}

/// Envelope for every request and reply after the handshake.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcMessage {
    #[prost(uint32, tag = "1")]
    pub client_id: u32,
    #[prost(uint32, tag = "2")]
    pub msg_id: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReplyError {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqExec {
    #[prost(bool, tag = "1")]
    pub background: bool,
    #[prost(string, repeated, tag = "2")]
    pub argv: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub envp: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepExec {
    #[prost(uint32, tag = "1")]
    pub pid: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqDlopen {
    #[prost(string, tag = "1")]
    pub filename: String,
    #[prost(uint32, tag = "2")]
    pub mode: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepDlopen {
    #[prost(uint64, tag = "1")]
    pub handle: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqDlclose {
    #[prost(uint64, tag = "1")]
    pub handle: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepDlclose {
    #[prost(uint64, tag = "1")]
    pub res: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqDlsym {
    #[prost(uint64, tag = "1")]
    pub handle: u64,
    #[prost(string, tag = "2")]
    pub symbol_name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepDlsym {
    #[prost(uint64, tag = "1")]
    pub ptr: u64,
}

/// Call argument. `kind` is 0 for integer registers and 1 for FP registers;
/// `value` holds raw bits.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Argument {
    #[prost(uint64, tag = "1")]
    pub kind: u64,
    #[prost(uint64, tag = "2")]
    pub value: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqCall {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint64, tag = "2")]
    pub va_list_index: u64,
    #[prost(message, repeated, tag = "3")]
    pub argv: Vec<Argument>,
}

/// ARM64 return registers; `d` holds raw bits.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReturnRegisters {
    #[prost(uint64, repeated, tag = "1")]
    pub x: Vec<u64>,
    #[prost(uint64, repeated, tag = "2")]
    pub d: Vec<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepCall {
    #[prost(uint64, tag = "1")]
    pub return_value: u64,
    #[prost(message, optional, tag = "2")]
    pub arm_registers: Option<ReturnRegisters>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqPeek {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint64, tag = "2")]
    pub size: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepPeek {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqPoke {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepPoke {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqDummyBlock {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepDummyBlock {
    #[prost(uint64, tag = "1")]
    pub address: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqListDir {
    #[prost(string, tag = "1")]
    pub path: String,
}

/// Directory entry; `lstat` and `stat` carry raw Darwin `stat64` bytes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoDirEntry {
    #[prost(uint64, tag = "1")]
    pub d_type: u64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(bytes = "vec", tag = "3")]
    pub lstat: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub stat: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepListDir {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<ProtoDirEntry>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqShowObject {
    #[prost(uint64, tag = "1")]
    pub address: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqShowClass {
    #[prost(uint64, tag = "1")]
    pub address: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepDescription {
    #[prost(string, tag = "1")]
    pub description: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReqCloseClient {}

#[cfg(test)]
mod tests {
    use super::msg_id::*;
    use super::*;
    use crate::codec::ProtoCodec;

    #[test]
    fn test_reply_id_offset() {
        assert_eq!(reply_for(PEEK), 106);
        assert_eq!(reply_for(CLOSE_CLIENT), 112);
        assert_eq!(REP_ERROR, 200);
    }

    #[test]
    fn test_id_partitions() {
        assert!(is_request(EXEC));
        assert!(!is_request(0));
        assert!(!is_request(reply_for(EXEC)));
        assert!(is_reply(reply_for(SHOW_CLASS)));
        assert!(is_reply(REP_ERROR));
        assert!(!is_reply(PEEK));
        assert!(!is_reply(150));
    }

    #[test]
    fn test_envelope_carries_payload() {
        let inner = ReqDlsym {
            handle: u64::MAX - 1,
            symbol_name: "getpid".into(),
        };
        let env = RpcMessage {
            client_id: 9,
            msg_id: DLSYM,
            payload: ProtoCodec::encode(&inner),
        };
        let decoded: RpcMessage = ProtoCodec::decode(&ProtoCodec::encode(&env)).unwrap();
        assert_eq!(decoded.msg_id, DLSYM);
        let inner_back: ReqDlsym = ProtoCodec::decode(&decoded.payload).unwrap();
        assert_eq!(inner_back, inner);
    }

    #[test]
    fn test_call_registers_optional() {
        let rep = RepCall {
            return_value: 5,
            arm_registers: None,
        };
        let back: RepCall = ProtoCodec::decode(&ProtoCodec::encode(&rep)).unwrap();
        assert!(back.arm_registers.is_none());

        let rep = RepCall {
            return_value: 0,
            arm_registers: Some(ReturnRegisters {
                x: vec![1, 2, 3, 4, 5, 6, 7, 8],
                d: vec![1.0f64.to_bits(); 8],
            }),
        };
        let back: RepCall = ProtoCodec::decode(&ProtoCodec::encode(&rep)).unwrap();
        assert_eq!(back, rep);
    }
}
