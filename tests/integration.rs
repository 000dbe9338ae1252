//! Integration tests for rpcwire-client.
//!
//! Each test attaches a [`Client`] to an in-memory fake agent and checks the
//! bytes that cross the wire.

use std::collections::HashMap;

use rpcwire_client::channel::status_reply;
use rpcwire_client::codec::ProtoCodec;
use rpcwire_client::protocol::legacy::{fixed_prefix_len, LegacyCmdType, LegacyCommand};
use rpcwire_client::protocol::proto::{self, msg_id};
use rpcwire_client::protocol::tagged::{TaggedCmdType, TaggedCommand};
use rpcwire_client::protocol::{Chunk, LegacyHandshake, SERVER_MAGIC_VERSION};
use rpcwire_client::transport::{FrameTransport, TransportOptions};
use rpcwire_client::{
    args, Client, ClientConfig, ProtocolVersion, ReplyMode, RpcError, SpawnOutcome, SpawnRequest,
};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

const MALLOC: u64 = 0x5000;
const FREE: u64 = 0x6000;
const TARGET: u64 = 0x7000;
const BLOCK: u64 = 0x9000;

fn handshake(magic: u32) -> Vec<u8> {
    LegacyHandshake {
        magic,
        arch: 0,
        sysname: "Darwin".into(),
        machine: "x86_64".into(),
    }
    .encode()
    .unwrap()
    .to_vec()
}

async fn read_more(sock: &mut DuplexStream, buf: &mut Vec<u8>, n: usize) {
    let start = buf.len();
    buf.resize(start + n, 0);
    sock.read_exact(&mut buf[start..]).await.unwrap();
}

fn tail_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes(buf[buf.len() - 8..].try_into().unwrap())
}

fn tail_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[buf.len() - 4..].try_into().unwrap())
}

/// Read one generation B command, or `None` once the client hangs up.
async fn read_tagged(sock: &mut DuplexStream) -> Option<TaggedCommand> {
    let mut buf = vec![0u8; 8];
    if sock.read_exact(&mut buf).await.is_err() {
        return None;
    }
    let cmd_type = TaggedCmdType::try_from(tail_u32(&buf)).unwrap();
    match cmd_type {
        TaggedCmdType::Dlopen => read_more(sock, &mut buf, 1024 + 4).await,
        TaggedCmdType::Dlclose | TaggedCmdType::ShowObject | TaggedCmdType::ShowClass => {
            read_more(sock, &mut buf, 8).await
        }
        TaggedCmdType::Dlsym => read_more(sock, &mut buf, 8 + 1024).await,
        TaggedCmdType::Call => {
            read_more(sock, &mut buf, 24).await;
            let argc = tail_u64(&buf) as usize;
            read_more(sock, &mut buf, argc * 16).await;
        }
        TaggedCmdType::Peek => read_more(sock, &mut buf, 16).await,
        TaggedCmdType::Poke => {
            read_more(sock, &mut buf, 16).await;
            let len = tail_u64(&buf) as usize;
            read_more(sock, &mut buf, len).await;
        }
        TaggedCmdType::Listdir => read_more(sock, &mut buf, 1024).await,
        TaggedCmdType::Exec => {
            read_more(sock, &mut buf, 1).await;
            for _ in 0..2 {
                read_more(sock, &mut buf, 4).await;
                for _ in 0..tail_u32(&buf) {
                    read_more(sock, &mut buf, 4).await;
                    let len = tail_u32(&buf) as usize;
                    read_more(sock, &mut buf, len).await;
                }
            }
        }
        TaggedCmdType::GetDummyBlock | TaggedCmdType::Close => {}
        other => panic!("client sent reply discriminant {other:?}"),
    }
    Some(TaggedCommand::decode(&buf).unwrap())
}

/// Generation B agent: handshake, then answer every command with `handler`
/// until the client disconnects. Returns every command received.
fn tagged_agent<H>(mut handler: H) -> (DuplexStream, JoinHandle<Vec<TaggedCommand>>)
where
    H: FnMut(&TaggedCommand) -> Vec<u8> + Send + 'static,
{
    let (client_end, mut agent) = duplex(256 * 1024);
    let task = tokio::spawn(async move {
        agent.write_all(&handshake(SERVER_MAGIC_VERSION)).await.unwrap();
        let mut log = Vec::new();
        while let Some(cmd) = read_tagged(&mut agent).await {
            let reply = handler(&cmd);
            if !reply.is_empty() && agent.write_all(&reply).await.is_err() {
                break;
            }
            log.push(cmd);
        }
        log
    });
    (client_end, task)
}

/// Symbols and heap behaviour shared by the libc-style tests.
fn libc_handler(
    symbols: HashMap<&'static str, u64>,
    mut on_call: impl FnMut(u64, &[u64]) -> u64 + Send + 'static,
) -> impl FnMut(&TaggedCommand) -> Vec<u8> + Send + 'static {
    move |cmd| match cmd {
        TaggedCommand::Dlsym { symbol_name, .. } => symbols
            .get(symbol_name.as_str())
            .copied()
            .unwrap_or(0)
            .to_le_bytes()
            .to_vec(),
        TaggedCommand::Call { address, args, .. } => {
            let words: Vec<u64> = args.iter().map(|a| a.value).collect();
            let ret = match *address {
                MALLOC => BLOCK,
                FREE => 0,
                other => on_call(other, &words),
            };
            ret.to_le_bytes().to_vec()
        }
        TaggedCommand::Poke { .. } => status_reply(TaggedCmdType::ReplyPoke, b"").to_vec(),
        other => panic!("unexpected command {other:?}"),
    }
}

fn libc_symbols() -> HashMap<&'static str, u64> {
    HashMap::from([("malloc", MALLOC), ("free", FREE)])
}

fn calls_to(log: &[TaggedCommand], target: u64) -> Vec<Vec<u64>> {
    log.iter()
        .filter_map(|cmd| match cmd {
            TaggedCommand::Call { address, args, .. } if *address == target => {
                Some(args.iter().map(|a| a.value).collect())
            }
            _ => None,
        })
        .collect()
}

async fn tagged_client(stream: DuplexStream) -> Client {
    Client::connect_over(Box::new(stream), ClientConfig::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_handshake_platform_is_surfaced() {
    let (stream, agent) = tagged_agent(|_| Vec::new());
    let client = tagged_client(stream).await;
    assert_eq!(client.protocol(), ProtocolVersion::Tagged);
    assert_eq!(client.platform().sysname_raw, "Darwin");
    assert_eq!(client.client_id(), None);
    drop(client);
    assert!(agent.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bad_magic_rejected_before_any_command() {
    let (client_end, mut agent) = duplex(64 * 1024);
    let task = tokio::spawn(async move {
        agent.write_all(&handshake(0xdead_beef)).await.unwrap();
        let mut rest = Vec::new();
        agent.read_to_end(&mut rest).await.unwrap();
        rest
    });

    let err = Client::connect_over(Box::new(client_end), ClientConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::InvalidServerVersionMagic {
            expected: SERVER_MAGIC_VERSION,
            actual: 0xdead_beef
        }
    ));
    assert!(task.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_peeks_are_never_interleaved() {
    let (stream, agent) = tagged_agent(|cmd| match cmd {
        TaggedCommand::Peek { address, size: 8 } => {
            status_reply(TaggedCmdType::ReplyPeek, &address.to_le_bytes()).to_vec()
        }
        other => panic!("unexpected command {other:?}"),
    });
    let client = tagged_client(stream).await;

    let tasks: Vec<_> = (0..8u64)
        .map(|task| {
            let client = client.clone();
            tokio::spawn(async move {
                for i in 0..25u64 {
                    let nonce = 0x10_0000 + (task << 8) + i;
                    let data = client.peek(nonce, 8).await.unwrap();
                    assert_eq!(&data[..], &nonce.to_le_bytes());
                }
            })
        })
        .collect();
    for t in tasks {
        t.await.unwrap();
    }

    drop(client);
    assert_eq!(agent.await.unwrap().len(), 200);
}

#[tokio::test]
async fn test_concurrent_peeks_over_reply_listeners_never_cross() {
    let (client_end, mut agent) = duplex(256 * 1024);
    let task = tokio::spawn(async move {
        let mut replies = Vec::new();
        let mut buf = vec![0u8; fixed_prefix_len(LegacyCmdType::Peek, true)];
        while agent.read_exact(&mut buf).await.is_ok() {
            let (cmd, port) = LegacyCommand::decode(&buf, true).unwrap();
            let address = match cmd {
                LegacyCommand::Peek { address, size: 8 } => address,
                other => panic!("unexpected command {other:?}"),
            };
            let port = port.unwrap();
            // Answer out of order so callbacks race each other.
            replies.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(address % 7)).await;
                let mut side = tokio::net::TcpStream::connect(("127.0.0.1", port))
                    .await
                    .unwrap();
                side.write_all(&address.to_le_bytes()).await.unwrap();
            }));
        }
        let count = replies.len();
        for reply in replies {
            reply.await.unwrap();
        }
        count
    });

    let config = ClientConfig {
        protocol: ProtocolVersion::Legacy,
        reply_mode: ReplyMode::EphemeralListener,
        ..ClientConfig::default()
    };
    let client = Client::connect_over(Box::new(client_end), config)
        .await
        .unwrap();

    let tasks: Vec<_> = (0..8u64)
        .map(|task| {
            let client = client.clone();
            tokio::spawn(async move {
                for i in 0..25u64 {
                    let nonce = 0x20_0000 + (task << 8) + i;
                    let data = client.peek(nonce, 8).await.unwrap();
                    assert_eq!(&data[..], &nonce.to_le_bytes());
                }
            })
        })
        .collect();
    for t in tasks {
        t.await.unwrap();
    }

    drop(client);
    assert_eq!(task.await.unwrap(), 200);
}

#[tokio::test]
async fn test_string_argument_is_copied_and_freed_once() {
    let (stream, agent) = tagged_agent(libc_handler(libc_symbols(), |address, _| {
        assert_eq!(address, TARGET);
        42
    }));
    let client = tagged_client(stream).await;

    let ret = client.call(TARGET, args!["hello", 7]).await.unwrap();
    assert_eq!(ret.address(), 42);

    drop(ret);
    drop(client);
    let log = agent.await.unwrap();

    assert!(log.iter().any(|cmd| matches!(
        cmd,
        TaggedCommand::Dlsym { lib: 0xffff_ffff_ffff_fffe, symbol_name } if symbol_name == "malloc"
    )));
    assert_eq!(calls_to(&log, MALLOC), vec![vec![6]]);
    assert!(log.iter().any(|cmd| matches!(
        cmd,
        TaggedCommand::Poke { address: BLOCK, data } if &data[..] == b"hello\0"
    )));
    assert_eq!(calls_to(&log, TARGET), vec![vec![BLOCK, 7]]);
    assert_eq!(calls_to(&log, FREE), vec![vec![BLOCK]]);
}

#[tokio::test]
async fn test_temporary_freed_once_when_copy_fails() {
    let mut inner = libc_handler(libc_symbols(), |_, _| panic!("target must not run"));
    let (stream, agent) = tagged_agent(move |cmd| match cmd {
        TaggedCommand::Poke { .. } => status_reply(TaggedCmdType::ReplyError, b"").to_vec(),
        other => inner(other),
    });
    let client = tagged_client(stream).await;

    let err = client
        .call(TARGET, args![&b"\x01\x02\x03"[..]])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Argument(_)));

    drop(client);
    let log = agent.await.unwrap();
    assert!(calls_to(&log, TARGET).is_empty());
    assert_eq!(calls_to(&log, FREE), vec![vec![BLOCK]]);
}

#[tokio::test]
async fn test_malloc_guard_frees_once() {
    let (stream, agent) = tagged_agent(libc_handler(libc_symbols(), |_, _| 0));
    let client = tagged_client(stream).await;

    let block = client.malloc(32).await.unwrap();
    assert_eq!(block.address(), Some(BLOCK));
    block.release().await.unwrap();
    block.release().await.unwrap();
    drop(block);

    drop(client);
    let log = agent.await.unwrap();
    assert_eq!(calls_to(&log, MALLOC), vec![vec![32]]);
    assert_eq!(calls_to(&log, FREE), vec![vec![BLOCK]]);
}

#[tokio::test]
async fn test_calloc_zero_fills_in_bounded_writes() {
    let (stream, agent) = tagged_agent(libc_handler(libc_symbols(), |address, _| {
        panic!("unexpected call to {address:#x}")
    }));
    let client = tagged_client(stream).await;

    let block = client.calloc(150_000).await.unwrap();
    assert_eq!(block.address(), Some(BLOCK));
    block.release().await.unwrap();
    drop(block);

    drop(client);
    let log = agent.await.unwrap();
    let pokes: Vec<(u64, usize)> = log
        .iter()
        .filter_map(|cmd| match cmd {
            TaggedCommand::Poke { address, data } => {
                assert!(data.iter().all(|b| *b == 0));
                Some((*address, data.len()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        pokes,
        vec![
            (BLOCK, 65_536),
            (BLOCK + 65_536, 65_536),
            (BLOCK + 131_072, 18_928),
        ]
    );
    assert_eq!(calls_to(&log, MALLOC), vec![vec![150_000]]);
    assert_eq!(calls_to(&log, FREE), vec![vec![BLOCK]]);
}

#[tokio::test]
async fn test_dlopen_guard_closes_library() {
    let (stream, agent) = tagged_agent(|cmd| match cmd {
        TaggedCommand::Dlopen { filename, mode: 2 } if filename == "/usr/lib/libz.dylib" => {
            0x4242u64.to_le_bytes().to_vec()
        }
        TaggedCommand::Dlclose { lib: 0x4242 } => 0u64.to_le_bytes().to_vec(),
        other => panic!("unexpected command {other:?}"),
    });
    let client = tagged_client(stream).await;

    let lib = client.load_library("/usr/lib/libz.dylib").await.unwrap();
    assert_eq!(lib.address(), Some(0x4242));
    lib.release().await.unwrap();

    drop(client);
    assert_eq!(agent.await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_open_reads_remote_errno() {
    const OPEN: u64 = 0x1100;
    const ERROR_FN: u64 = 0x1200;
    const ERRNO_SLOT: u64 = 0xa000;

    let mut symbols = libc_symbols();
    symbols.insert("open", OPEN);
    symbols.insert("__error", ERROR_FN);
    let mut inner = libc_handler(symbols, |address, _| match address {
        OPEN => u64::MAX,
        ERROR_FN => ERRNO_SLOT,
        other => panic!("unexpected call to {other:#x}"),
    });
    let (stream, agent) = tagged_agent(move |cmd| match cmd {
        TaggedCommand::Peek {
            address: ERRNO_SLOT,
            size: 4,
        } => status_reply(TaggedCmdType::ReplyPeek, &2i32.to_le_bytes()).to_vec(),
        other => inner(other),
    });
    let client = tagged_client(stream).await;

    let err = client.open("/nope", "r").await.unwrap_err();
    assert!(matches!(err, RpcError::NotFound(ref p) if p == "/nope"), "{err:?}");

    drop(client);
    let log = agent.await.unwrap();
    assert_eq!(calls_to(&log, OPEN), vec![vec![BLOCK, 0, 0o644]]);
    assert_eq!(calls_to(&log, FREE), vec![vec![BLOCK]]);
}

#[tokio::test]
async fn test_spawn_relays_output_then_exit_code() {
    let (stream, agent) = tagged_agent(|cmd| match cmd {
        TaggedCommand::Exec {
            background: false,
            argv,
            ..
        } => {
            assert_eq!(argv, &["/bin/echo", "hello", "world"]);
            let mut out = 77u32.to_le_bytes().to_vec();
            out.extend(Chunk::Stdout("hello ".into()).encode());
            out.extend(Chunk::Stdout("world\n".into()).encode());
            out.extend(Chunk::ExitCode(3).encode());
            out
        }
        other => panic!("unexpected command {other:?}"),
    });
    let client = tagged_client(stream).await;

    let mut sink = Vec::new();
    let outcome = client
        .spawn(SpawnRequest::new(["/bin/echo", "hello", "world"]), &mut sink)
        .await
        .unwrap();
    assert_eq!(outcome, SpawnOutcome::Exited { pid: 77, code: 3 });
    assert_eq!(sink, b"hello world\n");

    drop(client);
    agent.await.unwrap();
}

#[tokio::test]
async fn test_spawn_failure_sentinel() {
    let (stream, agent) = tagged_agent(|_| u32::MAX.to_le_bytes().to_vec());
    let client = tagged_client(stream).await;

    let mut sink = Vec::new();
    let err = client
        .spawn(SpawnRequest::new(["/nonexistent"]), &mut sink)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Spawn(_)));
    assert!(sink.is_empty());

    drop(client);
    agent.await.unwrap();
}

#[tokio::test]
async fn test_background_spawn_returns_pid() {
    let (stream, agent) = tagged_agent(|cmd| match cmd {
        TaggedCommand::Exec {
            background: true, ..
        } => 99u32.to_le_bytes().to_vec(),
        other => panic!("unexpected command {other:?}"),
    });
    let client = tagged_client(stream).await;

    assert_eq!(client.spawn_background(["/usr/bin/true"]).await.unwrap(), 99);

    drop(client);
    agent.await.unwrap();
}

/// Read one generation A command on the same socket.
async fn read_legacy(sock: &mut DuplexStream) -> Option<LegacyCommand> {
    let mut buf = vec![0u8; 8];
    if sock.read_exact(&mut buf).await.is_err() {
        return None;
    }
    let cmd_type = LegacyCmdType::try_from(tail_u32(&buf)).unwrap();
    read_more(sock, &mut buf, fixed_prefix_len(cmd_type, false) - 8).await;
    match cmd_type {
        LegacyCmdType::Write | LegacyCmdType::Poke => {
            let len = tail_u64(&buf) as usize;
            read_more(sock, &mut buf, len).await;
        }
        LegacyCmdType::Call => {
            let argc = tail_u64(&buf) as usize;
            read_more(sock, &mut buf, argc * 8).await;
        }
        _ => {}
    }
    Some(LegacyCommand::decode(&buf, false).unwrap().0)
}

#[tokio::test]
async fn test_legacy_pull_uses_native_file_commands() {
    let (client_end, mut agent) = duplex(256 * 1024);
    let task = tokio::spawn(async move {
        let mut reads = 0;
        let mut log = Vec::new();
        while let Some(cmd) = read_legacy(&mut agent).await {
            let reply = match &cmd {
                LegacyCommand::Open { filename, mode: 0 } if filename == "/etc/motd" => {
                    5i64.to_le_bytes().to_vec()
                }
                LegacyCommand::Read { fd: 5, .. } => {
                    reads += 1;
                    if reads == 1 {
                        let mut out = 6i64.to_le_bytes().to_vec();
                        out.extend_from_slice(b"hi all");
                        out
                    } else {
                        0i64.to_le_bytes().to_vec()
                    }
                }
                LegacyCommand::Close { fd: 5 } => 0i64.to_le_bytes().to_vec(),
                other => panic!("unexpected command {other:?}"),
            };
            agent.write_all(&reply).await.unwrap();
            log.push(cmd);
        }
        log
    });

    let config = ClientConfig {
        protocol: ProtocolVersion::Legacy,
        ..ClientConfig::default()
    };
    let client = Client::connect_over(Box::new(client_end), config)
        .await
        .unwrap();
    assert_eq!(client.pull("/etc/motd").await.unwrap(), b"hi all");

    drop(client);
    let log = task.await.unwrap();
    assert_eq!(log.len(), 4);
    assert!(matches!(log[3], LegacyCommand::Close { fd: 5 }));
}

#[tokio::test]
async fn test_legacy_open_error_is_typed() {
    let (client_end, mut agent) = duplex(64 * 1024);
    let task = tokio::spawn(async move {
        while let Some(cmd) = read_legacy(&mut agent).await {
            assert!(matches!(cmd, LegacyCommand::Open { .. }));
            agent.write_all(&(-13i64).to_le_bytes()).await.unwrap();
        }
    });

    let config = ClientConfig {
        protocol: ProtocolVersion::Legacy,
        ..ClientConfig::default()
    };
    let client = Client::connect_over(Box::new(client_end), config)
        .await
        .unwrap();
    let err = client.open("/root/secret", "w").await.unwrap_err();
    assert!(matches!(err, RpcError::PermissionDenied(_)));
    assert!(matches!(
        client.open("/tmp/x", "rw").await,
        Err(RpcError::Argument(_))
    ));

    drop(client);
    task.await.unwrap();
}

#[tokio::test]
async fn test_protobuf_call_error_still_frees_temporary() {
    let (client_end, agent_end) = duplex(256 * 1024);
    let task = tokio::spawn(async move {
        let mut t = FrameTransport::new(agent_end, TransportOptions::default());
        let hs = proto::Handshake {
            magic: SERVER_MAGIC_VERSION,
            client_id: 9,
            sysname: "Linux".into(),
            machine: "aarch64".into(),
            arch: 0,
            platform: String::new(),
        };
        t.send_framed(&ProtoCodec::encode(&hs)).await.unwrap();

        let mut calls = Vec::new();
        while let Ok(frame) = t.recv_framed().await {
            let msg: proto::RpcMessage = ProtoCodec::decode(&frame).unwrap();
            assert_eq!(msg.client_id, 9);
            let (id, payload) = match msg.msg_id {
                msg_id::DLSYM => {
                    let req: proto::ReqDlsym = ProtoCodec::decode(&msg.payload).unwrap();
                    assert_eq!(req.handle, 0, "Linux RTLD_DEFAULT");
                    let ptr = match req.symbol_name.as_str() {
                        "malloc" => MALLOC,
                        "free" => FREE,
                        _ => 0,
                    };
                    (
                        msg_id::reply_for(msg_id::DLSYM),
                        ProtoCodec::encode(&proto::RepDlsym { ptr }),
                    )
                }
                msg_id::POKE => (
                    msg_id::reply_for(msg_id::POKE),
                    ProtoCodec::encode(&proto::RepPoke {}),
                ),
                msg_id::CALL => {
                    let req: proto::ReqCall = ProtoCodec::decode(&msg.payload).unwrap();
                    let args: Vec<u64> = req.argv.iter().map(|a| a.value).collect();
                    calls.push((req.address, args));
                    let value = match req.address {
                        MALLOC => Some(BLOCK),
                        FREE => Some(0),
                        _ => None,
                    };
                    match value {
                        Some(return_value) => (
                            msg_id::reply_for(msg_id::CALL),
                            ProtoCodec::encode(&proto::RepCall {
                                return_value,
                                arm_registers: None,
                            }),
                        ),
                        None => (
                            msg_id::REP_ERROR,
                            ProtoCodec::encode(&proto::ReplyError {
                                message: "segmentation fault".into(),
                            }),
                        ),
                    }
                }
                other => panic!("unexpected message id {other}"),
            };
            let reply = proto::RpcMessage {
                client_id: 9,
                msg_id: id,
                payload,
            };
            t.send_framed(&ProtoCodec::encode(&reply)).await.unwrap();
        }
        calls
    });

    let config = ClientConfig {
        protocol: ProtocolVersion::Protobuf,
        ..ClientConfig::default()
    };
    let client = Client::connect_over(Box::new(client_end), config)
        .await
        .unwrap();
    assert_eq!(client.client_id(), Some(9));

    let err = client.call(TARGET, args!["boom"]).await.unwrap_err();
    assert!(matches!(err, RpcError::ServerResponse(ref m) if m.contains("segmentation")), "{err:?}");

    drop(client);
    let calls = task.await.unwrap();
    assert_eq!(
        calls,
        vec![
            (MALLOC, vec![5]),
            (TARGET, vec![BLOCK]),
            (FREE, vec![BLOCK]),
        ]
    );
}
