//! # Session Integration Tests
//!
//! Drive the server over raw TCP to check framing, ordering, isolation
//! between clients, and connection lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use dice_engine::MemoryEngine;
use dice_server::protocol::MAX_INLINE_LEN;
use dice_server::{server, ServerConfig, ServerError};

const IO_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(server::run(listener, engine, config, async move {
            let _ = shutdown_rx.await;
        }));

        TestServer {
            addr,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    async fn stop(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
    }
}

fn config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        shutdown_grace: Duration::from_secs(1),
        ..ServerConfig::default()
    }
}

fn encode(args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

async fn expect(stream: &mut TcpStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for reply")
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&buf),
        String::from_utf8_lossy(expected)
    );
}

async fn send(stream: &mut TcpStream, args: &[&[u8]]) {
    stream.write_all(&encode(args)).await.unwrap();
}

/// Reads one bulk reply and returns its payload.
async fn read_bulk(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = Vec::new();
    loop {
        let byte = timeout(IO_TIMEOUT, stream.read_u8()).await.unwrap().unwrap();
        header.push(byte);
        if header.ends_with(b"\r\n") {
            break;
        }
    }
    assert_eq!(header[0], b'$', "expected bulk reply");
    let len: usize = std::str::from_utf8(&header[1..header.len() - 2])
        .unwrap()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len + 2];
    timeout(IO_TIMEOUT, stream.read_exact(&mut body))
        .await
        .unwrap()
        .unwrap();
    body.truncate(len);
    body
}

async fn info(stream: &mut TcpStream) -> String {
    send(stream, &[b"INFO"]).await;
    String::from_utf8(read_bulk(stream).await).unwrap()
}

/// Asserts nothing more arrives on the stream within a short window.
async fn expect_silence(stream: &mut TcpStream) {
    let mut byte = [0u8; 1];
    let res = timeout(Duration::from_millis(150), stream.read(&mut byte)).await;
    assert!(res.is_err(), "unexpected extra bytes from server");
}

/// Polls INFO until `connected_clients` reaches `count` and returns that INFO.
async fn wait_for_clients(observer: &mut TcpStream, count: usize) -> String {
    let needle = format!("connected_clients:{count}\r\n");
    let mut seen = String::new();
    for _ in 0..100 {
        seen = info(observer).await;
        if seen.contains(&needle) {
            return seen;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("connected_clients never reached {count}: {seen}");
}

async fn expect_closed(stream: &mut TcpStream) {
    let mut byte = [0u8; 1];
    let read = timeout(IO_TIMEOUT, stream.read(&mut byte))
        .await
        .expect("connection was not closed")
        .unwrap_or(0);
    assert_eq!(read, 0);
}

#[tokio::test]
async fn set_on_one_client_is_visible_to_another() {
    let server = TestServer::start(config()).await;
    let mut writer = server.connect().await;
    let mut reader = server.connect().await;

    send(&mut writer, &[b"SET", b"foo", b"bar"]).await;
    expect(&mut writer, b"+OK\r\n").await;

    send(&mut reader, &[b"GET", b"foo"]).await;
    expect(&mut reader, b"$3\r\nbar\r\n").await;

    // Both connections stay usable.
    send(&mut writer, &[b"PING"]).await;
    expect(&mut writer, b"+PONG\r\n").await;
    send(&mut reader, &[b"PING"]).await;
    expect(&mut reader, b"+PONG\r\n").await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn command_split_across_writes_dispatches_once() {
    let server = TestServer::start(config()).await;
    let mut client = server.connect().await;

    let value = vec![b'x'; 570];
    let command = encode(&[b"SET", b"big", &value]);
    assert_eq!(command.len(), 600);

    client.write_all(&command[..256]).await.unwrap();
    client.flush().await.unwrap();
    expect_silence(&mut client).await;
    client.write_all(&command[256..]).await.unwrap();

    expect(&mut client, b"+OK\r\n").await;
    expect_silence(&mut client).await;

    let stats = info(&mut client).await;
    assert!(stats.contains("total_commands_processed:2\r\n"), "{stats}");

    send(&mut client, &[b"GET", b"big"]).await;
    assert_eq!(read_bulk(&mut client).await, value);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn byte_at_a_time_delivery_is_reassembled() {
    let server = TestServer::start(config()).await;
    let mut client = server.connect().await;
    client.set_nodelay(true).unwrap();

    for byte in encode(&[b"ECHO", b"slow"]) {
        client.write_all(&[byte]).await.unwrap();
        client.flush().await.unwrap();
    }
    expect(&mut client, b"$4\r\nslow\r\n").await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn pipelined_commands_reply_in_order() {
    let server = TestServer::start(config()).await;
    let mut client = server.connect().await;

    let mut batch = encode(&[b"SET", b"n", b"1"]);
    batch.extend(encode(&[b"INCR", b"n"]));
    batch.extend(encode(&[b"GET", b"n"]));
    batch.extend(b"PING\r\n");
    client.write_all(&batch).await.unwrap();

    expect(&mut client, b"+OK\r\n:2\r\n$1\r\n2\r\n+PONG\r\n").await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn idle_client_does_not_block_others() {
    let server = TestServer::start(config()).await;

    let mut idle = server.connect().await;
    // Half a command, then nothing.
    idle.write_all(b"*2\r\n$3\r\nGET").await.unwrap();

    let mut active = server.connect().await;
    send(&mut active, &[b"SET", b"k", b"v"]).await;
    expect(&mut active, b"+OK\r\n").await;
    send(&mut active, &[b"GET", b"k"]).await;
    expect(&mut active, b"$1\r\nv\r\n").await;

    idle.write_all(b"\r\n$1\r\nk\r\n").await.unwrap();
    expect(&mut idle, b"$1\r\nv\r\n").await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_command_keeps_connection_open() {
    let server = TestServer::start(config()).await;
    let mut client = server.connect().await;

    send(&mut client, &[b"FLY", b"me", b"to", b"the", b"moon"]).await;
    expect(&mut client, b"-ERR unknown command 'FLY'\r\n").await;

    send(&mut client, &[b"GET"]).await;
    expect(&mut client, b"-ERR wrong number of arguments for 'get' command\r\n").await;

    send(&mut client, &[b"PING"]).await;
    expect(&mut client, b"+PONG\r\n").await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn misframed_request_replies_then_closes() {
    let server = TestServer::start(config()).await;
    let mut bystander = server.connect().await;
    let mut client = server.connect().await;

    client.write_all(b"*1\r\n!3\r\nfoo\r\n").await.unwrap();
    expect(&mut client, b"-ERR Protocol error: expected '$', got '!'\r\n").await;
    expect_closed(&mut client).await;

    send(&mut bystander, &[b"ECHO", b"still here"]).await;
    expect(&mut bystander, b"$10\r\nstill here\r\n").await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_bulk_is_skipped_without_running_its_payload() {
    let server = TestServer::start(ServerConfig {
        max_bulk_len: 10,
        ..config()
    })
    .await;
    let mut client = server.connect().await;
    client.set_nodelay(true).unwrap();

    send(&mut client, &[b"SET", b"keep", b"me"]).await;
    expect(&mut client, b"+OK\r\n").await;

    let payload = b"x\r\nFLUSHDB\r\nPING\r\n\r\n";
    assert_eq!(payload.len(), 20);
    client
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$20\r\n")
        .await
        .unwrap();
    expect_silence(&mut client).await;
    client.write_all(payload).await.unwrap();
    client.write_all(b"\r\n").await.unwrap();

    // Exactly one reply for the rejected request, and nothing from its payload.
    expect(&mut client, b"-ERR Protocol error: invalid bulk length\r\n").await;
    send(&mut client, &[b"DBSIZE"]).await;
    expect(&mut client, b":1\r\n").await;
    send(&mut client, &[b"GET", b"keep"]).await;
    expect(&mut client, b"$2\r\nme\r\n").await;

    let stats = info(&mut client).await;
    assert!(stats.contains("errorstat_protocol:count=1\r\n"), "{stats}");
    assert!(stats.contains("errorstat_command:count=0\r\n"), "{stats}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_inline_request_gets_one_error() {
    let server = TestServer::start(config()).await;
    let mut client = server.connect().await;

    client.write_all(&vec![b'a'; MAX_INLINE_LEN + 1]).await.unwrap();
    expect_silence(&mut client).await;
    client.write_all(b" tail of the same line\r\nPING\r\n").await.unwrap();

    expect(
        &mut client,
        b"-ERR Protocol error: too big inline request\r\n+PONG\r\n",
    )
    .await;
    expect_silence(&mut client).await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unterminated_header_is_bounded() {
    let server = TestServer::start(config()).await;
    let mut bystander = server.connect().await;
    let mut client = server.connect().await;

    let mut header = b"*1".to_vec();
    header.resize(MAX_INLINE_LEN + 1, b'1');
    client.write_all(&header).await.unwrap();

    expect(&mut client, b"-ERR Protocol error: too big count string\r\n").await;
    expect_closed(&mut client).await;

    send(&mut bystander, &[b"PING"]).await;
    expect(&mut bystander, b"+PONG\r\n").await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn eof_mid_frame_closes_without_reply() {
    let server = TestServer::start(config()).await;
    let mut observer = server.connect().await;
    let mut client = server.connect().await;
    wait_for_clients(&mut observer, 2).await;

    client.write_all(b"*2\r\n$3\r\nGET\r\n$1").await.unwrap();
    client.shutdown().await.unwrap();
    expect_closed(&mut client).await;

    let stats = wait_for_clients(&mut observer, 1).await;
    assert!(stats.contains("total_connections_received:2\r\n"), "{stats}");
    assert!(stats.contains("total_error_replies:0\r\n"), "{stats}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn write_failure_ends_session() {
    let server = TestServer::start(config()).await;
    let mut observer = server.connect().await;
    let mut client = server.connect().await;

    let value = vec![b'v'; 1024 * 1024];
    send(&mut client, &[b"SET", b"big", &value]).await;
    expect(&mut client, b"+OK\r\n").await;

    // Far more reply data than the socket buffers hold, never read.
    let mut batch = Vec::new();
    for _ in 0..32 {
        batch.extend(encode(&[b"GET", b"big"]));
    }
    client.write_all(&batch).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    // Abortive close so the blocked server write fails.
    socket2::SockRef::from(&client)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(client);

    wait_for_clients(&mut observer, 1).await;
    send(&mut observer, &[b"PING"]).await;
    expect(&mut observer, b"+PONG\r\n").await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn disconnect_decrements_live_count_once() {
    let server = TestServer::start(config()).await;
    let mut observer = server.connect().await;
    let first = server.connect().await;
    let second = server.connect().await;

    wait_for_clients(&mut observer, 3).await;

    drop(first);
    drop(second);

    let seen = wait_for_clients(&mut observer, 1).await;
    assert!(seen.contains("total_connections_received:3\r\n"), "{seen}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn quit_closes_connection() {
    let server = TestServer::start(config()).await;
    let mut client = server.connect().await;

    send(&mut client, &[b"QUIT"]).await;
    expect(&mut client, b"+OK\r\n").await;
    expect_closed(&mut client).await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn idle_timeout_closes_silent_connections() {
    let server = TestServer::start(ServerConfig {
        idle_timeout: Some(Duration::from_millis(100)),
        ..config()
    })
    .await;
    let mut client = server.connect().await;

    send(&mut client, &[b"PING"]).await;
    expect(&mut client, b"+PONG\r\n").await;
    expect_closed(&mut client).await;

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_not_lost() {
    let server = TestServer::start(config()).await;

    let mut clients = Vec::new();
    for _ in 0..4 {
        let mut stream = server.connect().await;
        clients.push(tokio::spawn(async move {
            for _ in 0..100 {
                send(&mut stream, &[b"INCR", b"hits"]).await;
                let mut reply = Vec::new();
                loop {
                    let byte = stream.read_u8().await.unwrap();
                    reply.push(byte);
                    if reply.ends_with(b"\r\n") {
                        break;
                    }
                }
                assert_eq!(reply[0], b':');
            }
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    let mut check = server.connect().await;
    send(&mut check, &[b"GET", b"hits"]).await;
    expect(&mut check, b"$3\r\n400\r\n").await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_open_sessions() {
    let server = TestServer::start(config()).await;
    let addr = server.addr;
    let mut client = server.connect().await;
    send(&mut client, &[b"PING"]).await;
    expect(&mut client, b"+PONG\r\n").await;

    server.stop().await.unwrap();
    expect_closed(&mut client).await;

    // The listener is gone once `run` returns.
    assert!(TcpStream::connect(addr).await.is_err());
}
