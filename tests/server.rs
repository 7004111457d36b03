//! End-to-end tests for the memcached text protocol.
//!
//! Each test starts a server on an ephemeral port and talks to it over TCP.

use std::sync::Arc;
use std::time::Duration;

use arenacache::cache::Cache;
use arenacache::config::{ServerConfig, StorageConfig};
use arenacache::metrics::Metrics;
use arenacache::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestServer {
    stream: TcpStream,
    cancel: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
    cache: Arc<Cache>,
}

async fn start(server_config: ServerConfig) -> TestServer {
    let cache = Arc::new(Cache::open(&StorageConfig {
        partitions: 4,
        buckets_per_partition: 1024,
        max_bytes: 16 * 1024 * 1024,
        ..StorageConfig::default()
    }));
    let metrics = Arc::new(Metrics::new().unwrap());
    let cancel = CancellationToken::new();
    let server = Arc::new(Server::new(
        server_config,
        cache.clone(),
        metrics,
        cancel.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(server.serve(listener));
    let stream = TcpStream::connect(addr).await.unwrap();

    TestServer {
        stream,
        cancel,
        handle,
        cache,
    }
}

async fn start_default() -> TestServer {
    start(ServerConfig::default()).await
}

impl TestServer {
    /// Send a request and read until the response ends with `terminator`
    async fn send(&mut self, request: &str, terminator: &str) -> String {
        self.stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        while !buf.ends_with(terminator.as_bytes()) {
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .expect("response timed out")
                .unwrap();
            assert!(n > 0, "connection closed, got {:?}", String::from_utf8_lossy(&buf));
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(buf).unwrap()
    }

    async fn line(&mut self, request: &str) -> String {
        self.send(request, "\r\n").await
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_set_get_delete() {
    let mut server = start_default().await;

    assert_eq!(server.line("set greeting 5 0 5\r\nhello\r\n").await, "STORED\r\n");
    assert_eq!(
        server.send("get greeting\r\n", "END\r\n").await,
        "VALUE greeting 5 5\r\nhello\r\nEND\r\n"
    );
    assert_eq!(server.line("delete greeting\r\n").await, "DELETED\r\n");
    assert_eq!(server.line("delete greeting\r\n").await, "NOT_FOUND\r\n");
    assert_eq!(server.send("get greeting\r\n", "END\r\n").await, "END\r\n");

    server.stop().await;
}

#[tokio::test]
async fn test_conditional_storage() {
    let mut server = start_default().await;

    assert_eq!(server.line("add k 0 0 2\r\nv1\r\n").await, "STORED\r\n");
    assert_eq!(server.line("add k 0 0 2\r\nv2\r\n").await, "NOT_STORED\r\n");
    assert_eq!(server.line("replace missing 0 0 1\r\nx\r\n").await, "NOT_STORED\r\n");
    assert_eq!(server.line("append missing 0 0 1\r\nx\r\n").await, "NOT_FOUND\r\n");
    assert_eq!(server.line("append k 0 0 2\r\n-a\r\n").await, "STORED\r\n");
    assert_eq!(server.line("prepend k 0 0 2\r\nb-\r\n").await, "STORED\r\n");
    assert_eq!(
        server.send("get k\r\n", "END\r\n").await,
        "VALUE k 0 6\r\nb-v1-a\r\nEND\r\n"
    );

    server.stop().await;
}

#[tokio::test]
async fn test_gets_and_cas() {
    let mut server = start_default().await;

    server.line("set k 0 0 2\r\nv1\r\n").await;
    let response = server.send("gets k\r\n", "END\r\n").await;
    let header = response.lines().next().unwrap();
    let cas: u64 = header.rsplit(' ').next().unwrap().parse().unwrap();

    assert_eq!(
        server.line(&format!("cas k 0 0 2 {}\r\nv2\r\n", cas + 1000)).await,
        "EXISTS\r\n"
    );
    assert_eq!(server.send("get k\r\n", "END\r\n").await, "VALUE k 0 2\r\nv1\r\nEND\r\n");

    assert_eq!(
        server.line(&format!("cas k 0 0 2 {cas}\r\nv3\r\n")).await,
        "STORED\r\n"
    );
    assert_eq!(server.line("cas nope 0 0 1 1\r\nx\r\n").await, "NOT_FOUND\r\n");

    server.stop().await;
}

#[tokio::test]
async fn test_incr_decr() {
    let mut server = start_default().await;

    server.line("set n 0 0 1\r\n1\r\n").await;
    assert_eq!(server.line("incr n 5\r\n").await, "6\r\n");
    assert_eq!(server.line("decr n 10\r\n").await, "0\r\n");
    assert_eq!(server.line("incr missing 1\r\n").await, "NOT_FOUND\r\n");

    server.line("set s 0 0 3\r\nabc\r\n").await;
    assert_eq!(
        server.line("incr s 1\r\n").await,
        "CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"
    );

    server.stop().await;
}

#[tokio::test]
async fn test_delete_with_hold() {
    let mut server = start_default().await;

    server.line("set k 0 0 1\r\nv\r\n").await;
    assert_eq!(server.line("delete k 100\r\n").await, "DELETED\r\n");
    assert_eq!(server.send("get k\r\n", "END\r\n").await, "END\r\n");
    assert_eq!(server.line("replace k 0 0 1\r\nx\r\n").await, "NOT_STORED\r\n");
    assert_eq!(server.line("add k 0 0 1\r\nx\r\n").await, "STORED\r\n");

    server.stop().await;
}

#[tokio::test]
async fn test_noreply_and_pipelining() {
    let mut server = start_default().await;

    let response = server
        .send(
            "set a 0 0 1 noreply\r\n1\r\nset b 0 0 1 noreply\r\n2\r\nget a b\r\n",
            "END\r\n",
        )
        .await;
    assert_eq!(response, "VALUE a 0 1\r\n1\r\nVALUE b 0 1\r\n2\r\nEND\r\n");

    server.stop().await;
}

#[tokio::test]
async fn test_data_split_across_reads() {
    let mut server = start_default().await;

    server.stream.write_all(b"set split 0 0 10\r\nhello").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.line("world\r\n").await, "STORED\r\n");
    assert_eq!(
        server.send("get split\r\n", "END\r\n").await,
        "VALUE split 0 10\r\nhelloworld\r\nEND\r\n"
    );

    server.stop().await;
}

#[tokio::test]
async fn test_errors_keep_connection_usable() {
    let mut server = start_default().await;

    assert_eq!(server.line("bogus\r\n").await, "ERROR\r\n");
    assert!(server.line("set k abc 0 1\r\n").await.starts_with("CLIENT_ERROR"));
    assert_eq!(
        server.line("version\r\n").await,
        concat!("VERSION arenacache ", env!("CARGO_PKG_VERSION"), "\r\n")
    );
    assert_eq!(server.line("verbosity 1\r\n").await, "OK\r\n");

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_value_is_discarded() {
    let mut server = start_default().await;

    // Announce 2 MiB and deliver it across several writes
    let size = 2 * 1024 * 1024;
    server
        .stream
        .write_all(format!("set big 0 0 {size}\r\n").as_bytes())
        .await
        .unwrap();
    let chunk = vec![b'x'; size / 4];
    for _ in 0..4 {
        server.stream.write_all(&chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let version = concat!("VERSION arenacache ", env!("CARGO_PKG_VERSION"), "\r\n");
    let response = server.send("\r\nversion\r\n", version).await;
    assert_eq!(response, format!("SERVER_ERROR object too large for cache\r\n{version}"));
    assert_eq!(server.send("get big\r\n", "END\r\n").await, "END\r\n");

    server.stop().await;
}

#[tokio::test]
async fn test_flush_all_and_stats() {
    let mut server = start_default().await;

    server.line("set a 0 0 1\r\n1\r\n").await;
    server.line("set b 0 0 1\r\n2\r\n").await;

    let stats = server.send("stats\r\n", "END\r\n").await;
    assert!(stats.contains("STAT curr_items 2\r\n"));
    assert!(stats.contains("STAT cmd_set 2\r\n"));
    assert!(stats.contains("STAT curr_connections 1\r\n"));
    assert!(stats.contains("STAT limit_maxbytes "));

    let keys = server.send("stats keys\r\n", "END\r\n").await;
    assert_eq!(keys, "STAT key a\r\nSTAT key b\r\nEND\r\n");

    assert_eq!(server.line("flush_all\r\n").await, "OK\r\n");
    assert_eq!(server.send("get a b\r\n", "END\r\n").await, "END\r\n");
    assert!(server.cache.storage().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_delayed_flush() {
    let mut server = start_default().await;

    server.line("set a 0 0 1\r\n1\r\n").await;
    assert_eq!(server.line("flush_all 1\r\n").await, "OK\r\n");
    assert_eq!(server.send("get a\r\n", "END\r\n").await, "VALUE a 0 1\r\n1\r\nEND\r\n");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(server.send("get a\r\n", "END\r\n").await, "END\r\n");

    server.stop().await;
}

#[tokio::test]
async fn test_quit_closes_connection() {
    let mut server = start_default().await;

    server.stream.write_all(b"quit\r\n").await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), server.stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_idle_timeout() {
    let mut server = start(ServerConfig {
        connection_timeout_secs: 1,
        ..ServerConfig::default()
    })
    .await;

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), server.stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    server.stop().await;
}
