use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use deplex::index::memory::MemoryIndex;
use deplex::index::{IndexKind, SharedIndex};
use deplex::server::{IndexServer, ServerHandle};

const GRACE: Duration = Duration::from_secs(2);

// Start a server on an ephemeral localhost port around the given store.
async fn start_server(index: SharedIndex) -> (ServerHandle, SocketAddr) {
    let server = IndexServer::bind("127.0.0.1:0", index).await.expect("bind 127.0.0.1:0");
    let addr = server.local_addr().expect("local addr");
    (server.start(), addr)
}

async fn start_memory_server() -> (ServerHandle, SocketAddr) {
    start_server(Arc::new(MemoryIndex::new())).await
}

/// A simple line-protocol client for testing the server.
struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.expect("connect");
        let (read_half, writer) = socket.into_split();
        Self { reader: BufReader::new(read_half), writer }
    }

    /// Send one request line and wait for its reply token.
    async fn send(&mut self, text: &str) -> String {
        self.writer.write_all(format!("{}\n", text).as_bytes()).await.expect("write");
        self.recv().await
    }

    /// Read one reply line; empty string means the server closed the stream.
    async fn recv(&mut self) -> String {
        let mut reply = String::new();
        self.reader.read_line(&mut reply).await.expect("read");
        reply.trim_end().to_string()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_request() {
    let (srv, addr) = start_memory_server().await;
    let mut client = Client::connect(addr).await;
    assert_eq!(client.send("foo").await, "ERROR");
    assert_eq!(client.send("UPDATE|x|").await, "ERROR");
    srv.stop(GRACE).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_leaves_connection_usable() {
    let (srv, addr) = start_memory_server().await;
    let mut client = Client::connect(addr).await;
    assert_eq!(client.send("garbage with spaces").await, "ERROR");
    assert_eq!(client.send("INDEX|mypackage|").await, "OK");
    assert_eq!(client.send("QUERY|mypackage|").await, "OK");
    srv.stop(GRACE).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn index_query_remove_flow() {
    let (srv, addr) = start_memory_server().await;
    let mut client = Client::connect(addr).await;

    // Missing deps on an empty store.
    assert_eq!(client.send("INDEX|cloog|gmp,isl,pkg-config").await, "FAIL");
    // No deps; duplicate INDEX is idempotent.
    assert_eq!(client.send("INDEX|ceylon|").await, "OK");
    assert_eq!(client.send("INDEX|ceylon|").await, "OK");
    // Query reflects presence.
    assert_eq!(client.send("QUERY|missing|").await, "FAIL");
    assert_eq!(client.send("QUERY|ceylon|").await, "OK");
    // Remove of an unindexed package succeeds.
    assert_eq!(client.send("REMOVE|unknown|").await, "OK");

    srv.stop(GRACE).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_blocked_by_dependents() {
    let (srv, addr) = start_memory_server().await;
    let mut client = Client::connect(addr).await;

    assert_eq!(client.send("INDEX|a|").await, "OK");
    assert_eq!(client.send("INDEX|b|a").await, "OK");
    assert_eq!(client.send("REMOVE|a|").await, "FAIL");
    // Removing the dependent first releases the dependency.
    assert_eq!(client.send("REMOVE|b|").await, "OK");
    assert_eq!(client.send("REMOVE|a|").await, "OK");
    assert_eq!(client.send("QUERY|a|").await, "FAIL");

    srv.stop(GRACE).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipelined_lines_get_ordered_replies() {
    let (srv, addr) = start_memory_server().await;
    let mut client = Client::connect(addr).await;

    // Two requests in one write: replies come back one per line, in order.
    client
        .writer
        .write_all(b"INDEX|gmp|\nINDEX|cloog|gmp\n")
        .await
        .expect("write");
    assert_eq!(client.recv().await, "OK");
    assert_eq!(client.recv().await, "OK");
    assert_eq!(client.send("QUERY|cloog|").await, "OK");

    srv.stop(GRACE).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blank_line_closes_the_connection() {
    let (srv, addr) = start_memory_server().await;
    let mut client = Client::connect(addr).await;
    assert_eq!(client.send("INDEX|pkg|").await, "OK");
    client.writer.write_all(b"\n").await.expect("write");
    assert_eq!(client.recv().await, "", "server treats a blank line as a disconnect");

    // Other connections are unaffected.
    let mut other = Client::connect(addr).await;
    assert_eq!(other.send("QUERY|pkg|").await, "OK");

    srv.stop(GRACE).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abrupt_disconnect_leaves_server_healthy() {
    let (srv, addr) = start_memory_server().await;
    {
        let mut doomed = Client::connect(addr).await;
        assert_eq!(doomed.send("INDEX|survivor|").await, "OK");
        // Dropped here without a clean shutdown.
    }
    let mut client = Client::connect(addr).await;
    assert_eq!(client.send("QUERY|survivor|").await, "OK");
    srv.stop(GRACE).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn filesystem_store_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let index = IndexKind::Filesystem.open(tmp.path()).expect("open filesystem store");
    let (srv, addr) = start_server(index).await;
    let mut client = Client::connect(addr).await;

    assert_eq!(client.send("INDEX|gmp|").await, "OK");
    assert_eq!(client.send("INDEX|isl|").await, "OK");
    assert_eq!(client.send("INDEX|cloog|gmp,isl").await, "OK");
    assert_eq!(client.send("REMOVE|gmp|").await, "FAIL");
    assert_eq!(client.send("REMOVE|cloog|").await, "OK");
    assert_eq!(client.send("REMOVE|gmp|").await, "OK");

    assert!(tmp.path().join("forward/i/isl").exists());
    assert!(!tmp.path().join("forward/g/gmp").exists());

    srv.stop(GRACE).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_converge_to_a_consistent_state() {
    let (srv, addr) = start_memory_server().await;
    let clients = 8;

    let mut tasks = Vec::new();
    for i in 0..clients {
        tasks.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            // Idempotent INDEX of the shared dependency: OK from every client
            // regardless of interleaving.
            assert_eq!(client.send("INDEX|libshared|").await, "OK");
            // Per-connection ordering guarantees the dep is visible here.
            assert_eq!(client.send(&format!("INDEX|app{}|libshared", i)).await, "OK");
            assert_eq!(client.send(&format!("QUERY|app{}|", i)).await, "OK");
        }));
    }
    for t in tasks {
        t.await.expect("client task");
    }

    let mut client = Client::connect(addr).await;
    assert_eq!(client.send("QUERY|libshared|").await, "OK");
    // Every dependent is present, so the shared dependency is pinned.
    assert_eq!(client.send("REMOVE|libshared|").await, "FAIL");
    for i in 0..clients {
        assert_eq!(client.send(&format!("REMOVE|app{}|", i)).await, "OK");
    }
    assert_eq!(client.send("REMOVE|libshared|").await, "OK");

    srv.stop(GRACE).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_closes_listener_and_drains() {
    let (srv, addr) = start_memory_server().await;
    let mut client = Client::connect(addr).await;
    assert_eq!(client.send("INDEX|pkg|").await, "OK");

    srv.stop(GRACE).await;

    // The listening socket is gone.
    assert!(TcpStream::connect(addr).await.is_err(), "listener must be closed after stop");
    // The existing connection was signalled to exit after its reply; the
    // next read sees either a clean EOF or a reset, never a reply.
    client.writer.write_all(b"QUERY|pkg|\n").await.ok();
    let mut reply = String::new();
    let closed = matches!(client.reader.read_line(&mut reply).await, Ok(0) | Err(_));
    assert!(closed, "drained connection must be closed, got reply '{}'", reply.trim_end());
}
