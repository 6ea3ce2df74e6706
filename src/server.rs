//!
//! deplex TCP server
//! -----------------
//! Plain-text, newline-terminated protocol frontend. The accept loop hands
//! each inbound connection to an independent tokio task; the task reads one
//! line at a time, decodes it, dispatches to the shared [`PackageIndex`] and
//! writes back exactly one of `OK`, `FAIL` or `ERROR`. The reply is flushed
//! before the next line is read, so replies on one connection are strictly
//! ordered; lines from different connections interleave arbitrarily.
//!
//! Responsibilities:
//! - Per-connection request loop with connection/message ids for log
//!   correlation.
//! - Malformed lines answer `ERROR` and leave the connection open.
//! - Transport errors (peer reset, EOF mid-line) end that one connection at
//!   debug level without disturbing other clients.
//! - Graceful stop: close the listening socket, signal request tasks to exit
//!   after their current reply, and wait for them within a bounded grace
//!   period.
//!
//! [`PackageIndex`]: crate::index::PackageIndex

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::index::SharedIndex;
use crate::proto::{self, Command};

static CONN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A bound but not yet running index server.
pub struct IndexServer {
    listener: TcpListener,
    index: SharedIndex,
}

/// Handle to a running server; used to stop it.
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    active: Arc<AtomicUsize>,
}

impl IndexServer {
    /// Bind the listening socket. Fails fast on an unresolvable address or an
    /// occupied port, before any connection is accepted.
    pub async fn bind(bind: &str, index: SharedIndex) -> Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        info!(target: "deplex::server", "listening on {}", listener.local_addr()?);
        Ok(Self { listener, index })
    }

    /// The actual bound address (useful when binding port 0 in tests).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawn the accept loop and return a stop handle.
    pub fn start(self) -> ServerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));
        let accept_task =
            tokio::spawn(accept_loop(self.listener, self.index, shutdown_rx, active.clone()));
        ServerHandle { shutdown, accept_task, active }
    }
}

impl ServerHandle {
    /// Stop accepting, close the listening socket and wait up to `grace` for
    /// in-flight request tasks to finish their current reply.
    pub async fn stop(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;
        let deadline = Instant::now() + grace;
        while self.active.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let leftover = self.active.load(Ordering::Acquire);
        if leftover > 0 {
            debug!(target: "deplex::server", "stopped with {} connection task(s) still draining", leftover);
        }
    }
}

/// Decrements the live-connection counter when a request task exits, on every
/// exit path.
struct ConnGuard(Arc<AtomicUsize>);

impl ConnGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn accept_loop(
    listener: TcpListener,
    index: SharedIndex,
    mut shutdown: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    error!(target: "deplex::server", "accept failed: {}", e);
                    continue;
                }
            },
        };
        let conn_id = CONN_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        debug!(target: "deplex::server", "conn_id={} accepted from {}", conn_id, peer);
        let index = index.clone();
        let conn_shutdown = shutdown.clone();
        let guard = ConnGuard::new(active.clone());
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = handle_conn(socket, index, conn_id, conn_shutdown).await {
                // Transport-level trouble is handled inside; reaching here
                // means the store itself failed (snapshot writeback).
                error!(target: "deplex::server", "conn_id={} fatal store error: {}", conn_id, e);
            }
            debug!(target: "deplex::server", "conn_id={} closed", conn_id);
        });
    }
    // Dropping the listener here closes the socket; no new connections.
}

/// Per-connection request loop: read line, decode, dispatch, reply, flush.
async fn handle_conn(
    socket: TcpStream,
    index: SharedIndex,
    conn_id: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut msg_id: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        line.clear();
        let n = tokio::select! {
            res = reader.read_line(&mut line) => match res {
                Ok(n) => n,
                Err(e) => {
                    debug!(target: "deplex::server", "conn_id={} read error: {}", conn_id, e);
                    break;
                }
            },
            _ = shutdown.changed() => break,
        };
        if n == 0 {
            break; // EOF, peer closed
        }
        let request_line = line.trim_end_matches(|c| c == '\n' || c == '\r');
        if request_line.is_empty() {
            break;
        }
        msg_id += 1;
        debug!(target: "deplex::server", "conn_id={} msg_id={} received: {}", conn_id, msg_id, request_line);

        let reply = match proto::decode(request_line) {
            Err(e) => {
                debug!(target: "deplex::server", "conn_id={} msg_id={} rejected: {}", conn_id, msg_id, e);
                "ERROR"
            }
            Ok(req) => {
                let outcome = match req.command {
                    Command::Index => index.index(&req.package, &req.deps)?,
                    Command::Remove => index.remove(&req.package)?,
                    Command::Query => index.query(&req.package)?,
                };
                if outcome {
                    "OK"
                } else {
                    "FAIL"
                }
            }
        };

        if let Err(e) = write_reply(&mut write_half, reply).await {
            debug!(target: "deplex::server", "conn_id={} write error: {}", conn_id, e);
            break;
        }
        debug!(target: "deplex::server", "conn_id={} msg_id={} sent: {}", conn_id, msg_id, reply);
    }
    Ok(())
}

async fn write_reply(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    token: &str,
) -> std::io::Result<()> {
    write_half.write_all(token.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await
}
