// Replication driver
// Top level glue: owns the plot store and the reconciler, drives inbound
// connections handed over by the listener, pushes the store to peers on a
// timer, and runs the periodic reconciliation pass.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::crypto::SharedKey;
use crate::net::peer::{ConnState, PeerConn};
use crate::net::socket::TokioSocket;
use crate::plotdb::PlotDb;
use crate::reconcile::Reconciler;
use crate::skews::NodeId;

/// Abort a handshake that makes no progress for this long.
const EXCHANGE_TIMEOUT_SECS: u64 = 15;

/// Periodic status log interval.
const STATUS_INTERVAL_SECS: u64 = 60;

/// Owns the shared state of one node and wires connections to it.
pub struct Replicator {
    node_id: NodeId,
    db: Arc<PlotDb>,
    reconciler: Mutex<Reconciler>,
    key: Arc<SharedKey>,
    peers: Vec<String>,
}

impl Replicator {
    pub fn new(node_id: NodeId, key: SharedKey, peers: Vec<String>) -> Self {
        Replicator {
            node_id,
            db: Arc::new(PlotDb::new()),
            reconciler: Mutex::new(Reconciler::new()),
            key: Arc::new(key),
            peers,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn db(&self) -> &PlotDb {
        &self.db
    }

    /// Run one reconciliation pass over the store.
    pub fn reconcile_now(&self) {
        self.reconciler.lock().unwrap().reconcile(&self.db);
    }

    /// (plot count, known skew edges, current leader) for status output.
    pub fn status(&self) -> (usize, usize, Option<NodeId>) {
        let reconciler = self.reconciler.lock().unwrap();
        (self.db.len(), reconciler.skews().len(), reconciler.leader())
    }

    /// Drive one inbound connection to completion and ingest its payload.
    pub async fn serve_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        debug!(%peer_addr, "inbound replication connection");
        let socket = TokioSocket::new(stream);
        let mut conn = PeerConn::server(socket, self.node_id, self.key.clone());

        match timeout(Duration::from_secs(EXCHANGE_TIMEOUT_SECS), drive(&mut conn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%peer_addr, error = %e, "inbound connection failed");
                conn.disconnect();
                return;
            }
            Err(_) => {
                warn!(%peer_addr, "replication exchange timed out");
                conn.disconnect();
                return;
            }
        }

        if conn.state() == ConnState::HasData {
            if let Some(payload) = conn.take_received() {
                match self.db.ingest_bytes(&payload) {
                    Ok(count) => {
                        info!(peer = ?conn.peer_id(), count, "ingested replicated plots");
                    }
                    Err(e) => {
                        warn!(peer = ?conn.peer_id(), error = %e, "discarding bad replication payload");
                    }
                }
            }
            conn.disconnect();
        }
    }

    /// Push the current store to every configured peer. Best effort:
    /// failures are logged and the next interval retries from scratch.
    pub async fn replicate_once(&self) {
        if self.db.is_empty() {
            debug!("nothing to replicate");
            return;
        }
        let payload = self.db.snapshot_bytes();
        for peer in &self.peers {
            if let Err(e) = self.push_to_peer(peer, &payload).await {
                warn!(peer, error = %e, "replication push failed");
            }
        }
    }

    async fn push_to_peer(&self, addr: &str, payload: &[u8]) -> io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        let socket = TokioSocket::new(stream);
        let mut conn = PeerConn::client(socket, self.node_id, self.key.clone(), payload);

        timeout(Duration::from_secs(EXCHANGE_TIMEOUT_SECS), drive(&mut conn))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "replication exchange timed out"))??;

        if let Some(e) = conn.last_error() {
            return Err(io::Error::new(io::ErrorKind::Other, e.to_string()));
        }
        debug!(peer = ?conn.peer_id(), "replication push acknowledged");
        Ok(())
    }

    /// Periodic loop: reconcile, replicate, and log status on their own
    /// intervals until the task is dropped at shutdown.
    pub async fn run(self: Arc<Self>, reconcile_secs: u64, replicate_secs: u64) {
        let mut reconcile_tick = interval(Duration::from_secs(reconcile_secs.max(1)));
        let mut replicate_tick = interval(Duration::from_secs(replicate_secs.max(1)));
        let mut status_tick = interval(Duration::from_secs(STATUS_INTERVAL_SECS));

        // Intervals fire immediately on the first tick; swallow those
        reconcile_tick.tick().await;
        replicate_tick.tick().await;
        status_tick.tick().await;

        loop {
            tokio::select! {
                _ = reconcile_tick.tick() => {
                    self.reconcile_now();
                }
                _ = replicate_tick.tick() => {
                    self.replicate_once().await;
                }
                _ = status_tick.tick() => {
                    let (plots, edges, leader) = self.status();
                    info!(plots, edges, ?leader, "status");
                }
            }
        }
    }
}

/// Pump a connection until it settles: process what is buffered, then wait
/// for the socket to become readable again.
async fn drive(conn: &mut PeerConn<TokioSocket>) -> io::Result<()> {
    loop {
        conn.handle_connection();
        if conn.is_settled() {
            return Ok(());
        }
        conn.socket().readable().await?;
    }
}
