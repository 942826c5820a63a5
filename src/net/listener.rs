// TCP listener for inbound replication connections

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::replicator::Replicator;

/// Accepts inbound replication connections and hands each to the
/// replicator on its own task.
pub struct TcpServer {
    addr: SocketAddr,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl TcpServer {
    pub async fn start(addr: SocketAddr, replicator: Arc<Replicator>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let replicator = Arc::clone(&replicator);
                                tokio::spawn(async move {
                                    replicator.serve_connection(stream, peer_addr).await;
                                });
                            }
                            Err(e) => error!("accept error: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        info!("replication listener on {}", local_addr);

        Ok(TcpServer {
            addr: local_addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// The address the server is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shutdown the accept loop
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}
