use std::path::PathBuf;

use clap::Parser;

/// Drone plot replication node
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Numeric identifier of this receiver node.
    #[arg(long)]
    pub node_id: i32,

    /// Listen address for inbound replication connections.
    #[arg(long, default_value = "0.0.0.0:9071", value_name = "ADDR")]
    pub listen: String,

    /// Peer node to replicate to; repeat for multiple peers.
    #[arg(long, value_name = "HOST:PORT")]
    pub peer: Vec<String>,

    /// Path to the hex-encoded pre-shared AES key (generated if missing).
    #[arg(long, value_name = "FILE")]
    pub key_file: PathBuf,

    /// Binary plot snapshot, loaded at startup and rewritten at shutdown.
    #[arg(long, value_name = "FILE")]
    pub db_file: Option<PathBuf>,

    /// Import plots from a CSV file at startup.
    #[arg(long, value_name = "FILE")]
    pub load_csv: Option<PathBuf>,

    /// Export the plot database to a CSV file at shutdown.
    #[arg(long, value_name = "FILE")]
    pub write_csv: Option<PathBuf>,

    /// Seconds between replication pushes to peers.
    #[arg(long, default_value_t = 30)]
    pub replicate_interval: u64,

    /// Seconds between reconciliation passes.
    #[arg(long, default_value_t = 15)]
    pub reconcile_interval: u64,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}
