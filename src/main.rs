// dronesync - Main Entry Point
// Replication node for a fleet of drone-tracking receivers

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use dronesync::config::Config;
use dronesync::crypto::SharedKey;
use dronesync::net::listener::TcpServer;
use dronesync::replicator::Replicator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    init_logging(config.verbose);

    info!("Starting replication node {}", config.node_id);

    let key = SharedKey::load_or_generate(&config.key_file)?;
    let replicator = Arc::new(Replicator::new(config.node_id, key, config.peer.clone()));

    // Recover persisted plots before accepting traffic
    if let Some(db_file) = &config.db_file {
        if db_file.exists() {
            let count = replicator.db().load_binary(db_file)?;
            info!("Loaded {} plots from {}", count, db_file.display());
        }
    }
    if let Some(csv) = &config.load_csv {
        let count = replicator.db().load_csv(csv)?;
        info!("Imported {} plots from {}", count, csv.display());
    }

    let listen_addr = config.listen.parse()?;
    let mut server = TcpServer::start(listen_addr, replicator.clone()).await?;

    // Periodic reconcile / replicate / status loop
    let runner = replicator.clone();
    let periodic = tokio::spawn(async move {
        runner
            .run(config.reconcile_interval, config.replicate_interval)
            .await;
    });

    info!("Node ready");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal (Ctrl+C)"),
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            return Err(err.into());
        }
    }

    info!("Shutting down...");
    periodic.abort();
    server.shutdown().await;

    // One last pass so the snapshot on disk is reconciled
    replicator.reconcile_now();

    if let Some(db_file) = &config.db_file {
        match replicator.db().write_binary(db_file) {
            Ok(count) => info!("Wrote {} plots to {}", count, db_file.display()),
            Err(e) => error!("Failed to write {}: {}", db_file.display(), e),
        }
    }
    if let Some(csv) = &config.write_csv {
        match replicator.db().write_csv(csv) {
            Ok(count) => info!("Exported {} plots to {}", count, csv.display()),
            Err(e) => error!("Failed to write {}: {}", csv.display(), e),
        }
    }

    let (plots, edges, leader) = replicator.status();
    info!(plots, edges, ?leader, "Node stopped");

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
