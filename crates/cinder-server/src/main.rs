//! cinder-server entry point.

mod config;
mod connection;
mod dispatch;
mod replication;
mod server;

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::ServerConfig;

/// An in-memory multi-database key/value server with snapshot and
/// append-log persistence and master/slave replication.
#[derive(Parser, Debug)]
#[command(name = "cinder-server", version, about)]
struct Args {
    /// Path to a properties-style configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind.
    #[arg(long)]
    host: Option<String>,

    /// Command port.
    #[arg(long)]
    port: Option<u16>,

    /// Data directory for dump.rdb / appendonly.aof.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of SELECT-addressable databases.
    #[arg(long)]
    databases: Option<usize>,

    /// Persistence mode: rdb or aof.
    #[arg(long)]
    persistence: Option<String>,

    /// Append-log fsync policy: always, everysec, or no.
    #[arg(long)]
    appendfsync: Option<String>,

    /// Node id used in replication and gossip.
    #[arg(long)]
    node_id: Option<String>,

    /// Node role: master or slave.
    #[arg(long)]
    node_role: Option<String>,

    /// Master host (slave role).
    #[arg(long)]
    master_host: Option<String>,

    /// Master command port (slave role).
    #[arg(long)]
    master_port: Option<u16>,

    /// Enable the cluster gossip layer.
    #[arg(long)]
    cluster_enabled: bool,

    /// Known slaves as id:host:port,id:host:port,…
    #[arg(long)]
    slave_nodes: Option<String>,
}

fn build_config(args: Args) -> Result<ServerConfig, String> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(count) = args.databases {
        config.database_count = count;
    }
    if let Some(mode) = args.persistence {
        config.persistence_mode = config::parse_persistence_mode(&mode)?;
    }
    if let Some(policy) = args.appendfsync {
        config.aof_fsync = config::parse_fsync_policy(&policy)?;
    }
    if let Some(id) = args.node_id {
        config.node_id = id;
    }
    if let Some(role) = args.node_role {
        config.node_role = config::parse_role(&role)?;
    }
    if let Some(host) = args.master_host {
        config.master_host = host;
    }
    if let Some(port) = args.master_port {
        config.master_port = port;
    }
    if args.cluster_enabled {
        config.cluster_enabled = true;
    }
    if let Some(nodes) = args.slave_nodes {
        config.slave_nodes = config::parse_slave_nodes(&nodes)?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = server::run(config, shutdown_rx).await {
        error!("server failed: {e}");
        std::process::exit(1);
    }
}
