//! Server wiring and the accept loop.
//!
//! `run` assembles every subsystem from the configuration: database
//! manager, replication sync server and puller, optional cluster
//! gossip. It then accepts client connections until the shutdown signal
//! flips. Shutdown stops the timers via the shared watch channel and
//! runs the manager's final persistence step.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cinder_cluster::{
    gossip::{ClusterEvent, GossipConfig, GossipEngine},
    transport, NodeDescriptor, NodeRole,
};
use cinder_core::{time, DbManager};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::connection;
use crate::dispatch::ServerContext;
use crate::replication::{self, PullerConfig, SyncPuller};

/// Runs the server until `shutdown` flips.
pub async fn run(
    config: ServerConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = DbManager::start(config.manager_config()).await?;

    let repl = replication::shared_repl(
        config.node_role,
        config
            .is_slave()
            .then(|| (config.master_host.clone(), config.master_port)),
    );

    // master and slave both serve pulls; a promoted slave needs no rewire
    replication::start_sync_server(Arc::clone(&manager), config.port, shutdown.clone()).await?;

    let puller = SyncPuller::new(
        Arc::clone(&manager),
        Arc::clone(&repl),
        PullerConfig {
            node_id: config.node_id.clone(),
            interval: Duration::from_secs(config.sync_interval),
            connect_timeout: Duration::from_millis(config.sync_connect_timeout),
            read_timeout: Duration::from_millis(config.sync_read_timeout),
        },
    );
    puller.spawn(shutdown.clone());

    if config.cluster_enabled {
        start_cluster(&config, Arc::clone(&repl), shutdown.clone()).await?;
    }

    let ctx = Arc::new(ServerContext {
        manager: Arc::clone(&manager),
        repl,
        cluster_enabled: config.cluster_enabled,
        node_id: config.node_id.clone(),
        port: config.port,
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        %addr,
        shards = manager.shard_count(),
        role = config.node_role.as_str(),
        "cinder server listening"
    );

    let mut shutdown = shutdown;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = connection::handle(stream, ctx).await {
                            error!("connection error from {peer}: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// Builds the gossip engine from configuration, starts the transport,
/// and bridges cluster events into the replication state.
async fn start_cluster(
    config: &ServerConfig,
    repl: replication::SharedRepl,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut local = NodeDescriptor::new(
        &config.node_id,
        &config.host,
        config.port,
        config.node_role,
    );
    if config.is_slave() {
        local.master_id = Some(config.master_id.clone());
    }

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let gossip_config = GossipConfig {
        heartbeat_interval: Duration::from_secs(config.heartbeat_interval),
        status_interval: Duration::from_secs(config.node_status_interval),
        node_timeout: Duration::from_secs(config.node_timeout),
    };
    let mut engine = GossipEngine::new(local, gossip_config, event_tx);

    // seed the registry from configuration
    if config.is_slave() {
        let mut master = NodeDescriptor::new(
            &config.master_id,
            &config.master_host,
            config.master_port,
            NodeRole::Master,
        );
        master.status = cinder_cluster::NodeStatus::Online;
        master.last_heartbeat = time::now_ms();
        engine.add_seed(master);
    }
    for spec in &config.slave_nodes {
        let mut slave = NodeDescriptor::new(&spec.id, &spec.host, spec.port, NodeRole::Slave);
        slave.master_id = Some(config.node_id.clone());
        engine.add_seed(slave);
    }

    let engine = Arc::new(Mutex::new(engine));
    let bind = format!(
        "{}:{}",
        config.host,
        config.port.wrapping_add(transport::GOSSIP_PORT_OFFSET)
    );
    transport::start(engine, bind, shutdown).await?;

    // cluster events rewrite the replication identity
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                ClusterEvent::PromotedToMaster => {
                    info!("failover promoted this node to master");
                    let mut state = repl.write().expect("repl state lock");
                    state.role = NodeRole::Master;
                    state.master = None;
                }
                ClusterEvent::MasterChanged {
                    master_id,
                    host,
                    port,
                } => {
                    info!(master = %master_id, "rebinding replication to new master");
                    let mut state = repl.write().expect("repl state lock");
                    state.role = NodeRole::Slave;
                    state.master = Some((host, port));
                }
                ClusterEvent::NodeOffline(id) => warn!(node = %id, "cluster peer offline"),
                ClusterEvent::NodeSuspected(id) => info!(node = %id, "cluster peer suspect"),
                ClusterEvent::NodeJoined(id) => info!(node = %id, "cluster peer joined"),
            }
        }
    });

    Ok(())
}
