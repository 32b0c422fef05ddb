//! Master/slave replication: full-snapshot pull.
//!
//! The master listens on a dedicated sync port (command port + 11000,
//! falling back to + 11001 when the primary port is taken) and answers
//! each pull request with a serialized image of every shard. The slave
//! runs a periodic pull loop that replaces its shards' contents in
//! place; shard identity, and with it the keyspace event subscribers,
//! survives each pull.
//!
//! # Wire protocol (little-endian)
//!
//! ```text
//! // slave → master:
//! [node_id_len: u32][node_id][last_sync_ts: i64]
//!
//! // master → slave:
//! [payload_len: u32][payload][server_ts: i64]
//!
//! // payload: [shard_count: i32] then per shard
//! //          [entry_count: u32][framed entries…]
//! ```
//!
//! The `last_sync_ts` field is advisory; the master always returns a
//! full image; there is no delta protocol.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use cinder_cluster::NodeRole;
use cinder_core::{time, DbManager};
use cinder_persistence::snapshot;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Sync port = command port + this offset.
pub const SYNC_PORT_OFFSET: u16 = 11000;

/// Connect failures after which logging is rate-limited.
const FAILURE_LOG_THRESHOLD: u32 = 10;

/// Upper bound on a pull response, caps allocations.
const MAX_SYNC_PAYLOAD: usize = 1024 * 1024 * 1024;

/// Mutable replication identity of this node. SLAVEOF and failover
/// rewrite it at runtime; the pull loop consults it every tick.
#[derive(Debug, Clone)]
pub struct ReplState {
    pub role: NodeRole,
    /// Master command address when this node is a slave.
    pub master: Option<(String, u16)>,
}

pub type SharedRepl = Arc<RwLock<ReplState>>;

pub fn shared_repl(role: NodeRole, master: Option<(String, u16)>) -> SharedRepl {
    Arc::new(RwLock::new(ReplState { role, master }))
}

// -- framed I/O primitives ---------------------------------------------------

async fn write_u32_le(w: &mut TcpStream, val: u32) -> std::io::Result<()> {
    w.write_all(&val.to_le_bytes()).await
}

async fn write_i64_le(w: &mut TcpStream, val: i64) -> std::io::Result<()> {
    w.write_all(&val.to_le_bytes()).await
}

async fn read_u32_le(r: &mut TcpStream) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).await?;
    Ok(u32::from_le_bytes(buf))
}

async fn read_i64_le(r: &mut TcpStream) -> std::io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    Ok(i64::from_le_bytes(buf))
}

// -- master side -------------------------------------------------------------

/// Binds the sync listener and serves pull requests until shutdown.
///
/// Tries the primary sync port first, then the fallback. Each accepted
/// connection is served on its own task: read one request, reply with
/// the full shard image, close.
pub async fn start_sync_server(
    manager: Arc<DbManager>,
    command_port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<u16> {
    let primary = command_port.wrapping_add(SYNC_PORT_OFFSET);
    let fallback = primary.wrapping_add(1);

    let (listener, bound) = match TcpListener::bind(("0.0.0.0", primary)).await {
        Ok(l) => (l, primary),
        Err(e) => {
            warn!(port = primary, "sync port bind failed ({e}), trying fallback");
            (TcpListener::bind(("0.0.0.0", fallback)).await?, fallback)
        }
    };
    info!(port = bound, "replication sync server listening");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((mut stream, peer)) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            match serve_pull(&mut stream, &manager).await {
                                Ok(node_id) => {
                                    debug!(%peer, slave = %node_id, "served full sync")
                                }
                                Err(e) => debug!(%peer, "sync request failed: {e}"),
                            }
                        });
                    }
                    Err(e) => {
                        error!("sync accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => return,
            }
        }
    });

    Ok(bound)
}

/// Handles one pull request on an accepted connection.
async fn serve_pull(stream: &mut TcpStream, manager: &DbManager) -> std::io::Result<String> {
    // request
    let id_len = read_u32_le(stream).await? as usize;
    if id_len > 1024 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "node id too long",
        ));
    }
    let mut id_buf = vec![0u8; id_len];
    stream.read_exact(&mut id_buf).await?;
    let node_id = String::from_utf8_lossy(&id_buf).into_owned();
    let _last_sync_ts = read_i64_le(stream).await?;

    // response: always a full image
    let image = manager.snapshot_image();
    let payload = snapshot::serialize_shards(&image).map_err(std::io::Error::other)?;

    write_u32_le(stream, payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    write_i64_le(stream, time::now_ms()).await?;
    stream.flush().await?;
    Ok(node_id)
}

// -- slave side --------------------------------------------------------------

/// Pull-loop tuning taken from configuration.
#[derive(Debug, Clone)]
pub struct PullerConfig {
    pub node_id: String,
    pub interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// The slave-side periodic puller.
pub struct SyncPuller {
    manager: Arc<DbManager>,
    repl: SharedRepl,
    config: PullerConfig,
    in_progress: AtomicBool,
    consecutive_failures: AtomicU32,
    last_sync_ts: AtomicI64,
}

impl SyncPuller {
    pub fn new(manager: Arc<DbManager>, repl: SharedRepl, config: PullerConfig) -> Arc<Self> {
        Arc::new(Self {
            manager,
            repl,
            config,
            in_progress: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_sync_ts: AtomicI64::new(0),
        })
    }

    /// Starts the periodic pull loop. Ticks are skipped while the node
    /// is not a slave, so a later SLAVEOF brings the loop to life
    /// without restarting anything.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let puller = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(puller.config.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => puller.tick().await,
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    async fn tick(&self) {
        let master = {
            let state = self.repl.read().expect("repl state lock");
            if state.role != NodeRole::Slave {
                return;
            }
            state.master.clone()
        };
        let Some((host, port)) = master else {
            return;
        };

        // never queue pulls behind a slow one
        if self.in_progress.swap(true, Ordering::AcqRel) {
            debug!("sync already in progress, skipping tick");
            return;
        }

        let result = self.pull(&host, port).await;
        match result {
            Ok(shards) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                info!(shards, master = %format!("{host}:{port}"), "full sync applied");
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                // after the threshold, only every 10th failure is logged
                if failures <= FAILURE_LOG_THRESHOLD || failures % 10 == 0 {
                    warn!(failures, "sync from master failed: {e}");
                }
            }
        }
        self.in_progress.store(false, Ordering::Release);
    }

    /// One full pull: connect (primary then fallback sync port), send
    /// the request, read the image, and swap it into the local shards.
    async fn pull(&self, host: &str, port: u16) -> std::io::Result<usize> {
        let mut stream = self.connect(host, port).await?;

        // request
        let id = self.config.node_id.as_bytes();
        write_u32_le(&mut stream, id.len() as u32).await?;
        stream.write_all(id).await?;
        write_i64_le(&mut stream, self.last_sync_ts.load(Ordering::Relaxed)).await?;
        stream.flush().await?;

        // response, bounded by the read timeout as a whole
        let (payload, server_ts) = tokio::time::timeout(self.config.read_timeout, async {
            let payload_len = read_u32_le(&mut stream).await? as usize;
            if payload_len > MAX_SYNC_PAYLOAD {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("sync payload {payload_len} exceeds cap"),
                ));
            }
            let mut payload = vec![0u8; payload_len];
            stream.read_exact(&mut payload).await?;
            let server_ts = read_i64_le(&mut stream).await?;
            Ok::<_, std::io::Error>((payload, server_ts))
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "sync read timed out"))??;

        let shards = snapshot::deserialize_shards(&payload).map_err(std::io::Error::other)?;

        let count = shards.len();
        for (index, entries) in shards.into_iter().enumerate() {
            match self.manager.db(index) {
                // contents swap in place; subscribers stay bound
                Some(db) => db.replace_entries(entries),
                None => warn!(index, "master sent more shards than configured locally"),
            }
        }
        self.last_sync_ts.store(server_ts, Ordering::Relaxed);

        // keep the local persistence image current so the slave reload
        // loop never resurrects pre-pull state
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || manager.persist_after_sync());

        Ok(count)
    }

    async fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        let primary = port.wrapping_add(SYNC_PORT_OFFSET);
        let fallback = primary.wrapping_add(1);

        match self.try_connect(host, primary).await {
            Ok(stream) => Ok(stream),
            Err(first) => {
                debug!(
                    "primary sync port {primary} unreachable ({first}), trying fallback"
                );
                self.try_connect(host, fallback).await
            }
        }
    }

    async fn try_connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "sync connect timed out")
        })?
    }
}
