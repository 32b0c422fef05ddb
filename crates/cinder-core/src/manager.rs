//! Database manager: owns the shard vector and drives persistence.
//!
//! One manager per server process. It allocates the fixed shard vector,
//! performs the startup persistence load, and runs the periodic tasks:
//! snapshot saves (rdb mode), append-log flush and rewrite checks (aof
//! mode), the per-shard expiration reapers, and, on slaves, the
//! reload loop that re-invokes persistence-load against the live shard
//! vector. Shutdown is cooperative: a watch signal stops every timer,
//! then the final snapshot or append-log close runs within a bounded
//! drain window.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use cinder_persistence::aof::{self, AofLog, FsyncPolicy, ReplayCommand};
use cinder_persistence::snapshot::{self, LoadOutcome, SnapEntry};

use crate::db::Db;
use crate::expiry;
use crate::time::now_ms;

/// Snapshot file name inside the data directory.
pub const SNAPSHOT_FILE: &str = "dump.rdb";

/// Append-log file name inside the data directory.
pub const AOF_FILE: &str = "appendonly.aof";

/// How often a slave re-invokes persistence-load.
const SLAVE_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Append-log flush / rewrite-check period.
const AOF_TICK: Duration = Duration::from_secs(1);

/// Bounded wait for the final persistence step during shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Which persistence strategy the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    Rdb,
    Aof,
}

/// Manager construction options.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Data directory (`db/` next to the process by default).
    pub dir: PathBuf,
    pub shard_count: usize,
    pub mode: PersistenceMode,
    pub rdb_compression: bool,
    pub rdb_save_interval: Duration,
    pub aof_fsync: FsyncPolicy,
    /// Append-log size that triggers a rewrite.
    pub aof_rewrite_size: u64,
    /// Run the periodic reload loop (slave role).
    pub slave_reload: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("db"),
            shard_count: 16,
            mode: PersistenceMode::Rdb,
            rdb_compression: true,
            rdb_save_interval: Duration::from_secs(60),
            aof_fsync: FsyncPolicy::EverySec,
            aof_rewrite_size: 64 * 1024 * 1024,
            slave_reload: false,
        }
    }
}

/// Owns the shard vector for the life of the process.
pub struct DbManager {
    dbs: Vec<Arc<Db>>,
    config: ManagerConfig,
    aof: Option<AofLog>,
    shutdown_tx: watch::Sender<bool>,
    /// Serializes snapshot writers: the periodic timer and the
    /// post-sync save share one `.tmp` path.
    save_lock: std::sync::Mutex<()>,
}

impl DbManager {
    /// Allocates the shards, loads persisted state, and starts the
    /// periodic tasks. Must run inside a tokio runtime.
    pub async fn start(config: ManagerConfig) -> io::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.dir)?;

        let dbs: Vec<Arc<Db>> = (0..config.shard_count).map(|i| Arc::new(Db::new(i))).collect();

        let aof = match config.mode {
            PersistenceMode::Aof => Some(AofLog::open(
                config.dir.join(AOF_FILE),
                config.aof_fsync,
            )?),
            PersistenceMode::Rdb => None,
        };

        let (shutdown_tx, _) = watch::channel(false);
        let manager = Arc::new(Self {
            dbs,
            config,
            aof,
            shutdown_tx,
            save_lock: std::sync::Mutex::new(()),
        });

        manager.reload();

        for db in &manager.dbs {
            expiry::spawn_reaper(Arc::clone(db), manager.shutdown_tx.subscribe());
        }

        match manager.config.mode {
            PersistenceMode::Rdb => Arc::clone(&manager).spawn_snapshot_timer(),
            PersistenceMode::Aof => Arc::clone(&manager).spawn_aof_timer(),
        }
        if manager.config.slave_reload {
            Arc::clone(&manager).spawn_reload_timer();
        }

        Ok(manager)
    }

    pub fn shard_count(&self) -> usize {
        self.dbs.len()
    }

    pub fn db(&self, index: usize) -> Option<&Arc<Db>> {
        self.dbs.get(index)
    }

    pub fn dbs(&self) -> &[Arc<Db>] {
        &self.dbs
    }

    pub fn mode(&self) -> PersistenceMode {
        self.config.mode
    }

    /// Records a mutating command line for the given shard. A no-op in
    /// snapshot mode.
    pub fn append_aof(&self, shard: usize, line: String) {
        if let Some(ref log) = self.aof {
            log.append(shard, line);
        }
    }

    /// Full serializable image of every shard.
    pub fn snapshot_image(&self) -> Vec<Vec<SnapEntry>> {
        self.dbs.iter().map(|db| db.snapshot_entries()).collect()
    }

    fn snapshot_path(&self) -> PathBuf {
        self.config.dir.join(SNAPSHOT_FILE)
    }

    fn aof_path(&self) -> PathBuf {
        self.config.dir.join(AOF_FILE)
    }

    /// Writes a full snapshot with atomic replacement.
    pub fn save_snapshot(&self) -> Result<(), cinder_persistence::FormatError> {
        let _guard = self.save_lock.lock().expect("snapshot save lock");
        let image = self.snapshot_image();
        let keys: usize = image.iter().map(Vec::len).sum();
        snapshot::save(&self.snapshot_path(), &image, self.config.rdb_compression)?;
        info!(shards = image.len(), keys, "snapshot saved");
        Ok(())
    }

    /// Persists the keyspace after a replication pull so the slave
    /// reload loop re-reads state no staler than the pull itself.
    pub fn persist_after_sync(&self) {
        match self.config.mode {
            PersistenceMode::Rdb => {
                if let Err(e) = self.save_snapshot() {
                    error!("post-sync snapshot failed: {e}");
                }
            }
            PersistenceMode::Aof => self.rewrite_aof(),
        }
    }

    /// Rewrites the append-log from the current keyspace.
    pub fn rewrite_aof(&self) {
        let Some(ref log) = self.aof else { return };
        let now = now_ms();
        let lines = aof::rewrite_transcript(&self.snapshot_image(), |at| at - now);
        log.rewrite(lines);
    }

    /// Re-invokes persistence-load against the live shard vector. This
    /// is the startup load and, on slaves, the periodic reload.
    pub fn reload(&self) {
        match self.config.mode {
            PersistenceMode::Rdb => {
                match snapshot::load(
                    &self.snapshot_path(),
                    self.shard_count(),
                    self.config.rdb_compression,
                ) {
                    Ok(LoadOutcome::Loaded(shards)) => {
                        let keys: usize = shards.iter().map(|(_, e)| e.len()).sum();
                        for (index, entries) in shards {
                            match self.dbs.get(index) {
                                Some(db) => db.replace_entries(entries),
                                None => {
                                    warn!(index, "snapshot shard index beyond configured count")
                                }
                            }
                        }
                        info!(keys, "snapshot loaded");
                    }
                    Ok(LoadOutcome::Initialized) => {}
                    Err(e) => error!("snapshot load failed: {e}"),
                }
            }
            PersistenceMode::Aof => match aof::read_log(&self.aof_path()) {
                Ok(commands) => {
                    let count = commands.len();
                    self.apply_replay(commands);
                    if count > 0 {
                        info!(commands = count, "append-log replayed");
                    }
                }
                Err(e) => error!("append-log load failed: {e}"),
            },
        }
    }

    fn apply_replay(&self, commands: Vec<ReplayCommand>) {
        let mut current = 0usize;
        for command in commands {
            let db = match self.dbs.get(current) {
                Some(db) => db,
                None => continue,
            };
            match command {
                ReplayCommand::Select(index) => {
                    // an out-of-range SELECT falls back to shard 0
                    current = if index < self.dbs.len() { index } else { 0 };
                }
                ReplayCommand::Set { key, value } => {
                    db.set(&key, bytes::Bytes::from(value));
                }
                ReplayCommand::LPush { key, values } => {
                    let _ = db.lpush(&key, values.into_iter().map(bytes::Bytes::from).collect());
                }
                ReplayCommand::RPush { key, values } => {
                    let _ = db.rpush(&key, values.into_iter().map(bytes::Bytes::from).collect());
                }
                ReplayCommand::SAdd { key, members } => {
                    let _ = db.sadd(&key, members);
                }
                ReplayCommand::HSet { key, field, value } => {
                    let _ = db.hset(&key, vec![(field, bytes::Bytes::from(value))]);
                }
                ReplayCommand::ZAdd { key, members } => {
                    let _ = db.zadd(&key, members);
                }
                ReplayCommand::PExpire { key, ms } => {
                    db.expire(&key, ms);
                }
                ReplayCommand::Del { key } => {
                    db.delete(&key);
                }
            }
        }
    }

    fn spawn_snapshot_timer(self: Arc<Self>) {
        let manager = self;
        let mut shutdown = manager.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.config.rdb_save_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let m = Arc::clone(&manager);
                        let result =
                            tokio::task::spawn_blocking(move || m.save_snapshot()).await;
                        match result {
                            Ok(Err(e)) => error!("periodic snapshot failed: {e}"),
                            Err(e) => error!("snapshot task panicked: {e}"),
                            Ok(Ok(())) => {}
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    fn spawn_aof_timer(self: Arc<Self>) {
        let manager = self;
        let mut shutdown = manager.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(AOF_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Some(ref log) = manager.aof {
                            if manager.config.aof_fsync == FsyncPolicy::EverySec {
                                log.flush();
                            }
                            // size-triggered rewrite
                            if let Ok(meta) = std::fs::metadata(log.path()) {
                                if meta.len() > manager.config.aof_rewrite_size {
                                    info!(
                                        size = meta.len(),
                                        "append-log over rewrite threshold"
                                    );
                                    manager.rewrite_aof();
                                }
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    fn spawn_reload_timer(self: Arc<Self>) {
        let manager = self;
        let mut shutdown = manager.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SLAVE_RELOAD_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let m = Arc::clone(&manager);
                        if let Err(e) = tokio::task::spawn_blocking(move || m.reload()).await {
                            error!("slave reload task panicked: {e}");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    /// Stops every periodic task and runs the final persistence step.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        match self.config.mode {
            PersistenceMode::Rdb => {
                if let Err(e) = self.save_snapshot() {
                    error!("final snapshot failed: {e}");
                }
            }
            PersistenceMode::Aof => {
                if let Some(log) = self.aof.clone() {
                    if tokio::time::timeout(SHUTDOWN_DRAIN, log.close()).await.is_err() {
                        warn!("append-log close timed out");
                    }
                }
            }
        }
        info!("database manager stopped");
    }
}
