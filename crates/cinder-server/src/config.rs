//! Server configuration.
//!
//! Settings come from an optional properties file (`key=value`, `#`
//! comments) with CLI flags layered on top. Key names match the
//! historical configuration vocabulary (`databaseCount`, `aofFsync`,
//! `slaveNodes=id:host:port,…`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use cinder_cluster::NodeRole;
use cinder_core::{ManagerConfig, PersistenceMode};
use cinder_persistence::aof::FsyncPolicy;

/// A slave node declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveSpec {
    pub id: String,
    pub host: String,
    pub port: u16,
}

/// Complete server configuration with defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_count: usize,
    pub data_dir: PathBuf,

    pub persistence_mode: PersistenceMode,
    pub rdb_compression: bool,
    /// Snapshot period in seconds.
    pub rdb_save_interval: u64,
    pub aof_fsync: FsyncPolicy,
    pub aof_rewrite_size: u64,

    pub cluster_enabled: bool,
    pub node_id: String,
    pub node_role: NodeRole,
    pub master_host: String,
    pub master_port: u16,
    pub master_id: String,
    pub slave_nodes: Vec<SlaveSpec>,
    /// Gossip timings, seconds.
    pub heartbeat_interval: u64,
    pub node_status_interval: u64,
    pub node_timeout: u64,
    /// Replication pull period, seconds.
    pub sync_interval: u64,
    /// Replication socket timeouts, milliseconds.
    pub sync_connect_timeout: u64,
    pub sync_read_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            database_count: 16,
            data_dir: PathBuf::from("db"),
            persistence_mode: PersistenceMode::Rdb,
            rdb_compression: true,
            rdb_save_interval: 60,
            aof_fsync: FsyncPolicy::EverySec,
            aof_rewrite_size: 64 * 1024 * 1024,
            cluster_enabled: false,
            node_id: "node1".into(),
            node_role: NodeRole::Master,
            master_host: "127.0.0.1".into(),
            master_port: 6379,
            master_id: "master".into(),
            slave_nodes: Vec::new(),
            heartbeat_interval: 5,
            node_status_interval: 10,
            node_timeout: 30,
            sync_interval: 5,
            sync_connect_timeout: 5000,
            sync_read_timeout: 60_000,
        }
    }
}

impl ServerConfig {
    /// Loads a properties file over the defaults. Unknown keys are
    /// rejected so typos don't silently fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config file {}: {e}", path.display()))?;
        let mut config = Self::default();
        for (line_no, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected key=value", line_no + 1))?;
            config
                .apply(key.trim(), value.trim())
                .map_err(|e| format!("line {}: {e}", line_no + 1))?;
        }
        Ok(config)
    }

    /// Applies one configuration key.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "host" => self.host = value.to_owned(),
            "port" => self.port = parse_num(key, value)?,
            "databaseCount" => self.database_count = parse_num(key, value)?,
            "dataDir" => self.data_dir = PathBuf::from(value),
            "persistenceMode" => self.persistence_mode = parse_persistence_mode(value)?,
            "rdbCompression" => self.rdb_compression = parse_bool(key, value)?,
            "rdbSaveInterval" => self.rdb_save_interval = parse_num(key, value)?,
            "aofFsync" => self.aof_fsync = parse_fsync_policy(value)?,
            "aofRewriteSize" => self.aof_rewrite_size = parse_byte_size(value)? as u64,
            "clusterEnabled" => self.cluster_enabled = parse_bool(key, value)?,
            "nodeId" => self.node_id = value.to_owned(),
            "nodeRole" => self.node_role = parse_role(value)?,
            "masterHost" => self.master_host = value.to_owned(),
            "masterPort" => self.master_port = parse_num(key, value)?,
            "masterId" => self.master_id = value.to_owned(),
            "slaveNodes" => self.slave_nodes = parse_slave_nodes(value)?,
            "heartbeatInterval" => self.heartbeat_interval = parse_num(key, value)?,
            "nodeStatusInterval" => self.node_status_interval = parse_num(key, value)?,
            "nodeTimeout" => self.node_timeout = parse_num(key, value)?,
            "syncInterval" => self.sync_interval = parse_num(key, value)?,
            "syncConnectTimeout" => self.sync_connect_timeout = parse_num(key, value)?,
            "syncReadTimeout" => self.sync_read_timeout = parse_num(key, value)?,
            other => return Err(format!("unknown configuration key '{other}'")),
        }
        Ok(())
    }

    pub fn is_slave(&self) -> bool {
        self.node_role == NodeRole::Slave
    }

    /// The manager options implied by this configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            dir: self.data_dir.clone(),
            shard_count: self.database_count,
            mode: self.persistence_mode,
            rdb_compression: self.rdb_compression,
            rdb_save_interval: Duration::from_secs(self.rdb_save_interval),
            aof_fsync: self.aof_fsync,
            aof_rewrite_size: self.aof_rewrite_size,
            slave_reload: self.is_slave(),
        }
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid number for '{key}': '{value}'"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(format!("invalid boolean for '{key}': '{value}'")),
    }
}

pub fn parse_persistence_mode(value: &str) -> Result<PersistenceMode, String> {
    match value.to_ascii_lowercase().as_str() {
        "rdb" => Ok(PersistenceMode::Rdb),
        "aof" => Ok(PersistenceMode::Aof),
        _ => Err(format!(
            "unknown persistence mode '{value}'. valid options: rdb, aof"
        )),
    }
}

pub fn parse_fsync_policy(value: &str) -> Result<FsyncPolicy, String> {
    match value.to_ascii_lowercase().as_str() {
        "always" => Ok(FsyncPolicy::Always),
        "everysec" => Ok(FsyncPolicy::EverySec),
        "no" => Ok(FsyncPolicy::No),
        _ => Err(format!(
            "unknown fsync policy '{value}'. valid options: always, everysec, no"
        )),
    }
}

pub fn parse_role(value: &str) -> Result<NodeRole, String> {
    match value.to_ascii_lowercase().as_str() {
        "master" => Ok(NodeRole::Master),
        "slave" => Ok(NodeRole::Slave),
        _ => Err(format!(
            "unknown node role '{value}'. valid options: master, slave"
        )),
    }
}

/// Parses `id:host:port,id:host:port,…`.
pub fn parse_slave_nodes(value: &str) -> Result<Vec<SlaveSpec>, String> {
    let mut specs = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let fields: Vec<&str> = part.split(':').collect();
        if fields.len() != 3 {
            return Err(format!("invalid slave node '{part}': expected id:host:port"));
        }
        let port: u16 = fields[2]
            .parse()
            .map_err(|_| format!("invalid slave node port in '{part}'"))?;
        specs.push(SlaveSpec {
            id: fields[0].to_owned(),
            host: fields[1].to_owned(),
            port,
        });
    }
    Ok(specs)
}

/// Parses a byte-size string: plain numbers are bytes; `K`/`KB`, `M`/`MB`,
/// `G`/`GB` suffixes multiply. Case insensitive.
pub fn parse_byte_size(input: &str) -> Result<usize, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty byte size string".into());
    }

    let upper = input.to_ascii_uppercase();
    let (num_str, multiplier) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix('K') {
        (n, 1024)
    } else {
        (upper.as_str(), 1)
    };

    let num: usize = num_str
        .parse()
        .map_err(|_| format!("invalid byte size: '{input}'"))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("byte size overflow: '{input}'"))
}
