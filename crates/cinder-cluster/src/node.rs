//! Node descriptors.

/// What a node does in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Slave,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Slave => "slave",
        }
    }
}

/// Liveness as seen by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Online,
    Offline,
    /// Heartbeats are overdue; a direct PING is in flight.
    Suspect,
    /// Known from config or gossip but not yet heard from.
    Handshake,
}

/// Everything this node knows about a peer (or itself).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    pub id: String,
    pub host: String,
    /// The peer's command port; derived ports are offsets from it.
    pub port: u16,
    pub role: NodeRole,
    pub status: NodeStatus,
    /// For slaves, the id of the master they replicate from.
    pub master_id: Option<String>,
    /// Wall-clock ms of the last HEARTBEAT or PONG from this node.
    pub last_heartbeat: i64,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16, role: NodeRole) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            role,
            status: NodeStatus::Handshake,
            master_id: None,
            last_heartbeat: 0,
        }
    }

    /// Address of the peer's gossip listener.
    pub fn gossip_addr(&self, port_offset: u16) -> String {
        format!("{}:{}", self.host, self.port.wrapping_add(port_offset))
    }
}
