//! Gossip engine: heartbeat exchange, status transitions, failover.
//!
//! Pure state-machine logic. The two tick methods mirror the two
//! timers the transport runs, and `handle_message` processes one
//! inbound message; all three return the messages to send as
//! `(gossip address, message)` pairs. Wall-clock instants are passed in
//! so tests can drive transitions without sleeping.
//!
//! Status lifecycle per peer:
//! ```text
//! handshake → online        (first HEARTBEAT / PONG)
//! online    → suspect       (no heartbeat for nodeTimeout)
//! suspect   → offline       (no heartbeat for 2 × nodeTimeout)
//! any       → online        (HEARTBEAT or PONG arrives)
//! ```
//!
//! An offline transition of this node's own master starts failover:
//! FAILOVER_START carries (failed master, chosen successor), every
//! receiver applies the same promotion and rebinding, and the initiator
//! closes with FAILOVER_END.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::message::{
    self, encode_failover, encode_node, ClusterMessage, MessageKind,
};
use crate::node::{NodeDescriptor, NodeRole, NodeStatus};
use crate::registry::NodeRegistry;
use crate::transport::GOSSIP_PORT_OFFSET;

/// Gossip timing knobs.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub heartbeat_interval: Duration,
    pub status_interval: Duration,
    /// Silence after which a peer becomes suspect; twice this is
    /// offline.
    pub node_timeout: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(10),
            node_timeout: Duration::from_secs(30),
        }
    }
}

/// Notifications the server layer reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    NodeJoined(String),
    NodeSuspected(String),
    NodeOffline(String),
    /// This node was chosen as the new master.
    PromotedToMaster,
    /// This node's master changed; reconnect replication to the new one.
    MasterChanged {
        master_id: String,
        host: String,
        port: u16,
    },
}

type Outgoing = Vec<(String, ClusterMessage)>;

/// Per-node gossip state machine.
pub struct GossipEngine {
    local: NodeDescriptor,
    config: GossipConfig,
    registry: NodeRegistry,
    event_tx: mpsc::UnboundedSender<ClusterEvent>,
}

impl GossipEngine {
    pub fn new(
        local: NodeDescriptor,
        config: GossipConfig,
        event_tx: mpsc::UnboundedSender<ClusterEvent>,
    ) -> Self {
        Self {
            local,
            config,
            registry: NodeRegistry::new(),
            event_tx,
        }
    }

    /// Seeds a peer known from configuration.
    pub fn add_seed(&mut self, node: NodeDescriptor) {
        if node.id != self.local.id {
            self.registry.add(node);
        }
    }

    pub fn local(&self) -> &NodeDescriptor {
        &self.local
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    fn emit(&self, event: ClusterEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("cluster event channel closed, dropping event");
        }
    }

    fn broadcast(&self, msg: &ClusterMessage) -> Outgoing {
        self.registry
            .iter()
            .filter(|peer| peer.status != NodeStatus::Offline)
            .map(|peer| (peer.gossip_addr(GOSSIP_PORT_OFFSET), msg.clone()))
            .collect()
    }

    /// Heartbeat timer: broadcast HEARTBEAT, then demote peers whose
    /// last heartbeat is older than the node timeout.
    pub fn heartbeat_tick(&mut self, now: i64) -> Outgoing {
        let heartbeat = ClusterMessage::new(MessageKind::Heartbeat, &self.local.id, now)
            .with_payload(encode_node(&self.local));
        let outgoing = self.broadcast(&heartbeat);

        let timeout_ms = self.config.node_timeout.as_millis() as i64;
        let mut suspected = Vec::new();
        for peer in self.registry.iter_mut() {
            if peer.status == NodeStatus::Online && now - peer.last_heartbeat > timeout_ms {
                peer.status = NodeStatus::Suspect;
                suspected.push(peer.id.clone());
            }
        }
        for id in suspected {
            debug!(node = %id, "peer heartbeat overdue, marking suspect");
            self.emit(ClusterEvent::NodeSuspected(id));
        }
        outgoing
    }

    /// Status timer: PING suspects, take long-silent suspects offline,
    /// and start failover when the offline peer was our master.
    pub fn status_tick(&mut self, now: i64) -> Outgoing {
        let mut outgoing = Vec::new();
        let offline_ms = 2 * self.config.node_timeout.as_millis() as i64;

        let mut went_offline = Vec::new();
        for peer in self.registry.iter_mut() {
            if peer.status != NodeStatus::Suspect {
                continue;
            }
            if now - peer.last_heartbeat > offline_ms {
                peer.status = NodeStatus::Offline;
                went_offline.push(peer.id.clone());
            }
        }

        // ping the peers that are still merely suspect
        let mut pings = Vec::new();
        for peer in self.registry.iter() {
            if peer.status == NodeStatus::Suspect {
                pings.push((
                    peer.gossip_addr(GOSSIP_PORT_OFFSET),
                    ClusterMessage::new(MessageKind::Ping, &self.local.id, now).to(&peer.id),
                ));
            }
        }
        outgoing.extend(pings);

        for id in went_offline {
            warn!(node = %id, "peer offline after suspicion timeout");
            self.emit(ClusterEvent::NodeOffline(id.clone()));
            if self.local.master_id.as_deref() == Some(id.as_str()) {
                outgoing.extend(self.start_failover(&id, now));
            }
        }
        outgoing
    }

    /// Initiates failover for a failed master: pick the successor,
    /// broadcast FAILOVER_START, apply the transition locally, and
    /// close with FAILOVER_END.
    pub fn start_failover(&mut self, failed_master: &str, now: i64) -> Outgoing {
        // the local node competes with registry candidates; being the
        // node that noticed, it is alive right now
        let mut candidate: Option<(String, i64)> = None;
        if self.local.role == NodeRole::Slave
            && self.local.master_id.as_deref() == Some(failed_master)
        {
            candidate = Some((self.local.id.clone(), now));
        }
        if let Some(peer) = self.registry.select_new_master(failed_master) {
            let better = match &candidate {
                Some((_, hb)) => peer.last_heartbeat > *hb,
                None => true,
            };
            if better {
                candidate = Some((peer.id.clone(), peer.last_heartbeat));
            }
        }

        let Some((new_master, _)) = candidate else {
            warn!(failed = %failed_master, "no online slave available for failover");
            return Vec::new();
        };
        info!(failed = %failed_master, new = %new_master, "starting failover");

        let start = ClusterMessage::new(MessageKind::FailoverStart, &self.local.id, now)
            .with_payload(encode_failover(failed_master, &new_master));
        let mut outgoing = self.broadcast(&start);

        self.apply_failover(failed_master, &new_master);

        let end = ClusterMessage::new(MessageKind::FailoverEnd, &self.local.id, now)
            .with_payload(encode_failover(failed_master, &new_master));
        outgoing.extend(self.broadcast(&end));
        outgoing
    }

    /// Applies a failover transition to the registry and to the local
    /// node's own role.
    fn apply_failover(&mut self, failed_master: &str, new_master: &str) {
        if let Some(node) = self.registry.get_mut(new_master) {
            node.role = NodeRole::Master;
            node.master_id = None;
        }
        for node in self.registry.iter_mut() {
            if node.role == NodeRole::Slave && node.master_id.as_deref() == Some(failed_master) {
                node.master_id = Some(new_master.to_owned());
            }
        }

        if self.local.id == new_master {
            self.local.role = NodeRole::Master;
            self.local.master_id = None;
            info!("promoted to master by failover");
            self.emit(ClusterEvent::PromotedToMaster);
        } else if self.local.role == NodeRole::Slave
            && self.local.master_id.as_deref() == Some(failed_master)
        {
            self.local.master_id = Some(new_master.to_owned());
            if let Some(master) = self.registry.get(new_master) {
                self.emit(ClusterEvent::MasterChanged {
                    master_id: master.id.clone(),
                    host: master.host.clone(),
                    port: master.port,
                });
            }
        }
    }

    /// Processes one inbound message, returning any replies.
    pub fn handle_message(&mut self, msg: ClusterMessage, now: i64) -> Outgoing {
        match msg.kind {
            MessageKind::Heartbeat => {
                self.learn_node(&msg.payload);
                self.registry.mark_alive(&msg.sender, now);
                Vec::new()
            }
            MessageKind::Ping => {
                let pong =
                    ClusterMessage::new(MessageKind::Pong, &self.local.id, now).to(&msg.sender);
                match self.registry.get(&msg.sender) {
                    Some(peer) => vec![(peer.gossip_addr(GOSSIP_PORT_OFFSET), pong)],
                    None => Vec::new(),
                }
            }
            MessageKind::Pong => {
                self.registry.mark_alive(&msg.sender, now);
                Vec::new()
            }
            MessageKind::NodeAdded => {
                self.learn_node(&msg.payload);
                Vec::new()
            }
            MessageKind::NodeRemoved => {
                match message::decode_node(&msg.payload) {
                    Ok(node) => {
                        self.registry.remove(&node.id);
                        info!(node = %node.id, "peer removed from registry");
                    }
                    Err(e) => warn!("bad NODE_REMOVED payload: {e}"),
                }
                Vec::new()
            }
            MessageKind::FailoverStart => {
                match message::decode_failover(&msg.payload) {
                    Ok((failed, new)) => {
                        info!(failed = %failed, new = %new, "failover announced by {}", msg.sender);
                        self.apply_failover(&failed, &new);
                    }
                    Err(e) => warn!("bad FAILOVER_START payload: {e}"),
                }
                Vec::new()
            }
            MessageKind::FailoverEnd => {
                info!(sender = %msg.sender, "failover complete");
                Vec::new()
            }
            // data sync travels on the replication port; these kinds
            // exist only for wire compatibility
            MessageKind::SyncRequest | MessageKind::SyncResponse => {
                debug!(kind = ?msg.kind, "ignoring data-sync message on gossip port");
                Vec::new()
            }
        }
    }

    fn learn_node(&mut self, payload: &[u8]) {
        match message::decode_node(payload) {
            Ok(node) => {
                if node.id == self.local.id {
                    return;
                }
                if self.registry.add(node.clone()) {
                    info!(node = %node.id, "learned new peer");
                    self.emit(ClusterEvent::NodeJoined(node.id));
                } else if let Some(existing) = self.registry.get_mut(&node.id) {
                    // refresh addressing and topology facts
                    existing.host = node.host;
                    existing.port = node.port;
                    existing.role = node.role;
                    existing.master_id = node.master_id;
                }
            }
            Err(e) => warn!("bad node payload: {e}"),
        }
    }
}
