//! Peer registry.
//!
//! Plain map keyed by node id; the gossip engine mutates it under its
//! own lock, so the registry itself needs no interior synchronization.

use std::collections::HashMap;

use crate::node::{NodeDescriptor, NodeRole, NodeStatus};

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, NodeDescriptor>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the node if absent. Returns true when it was new.
    pub fn add(&mut self, node: NodeDescriptor) -> bool {
        if self.nodes.contains_key(&node.id) {
            false
        } else {
            self.nodes.insert(node.id.clone(), node);
            true
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<NodeDescriptor> {
        self.nodes.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut NodeDescriptor> {
        self.nodes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeDescriptor> {
        self.nodes.values_mut()
    }

    /// Records a liveness signal: bumps the heartbeat instant and
    /// forces the node online, whatever its previous status.
    pub fn mark_alive(&mut self, id: &str, now: i64) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.last_heartbeat = now;
            node.status = NodeStatus::Online;
        }
    }

    /// New-master selection: among the failed master's slaves that are
    /// currently online, the one with the most recent heartbeat wins.
    pub fn select_new_master(&self, failed_master_id: &str) -> Option<&NodeDescriptor> {
        self.nodes
            .values()
            .filter(|n| n.role == NodeRole::Slave)
            .filter(|n| n.master_id.as_deref() == Some(failed_master_id))
            .filter(|n| n.status == NodeStatus::Online)
            .max_by_key(|n| n.last_heartbeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slave(id: &str, master: &str, heartbeat: i64, status: NodeStatus) -> NodeDescriptor {
        let mut node = NodeDescriptor::new(id, "127.0.0.1", 7000, NodeRole::Slave);
        node.master_id = Some(master.into());
        node.last_heartbeat = heartbeat;
        node.status = status;
        node
    }

    #[test]
    fn add_is_idempotent() {
        let mut reg = NodeRegistry::new();
        assert!(reg.add(NodeDescriptor::new("a", "h", 1, NodeRole::Master)));
        assert!(!reg.add(NodeDescriptor::new("a", "other", 2, NodeRole::Slave)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("a").unwrap().host, "h");
    }

    #[test]
    fn mark_alive_forces_online() {
        let mut reg = NodeRegistry::new();
        reg.add(slave("s1", "m", 0, NodeStatus::Suspect));
        reg.mark_alive("s1", 500);
        let node = reg.get("s1").unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.last_heartbeat, 500);
    }

    #[test]
    fn selects_freshest_online_slave_of_failed_master() {
        let mut reg = NodeRegistry::new();
        reg.add(slave("s1", "m1", 100, NodeStatus::Online));
        reg.add(slave("s2", "m1", 300, NodeStatus::Online));
        reg.add(slave("s3", "m1", 900, NodeStatus::Offline)); // not eligible
        reg.add(slave("s4", "m2", 999, NodeStatus::Online)); // wrong master

        let chosen = reg.select_new_master("m1").unwrap();
        assert_eq!(chosen.id, "s2");
    }

    #[test]
    fn no_candidate_when_no_online_slaves() {
        let mut reg = NodeRegistry::new();
        reg.add(slave("s1", "m1", 100, NodeStatus::Offline));
        assert!(reg.select_new_master("m1").is_none());
        assert!(reg.select_new_master("unknown").is_none());
    }
}
