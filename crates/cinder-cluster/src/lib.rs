//! cinder-cluster: membership and failover.
//!
//! A node broadcasts HEARTBEAT on a timer and tracks every peer's last
//! heartbeat instant. Peers that go quiet transition online → suspect →
//! offline; an offline master triggers the failover message protocol.
//! The gossip engine itself is pure state-machine logic; timers and
//! sockets live in [`transport`], which makes the protocol testable
//! without a network.
//!
//! Data synchronization is not handled here: full-state pulls travel on
//! the replication port. The SYNC_REQUEST / SYNC_RESPONSE message kinds
//! are carried in the codec for wire compatibility only.

pub mod error;
pub mod gossip;
pub mod message;
pub mod node;
pub mod registry;
pub mod transport;

pub use error::ClusterError;
pub use gossip::{ClusterEvent, GossipConfig, GossipEngine};
pub use message::{ClusterMessage, MessageKind};
pub use node::{NodeDescriptor, NodeRole, NodeStatus};
pub use registry::NodeRegistry;
pub use transport::GOSSIP_PORT_OFFSET;
