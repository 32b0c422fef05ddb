//! Binary wire format for cluster messages.
//!
//! Compact manual encoding, all integers little-endian:
//!
//! ```text
//! [kind: 1B][sender: str][receiver?: 1B flag + str]
//! [payload_len: u32][payload][timestamp: i64]
//! ```
//!
//! Strings are `[len: u16][utf-8 bytes]`. The payload is opaque at this
//! layer; helpers below encode the two payload shapes the protocol
//! uses: a node descriptor (HEARTBEAT, NODE_ADDED) and a failover
//! id pair (FAILOVER_START).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ClusterError;
use crate::node::{NodeDescriptor, NodeRole, NodeStatus};

/// Maximum accepted payload, caps allocations from crafted frames.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Every protocol message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Heartbeat,
    Ping,
    Pong,
    NodeAdded,
    NodeRemoved,
    FailoverStart,
    FailoverEnd,
    SyncRequest,
    SyncResponse,
}

impl MessageKind {
    fn to_u8(self) -> u8 {
        match self {
            MessageKind::Heartbeat => 1,
            MessageKind::Ping => 2,
            MessageKind::Pong => 3,
            MessageKind::NodeAdded => 4,
            MessageKind::NodeRemoved => 5,
            MessageKind::FailoverStart => 6,
            MessageKind::FailoverEnd => 7,
            MessageKind::SyncRequest => 8,
            MessageKind::SyncResponse => 9,
        }
    }

    fn from_u8(tag: u8) -> Result<Self, ClusterError> {
        Ok(match tag {
            1 => MessageKind::Heartbeat,
            2 => MessageKind::Ping,
            3 => MessageKind::Pong,
            4 => MessageKind::NodeAdded,
            5 => MessageKind::NodeRemoved,
            6 => MessageKind::FailoverStart,
            7 => MessageKind::FailoverEnd,
            8 => MessageKind::SyncRequest,
            9 => MessageKind::SyncResponse,
            other => return Err(ClusterError::UnknownKind(other)),
        })
    }
}

/// One inter-node message.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMessage {
    pub kind: MessageKind,
    pub sender: String,
    /// Absent for broadcasts.
    pub receiver: Option<String>,
    pub payload: Bytes,
    /// Sender's wall-clock ms at send time.
    pub timestamp: i64,
}

impl ClusterMessage {
    pub fn new(kind: MessageKind, sender: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind,
            sender: sender.into(),
            receiver: None,
            payload: Bytes::new(),
            timestamp,
        }
    }

    pub fn to(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.payload.len());
        buf.put_u8(self.kind.to_u8());
        put_str(&mut buf, &self.sender);
        match &self.receiver {
            Some(receiver) => {
                buf.put_u8(1);
                put_str(&mut buf, receiver);
            }
            None => buf.put_u8(0),
        }
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.put_i64_le(self.timestamp);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, ClusterError> {
        let kind = MessageKind::from_u8(get_u8(&mut buf)?)?;
        let sender = get_str(&mut buf)?;
        let receiver = match get_u8(&mut buf)? {
            0 => None,
            _ => Some(get_str(&mut buf)?),
        };
        let payload_len = get_u32(&mut buf)? as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(ClusterError::Malformed(format!(
                "payload length {payload_len} exceeds cap"
            )));
        }
        if buf.len() < payload_len {
            return Err(ClusterError::Malformed("truncated payload".into()));
        }
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);
        buf.advance(payload_len);
        let timestamp = get_i64(&mut buf)?;
        Ok(Self {
            kind,
            sender,
            receiver,
            payload,
            timestamp,
        })
    }
}

// -- safe read helpers -------------------------------------------------------

fn get_u8(buf: &mut &[u8]) -> Result<u8, ClusterError> {
    if buf.is_empty() {
        return Err(ClusterError::Malformed("need 1 byte".into()));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, ClusterError> {
    if buf.len() < 2 {
        return Err(ClusterError::Malformed("need 2 bytes".into()));
    }
    Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, ClusterError> {
    if buf.len() < 4 {
        return Err(ClusterError::Malformed("need 4 bytes".into()));
    }
    Ok(buf.get_u32_le())
}

fn get_i64(buf: &mut &[u8]) -> Result<i64, ClusterError> {
    if buf.len() < 8 {
        return Err(ClusterError::Malformed("need 8 bytes".into()));
    }
    Ok(buf.get_i64_le())
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut &[u8]) -> Result<String, ClusterError> {
    let len = get_u16(buf)? as usize;
    if buf.len() < len {
        return Err(ClusterError::Malformed("truncated string".into()));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| ClusterError::Malformed("string is not utf-8".into()))?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

// -- payload shapes ----------------------------------------------------------

fn role_tag(role: NodeRole) -> u8 {
    match role {
        NodeRole::Master => 0,
        NodeRole::Slave => 1,
    }
}

/// Encodes a node descriptor for HEARTBEAT / NODE_ADDED payloads.
/// Status and last-heartbeat are receiver-local state and do not travel.
pub fn encode_node(node: &NodeDescriptor) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    put_str(&mut buf, &node.id);
    put_str(&mut buf, &node.host);
    buf.put_u16_le(node.port);
    buf.put_u8(role_tag(node.role));
    match &node.master_id {
        Some(master) => {
            buf.put_u8(1);
            put_str(&mut buf, master);
        }
        None => buf.put_u8(0),
    }
    buf.freeze()
}

pub fn decode_node(mut buf: &[u8]) -> Result<NodeDescriptor, ClusterError> {
    let id = get_str(&mut buf)?;
    let host = get_str(&mut buf)?;
    let port = get_u16(&mut buf)?;
    let role = match get_u8(&mut buf)? {
        0 => NodeRole::Master,
        _ => NodeRole::Slave,
    };
    let master_id = match get_u8(&mut buf)? {
        0 => None,
        _ => Some(get_str(&mut buf)?),
    };
    Ok(NodeDescriptor {
        id,
        host,
        port,
        role,
        status: NodeStatus::Handshake,
        master_id,
        last_heartbeat: 0,
    })
}

/// Encodes the FAILOVER_START payload: (failed master, new master).
pub fn encode_failover(failed_master: &str, new_master: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + failed_master.len() + new_master.len());
    put_str(&mut buf, failed_master);
    put_str(&mut buf, new_master);
    buf.freeze()
}

pub fn decode_failover(mut buf: &[u8]) -> Result<(String, String), ClusterError> {
    let failed = get_str(&mut buf)?;
    let new = get_str(&mut buf)?;
    Ok((failed, new))
}
