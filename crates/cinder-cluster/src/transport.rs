//! Gossip transport: TCP framing, timers, and the listener loop.
//!
//! Each message travels on its own short-lived connection, framed as
//! `[len: u32 LE][encoded message]`. Sends retry a fixed number of
//! times with a flat backoff; the engine treats delivery as best-effort
//! and relies on the next heartbeat round to repair misses.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::gossip::GossipEngine;
use crate::message::{ClusterMessage, MAX_PAYLOAD};

/// The gossip listener binds at command port + this offset.
pub const GOSSIP_PORT_OFFSET: u16 = 20000;

/// Per-attempt connect timeout for inter-node sends.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Send attempts before a peer is declared unreachable.
const SEND_ATTEMPTS: u32 = 3;

/// Pause between attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Sends one message to a peer's gossip address, retrying on failure.
pub async fn send_message(addr: &str, msg: &ClusterMessage) -> Result<(), ClusterError> {
    let encoded = msg.encode();
    let mut frame = Vec::with_capacity(4 + encoded.len());
    frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    frame.extend_from_slice(&encoded);

    for attempt in 1..=SEND_ATTEMPTS {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => match stream.write_all(&frame).await {
                Ok(()) => {
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
                Err(e) => debug!(%addr, attempt, "gossip write failed: {e}"),
            },
            Ok(Err(e)) => debug!(%addr, attempt, "gossip connect failed: {e}"),
            Err(_) => debug!(%addr, attempt, "gossip connect timed out"),
        }
        if attempt < SEND_ATTEMPTS {
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }
    Err(ClusterError::Unreachable(addr.to_owned()))
}

fn dispatch_outgoing(outgoing: Vec<(String, ClusterMessage)>) {
    for (addr, msg) in outgoing {
        tokio::spawn(async move {
            if let Err(e) = send_message(&addr, &msg).await {
                warn!("gossip send to {addr} failed: {e}");
            }
        });
    }
}

/// Reads one framed message from an accepted connection.
async fn read_frame(stream: &mut TcpStream) -> std::io::Result<ClusterMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_PAYLOAD + 1024 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("gossip frame length {len} exceeds cap"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    ClusterMessage::decode(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

/// Binds the gossip listener and starts the heartbeat and status
/// timers. Returns after spawning; tasks stop when `shutdown` flips.
pub async fn start(
    engine: Arc<Mutex<GossipEngine>>,
    bind_addr: String,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&bind_addr).await?;
    info!(%bind_addr, "cluster gossip listening");

    let (heartbeat_interval, status_interval) = {
        let engine = engine.lock().expect("gossip engine lock");
        let config = engine.config();
        (config.heartbeat_interval, config.status_interval)
    };

    // accept loop
    {
        let engine = Arc::clone(&engine);
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((mut stream, peer)) => {
                            let engine = Arc::clone(&engine);
                            tokio::spawn(async move {
                                match read_frame(&mut stream).await {
                                    Ok(msg) => {
                                        let outgoing = {
                                            let mut engine =
                                                engine.lock().expect("gossip engine lock");
                                            engine.handle_message(msg, now_ms())
                                        };
                                        dispatch_outgoing(outgoing);
                                    }
                                    Err(e) => debug!(%peer, "bad gossip frame: {e}"),
                                }
                            });
                        }
                        Err(e) => {
                            warn!("gossip accept error: {e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // heartbeat timer
    {
        let engine = Arc::clone(&engine);
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let outgoing = {
                            let mut engine = engine.lock().expect("gossip engine lock");
                            engine.heartbeat_tick(now_ms())
                        };
                        dispatch_outgoing(outgoing);
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // status timer
    {
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(status_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let outgoing = {
                            let mut engine = engine.lock().expect("gossip engine lock");
                            engine.status_tick(now_ms())
                        };
                        dispatch_outgoing(outgoing);
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::GossipConfig;
    use crate::message::MessageKind;
    use crate::node::{NodeDescriptor, NodeRole};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn frame_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await.unwrap()
        });

        let msg = ClusterMessage::new(MessageKind::Heartbeat, "node1", 42);
        send_message(&addr.to_string(), &msg).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn unreachable_peer_errors_after_retries() {
        // a bound-then-dropped listener leaves a dead port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let msg = ClusterMessage::new(MessageKind::Ping, "node1", 0);
        let err = send_message(&addr, &msg).await.unwrap_err();
        assert!(matches!(err, ClusterError::Unreachable(_)));
    }

    #[tokio::test]
    async fn listener_processes_heartbeat() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let local = NodeDescriptor::new("local", "127.0.0.1", 6379, NodeRole::Master);
        let engine = Arc::new(Mutex::new(GossipEngine::new(
            local,
            GossipConfig::default(),
            tx,
        )));

        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let bind = format!("127.0.0.1:{port}");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        start(Arc::clone(&engine), bind.clone(), shutdown_rx)
            .await
            .unwrap();

        let newcomer = NodeDescriptor::new("peer", "127.0.0.1", 7000, NodeRole::Slave);
        let msg = ClusterMessage::new(MessageKind::Heartbeat, "peer", 1)
            .with_payload(crate::message::encode_node(&newcomer));
        send_message(&bind, &msg).await.unwrap();

        // the engine learns the peer shortly after the frame lands
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if engine.lock().unwrap().registry().get("peer").is_some() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "peer never learned");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            crate::gossip::ClusterEvent::NodeJoined("peer".into())
        );
    }
}
