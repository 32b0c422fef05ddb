//! Master/slave replication, end to end.

use std::time::Duration;

use crate::helpers::{ServerOptions, TestServer};

fn master() -> TestServer {
    TestServer::start_with(ServerOptions {
        node_id: Some("master"),
        ..ServerOptions::default()
    })
}

fn slave_of(master_port: u16) -> TestServer {
    TestServer::start_with(ServerOptions {
        node_role: Some("slave"),
        master_port: Some(master_port),
        node_id: Some("slave1"),
        ..ServerOptions::default()
    })
}

/// Polls the slave until the expected value appears or time runs out.
async fn wait_for_value(slave: &TestServer, key: &str, expected: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut client = slave.connect().await;
        if client.get_bulk(&format!("GET {key}")).await.as_deref() == Some(expected) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "slave never observed {key}={expected}"
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[tokio::test]
async fn slave_pulls_master_state() {
    let master = master();
    let mut client = master.connect().await;
    client.ok("SET shared before-slave").await;
    client.get_int("ZADD board 1 a 2 b").await;

    let slave = slave_of(master.port);
    wait_for_value(&slave, "shared", "before-slave").await;

    let mut sclient = slave.connect().await;
    assert_eq!(sclient.get_array("ZRANGE board 0 -1").await, vec!["a", "b"]);
}

#[tokio::test]
async fn slave_converges_on_later_writes() {
    let master = master();
    let slave = slave_of(master.port);

    let mut client = master.connect().await;
    client.ok("SET k v1").await;
    wait_for_value(&slave, "k", "v1").await;

    client.ok("SET k v2").await;
    wait_for_value(&slave, "k", "v2").await;
}

#[tokio::test]
async fn slave_rejects_writes() {
    let master = master();
    let slave = slave_of(master.port);

    let mut client = slave.connect().await;
    let msg = client.err("SET k v").await;
    assert!(msg.starts_with("READONLY"), "{msg}");

    // reads are fine
    assert_eq!(client.get_bulk("GET k").await, None);

    // and ROLE reports the slave identity
    let info = client.get_bulk("INFO").await.expect("INFO");
    assert!(info.contains("role:slave"), "{info}");
}

#[tokio::test]
async fn deletions_propagate_via_full_pull() {
    let master = master();
    let slave = slave_of(master.port);

    let mut client = master.connect().await;
    client.ok("SET doomed 1").await;
    wait_for_value(&slave, "doomed", "1").await;

    client.get_int("DEL doomed").await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut sclient = slave.connect().await;
        if sclient.get_bulk("GET doomed").await.is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "deletion never reached the slave"
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
