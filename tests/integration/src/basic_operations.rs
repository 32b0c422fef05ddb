//! Keyspace and string commands, end to end.

use std::time::Duration;

use crate::helpers::{Reply, TestServer};

#[tokio::test]
async fn set_get_type() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.ok("SET foo bar").await;
    assert_eq!(client.get_bulk("GET foo").await.as_deref(), Some("bar"));
    assert_eq!(client.get_bulk("GET missing").await, None);
    assert_eq!(
        client.cmd("TYPE foo").await,
        Reply::Simple("string".into())
    );
    assert_eq!(
        client.cmd("TYPE missing").await,
        Reply::Simple("none".into())
    );
}

#[tokio::test]
async fn getset_returns_previous_value() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    assert_eq!(client.get_bulk("GETSET k one").await, None);
    assert_eq!(client.get_bulk("GETSET k two").await.as_deref(), Some("one"));
    assert_eq!(client.get_bulk("GET k").await.as_deref(), Some("two"));
}

#[tokio::test]
async fn counter_commands() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.ok("SET n 10").await;
    assert_eq!(client.get_int("INCR n").await, 11);
    assert_eq!(client.get_int("INCRBY n 5").await, 16);
    assert_eq!(client.get_int("DECRBY n 6").await, 10);
    assert_eq!(client.get_int("DECR n").await, 9);
    // INCR on a missing key starts from zero
    assert_eq!(client.get_int("INCR fresh").await, 1);

    client.ok("SET n notanint").await;
    let msg = client.err("INCR n").await;
    assert!(
        msg.contains("value is not an integer or out of range"),
        "{msg}"
    );
}

#[tokio::test]
async fn del_and_exists_return_counts() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.ok("SET a 1").await;
    client.ok("SET b 2").await;
    client.ok("SET c 3").await;

    assert_eq!(client.get_int("EXISTS a b c nope").await, 3);
    assert_eq!(client.get_int("DEL a c nope").await, 2);
    assert_eq!(client.get_int("EXISTS a b c").await, 1);
}

#[tokio::test]
async fn expiration_end_to_end() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.ok("SET k v").await;
    assert_eq!(client.get_int("TTL k").await, -1);
    client.ok("EXPIRE k 1").await;
    let ttl = client.get_int("TTL k").await;
    assert!(ttl >= 1, "ttl was {ttl}");

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(client.get_bulk("GET k").await, None);
    assert_eq!(client.get_int("TTL k").await, -2);
}

#[tokio::test]
async fn persist_cancels_expiration() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.ok("SET k v").await;
    client.ok("EXPIRE k 1").await;
    client.ok("PERSIST k").await;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(client.get_bulk("GET k").await.as_deref(), Some("v"));
    assert_eq!(client.get_int("TTL k").await, -1);
}

#[tokio::test]
async fn keys_glob_patterns() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.ok("SET user:1 a").await;
    client.ok("SET user:2 b").await;
    client.ok("SET visit.count c").await;

    assert_eq!(
        client.get_array("KEYS user:*").await,
        vec!["user:1", "user:2"]
    );
    assert_eq!(client.get_array("KEYS user:?").await, vec!["user:1", "user:2"]);
    // `.` matches literally, not as a wildcard
    assert_eq!(client.get_array("KEYS visit.*").await, vec!["visit.count"]);
    assert!(client.get_array("KEYS visitX*").await.is_empty());
}

#[tokio::test]
async fn select_isolates_databases() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.ok("SET k zero").await;
    client.ok("SELECT 1").await;
    assert_eq!(client.get_bulk("GET k").await, None);
    client.ok("SET k one").await;
    client.ok("SELECT 0").await;
    assert_eq!(client.get_bulk("GET k").await.as_deref(), Some("zero"));

    let msg = client.err("SELECT 99").await;
    assert!(msg.contains("out of range"), "{msg}");
}

#[tokio::test]
async fn flushdb_clears_selected_database_only() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.ok("SET here 1").await;
    client.ok("SELECT 1").await;
    client.ok("SET there 1").await;
    client.ok("FLUSHDB").await;
    assert_eq!(client.get_bulk("GET there").await, None);
    client.ok("SELECT 0").await;
    assert_eq!(client.get_bulk("GET here").await.as_deref(), Some("1"));
}

#[tokio::test]
async fn ping_echo_and_quoting() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    assert_eq!(client.cmd("PING").await, Reply::Simple("PONG".into()));
    assert_eq!(
        client.get_bulk("ECHO hello").await.as_deref(),
        Some("hello")
    );
    client.ok(r#"SET msg "hello world""#).await;
    assert_eq!(
        client.get_bulk("GET msg").await.as_deref(),
        Some("hello world")
    );
}

#[tokio::test]
async fn protocol_errors_keep_connection_open() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    let msg = client.err("NOSUCHCOMMAND x y").await;
    assert!(msg.contains("unknown command"), "{msg}");

    let msg = client.err("GET").await;
    assert!(msg.contains("wrong number of arguments"), "{msg}");

    // the connection still works after errors
    client.ok("SET k v").await;
    assert_eq!(client.get_bulk("GET k").await.as_deref(), Some("v"));
}

#[tokio::test]
async fn wrongtype_error_text() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    assert_eq!(client.get_int("LPUSH l x").await, 1);
    let msg = client.err("GET l").await;
    assert_eq!(
        msg,
        "WRONGTYPE Operation against a key holding the wrong kind of value"
    );
    let msg = client.err("INCR l").await;
    assert!(msg.starts_with("WRONGTYPE"), "{msg}");
}

#[tokio::test]
async fn info_reports_master_role() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    let info = client.get_bulk("INFO").await.expect("INFO text");
    assert!(info.contains("role:master"), "{info}");
    assert!(info.contains("cluster_enabled:0"), "{info}");
}

#[tokio::test]
async fn readonly_is_acknowledged() {
    let server = TestServer::start();
    let mut client = server.connect().await;
    client.ok("READONLY").await;
}
