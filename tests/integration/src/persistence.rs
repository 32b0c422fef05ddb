//! Durability across restarts.

use crate::helpers::{ServerOptions, TestServer};

/// With `appendfsync always`, every acknowledged write is on disk, so
/// the keyspace survives even an abrupt kill.
#[tokio::test]
async fn aof_survives_restart() {
    let data_dir = tempfile::tempdir().unwrap();

    {
        let server = TestServer::start_with(ServerOptions {
            persistence: Some("aof"),
            appendfsync: Some("always"),
            data_dir_path: Some(data_dir.path().to_path_buf()),
            ..ServerOptions::default()
        });
        let mut client = server.connect().await;
        client.ok("SET greeting hello").await;
        client.get_int("SADD tags x y").await;
        client.get_int("ZADD board 1.5 alice 2 bob").await;
        client.ok("SELECT 1").await;
        client.ok("SET other shard").await;
        // server killed on drop
    }

    let server = TestServer::start_with(ServerOptions {
        persistence: Some("aof"),
        appendfsync: Some("always"),
        data_dir_path: Some(data_dir.path().to_path_buf()),
        ..ServerOptions::default()
    });
    let mut client = server.connect().await;

    assert_eq!(
        client.get_bulk("GET greeting").await.as_deref(),
        Some("hello")
    );
    assert_eq!(client.get_array("SMEMBERS tags").await, vec!["x", "y"]);
    assert_eq!(
        client.get_bulk("ZSCORE board alice").await.as_deref(),
        Some("1.5")
    );
    client.ok("SELECT 1").await;
    assert_eq!(client.get_bulk("GET other").await.as_deref(), Some("shard"));
}

/// Deletions must also replay: a key deleted before the restart stays
/// deleted after it.
#[tokio::test]
async fn aof_replays_deletions() {
    let data_dir = tempfile::tempdir().unwrap();

    {
        let server = TestServer::start_with(ServerOptions {
            persistence: Some("aof"),
            appendfsync: Some("always"),
            data_dir_path: Some(data_dir.path().to_path_buf()),
            ..ServerOptions::default()
        });
        let mut client = server.connect().await;
        client.ok("SET keep 1").await;
        client.ok("SET gone 1").await;
        client.get_int("DEL gone").await;
    }

    let server = TestServer::start_with(ServerOptions {
        persistence: Some("aof"),
        appendfsync: Some("always"),
        data_dir_path: Some(data_dir.path().to_path_buf()),
        ..ServerOptions::default()
    });
    let mut client = server.connect().await;
    assert_eq!(client.get_bulk("GET keep").await.as_deref(), Some("1"));
    assert_eq!(client.get_bulk("GET gone").await, None);
}

/// A fresh rdb-mode server initializes its snapshot file on startup.
#[tokio::test]
async fn rdb_server_initializes_snapshot() {
    let data_dir = tempfile::tempdir().unwrap();

    let server = TestServer::start_with(ServerOptions {
        persistence: Some("rdb"),
        data_dir_path: Some(data_dir.path().to_path_buf()),
        ..ServerOptions::default()
    });
    let mut client = server.connect().await;
    client.ok("SET k v").await;

    let dump = data_dir.path().join("dump.rdb");
    assert!(dump.exists(), "dump.rdb missing after startup");
    let header = std::fs::read(&dump).unwrap();
    assert!(header.starts_with(b"REDIS"), "snapshot header wrong");
}

/// A corrupt snapshot is quarantined instead of failing startup.
#[tokio::test]
async fn corrupt_snapshot_quarantined_on_startup() {
    let data_dir = tempfile::tempdir().unwrap();
    std::fs::write(data_dir.path().join("dump.rdb"), b"garbage, not a snapshot").unwrap();

    let server = TestServer::start_with(ServerOptions {
        persistence: Some("rdb"),
        data_dir_path: Some(data_dir.path().to_path_buf()),
        ..ServerOptions::default()
    });
    let mut client = server.connect().await;
    // the server came up empty and usable
    client.ok("SET k v").await;

    let backups: Vec<_> = std::fs::read_dir(data_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".bak."))
        .collect();
    assert_eq!(backups.len(), 1, "corrupt file was not quarantined");
}
