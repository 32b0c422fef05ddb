//! List, set, hash, and sorted-set commands, end to end.

use crate::helpers::{Reply, TestServer};

#[tokio::test]
async fn list_push_range_index() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    assert_eq!(client.get_int("LPUSH nums a b c").await, 3);
    assert_eq!(client.get_array("LRANGE nums 0 -1").await, vec!["c", "b", "a"]);
    assert_eq!(client.get_bulk("LINDEX nums -1").await.as_deref(), Some("a"));
    assert_eq!(client.get_bulk("LINDEX nums 0").await.as_deref(), Some("c"));
    assert_eq!(client.get_bulk("LINDEX nums 9").await, None);
    assert_eq!(client.get_int("LLEN nums").await, 3);
}

#[tokio::test]
async fn list_pops_and_rpush() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    assert_eq!(client.get_int("RPUSH q one two three").await, 3);
    assert_eq!(client.get_bulk("LPOP q").await.as_deref(), Some("one"));
    assert_eq!(client.get_bulk("RPOP q").await.as_deref(), Some("three"));
    assert_eq!(client.get_bulk("LPOP q").await.as_deref(), Some("two"));
    // the emptied list is gone
    assert_eq!(client.get_bulk("LPOP q").await, None);
    assert_eq!(client.get_int("EXISTS q").await, 0);
}

#[tokio::test]
async fn lset_and_lrem() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.get_int("RPUSH l a b a c a").await;
    client.ok("LSET l 1 B").await;
    assert_eq!(
        client.get_array("LRANGE l 0 -1").await,
        vec!["a", "B", "a", "c", "a"]
    );
    assert_eq!(client.get_int("LREM l 2 a").await, 2);
    assert_eq!(client.get_array("LRANGE l 0 -1").await, vec!["B", "c", "a"]);

    let msg = client.err("LSET missing 0 v").await;
    assert!(msg.contains("no such key"), "{msg}");
    let msg = client.err("LSET l 99 v").await;
    assert!(msg.contains("index out of range"), "{msg}");
}

#[tokio::test]
async fn set_members_lexicographic() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    assert_eq!(client.get_int("SADD s x y z").await, 3);
    assert_eq!(client.get_int("SADD s x").await, 0);
    assert_eq!(client.get_array("SMEMBERS s").await, vec!["x", "y", "z"]);
    assert_eq!(client.get_int("SISMEMBER s y").await, 1);
    assert_eq!(client.get_int("SISMEMBER s w").await, 0);
    assert_eq!(client.get_int("SCARD s").await, 3);
    assert_eq!(client.get_int("SREM s x w").await, 1);
    assert_eq!(client.get_int("SCARD s").await, 2);
}

#[tokio::test]
async fn set_algebra() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.get_int("SADD a 1 2 3").await;
    client.get_int("SADD b 2 3 4").await;

    assert_eq!(client.get_array("SINTER a b").await, vec!["2", "3"]);
    assert_eq!(client.get_array("SUNION a b").await, vec!["1", "2", "3", "4"]);
    assert_eq!(client.get_array("SDIFF a b").await, vec!["1"]);
    // intersecting with a nonexistent set is empty
    assert_eq!(client.cmd("SINTER a t").await, Reply::Array(vec![]));
}

#[tokio::test]
async fn spop_and_srandmember() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.get_int("SADD s a b c d").await;

    // sampling leaves the set intact
    let sampled = client.get_array("SRANDMEMBER s 3").await;
    assert_eq!(sampled.len(), 3);
    assert_eq!(client.get_int("SCARD s").await, 4);

    // negative count may repeat members
    let with_replacement = client.get_array("SRANDMEMBER s -9").await;
    assert_eq!(with_replacement.len(), 9);

    // popping removes
    let popped = client.get_array("SPOP s 2").await;
    assert_eq!(popped.len(), 2);
    assert_eq!(client.get_int("SCARD s").await, 2);
}

#[tokio::test]
async fn hash_commands() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    assert_eq!(client.get_int("HSET h f1 v1 f2 v2").await, 2);
    assert_eq!(client.get_bulk("HGET h f1").await.as_deref(), Some("v1"));
    assert_eq!(client.get_bulk("HGET h nope").await, None);
    assert_eq!(client.get_int("HEXISTS h f2").await, 1);
    assert_eq!(client.get_int("HLEN h").await, 2);
    assert_eq!(
        client.get_array("HGETALL h").await,
        vec!["f1", "v1", "f2", "v2"]
    );
    assert_eq!(client.get_array("HKEYS h").await, vec!["f1", "f2"]);
    assert_eq!(client.get_array("HVALS h").await, vec!["v1", "v2"]);

    assert_eq!(
        client.cmd("HMGET h f1 nope").await,
        Reply::Array(vec![Reply::Bulk(Some("v1".into())), Reply::Bulk(None)])
    );

    assert_eq!(client.get_int("HSETNX h f1 other").await, 0);
    assert_eq!(client.get_int("HSETNX h f3 v3").await, 1);
    assert_eq!(client.get_int("HINCRBY h count 5").await, 5);
    assert_eq!(client.get_int("HINCRBY h count -2").await, 3);
    assert_eq!(client.get_int("HDEL h f1 f2").await, 2);
}

#[tokio::test]
async fn zset_ordering_and_ranks() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    assert_eq!(client.get_int("ZADD z 1 a 2 b 2 c").await, 3);
    assert_eq!(client.get_int("ZCARD z").await, 3);

    // ties in score break lexicographically
    assert_eq!(client.get_array("ZRANGE z 0 -1").await, vec!["a", "b", "c"]);
    assert_eq!(
        client.get_array("ZRANGE z 0 -1 WITHSCORES").await,
        vec!["a", "1.0", "b", "2.0", "c", "2.0"]
    );
    assert_eq!(
        client.get_array("ZREVRANGE z 0 -1").await,
        vec!["c", "b", "a"]
    );

    assert_eq!(client.get_int("ZRANK z b").await, 1);
    assert_eq!(client.get_int("ZREVRANK z b").await, 1);
    assert_eq!(client.cmd("ZRANK z nope").await, Reply::Bulk(None));

    assert_eq!(client.get_bulk("ZSCORE z b").await.as_deref(), Some("2.0"));
    assert_eq!(client.get_int("ZCOUNT z 2 3").await, 2);
    assert_eq!(client.get_int("ZCOUNT z -inf +inf").await, 3);
}

#[tokio::test]
async fn zset_update_and_removal() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.get_int("ZADD z 1 a 2 b").await;
    // re-adding an existing member updates its score, adds nothing
    assert_eq!(client.get_int("ZADD z 9 a").await, 0);
    assert_eq!(client.get_array("ZRANGE z 0 -1").await, vec!["b", "a"]);

    assert_eq!(
        client.get_bulk("ZINCRBY z 1.5 b").await.as_deref(),
        Some("3.5")
    );
    assert_eq!(client.get_int("ZREM z a nope").await, 1);
    assert_eq!(client.get_int("ZCARD z").await, 1);
}

#[tokio::test]
async fn cross_type_commands_rejected() {
    let server = TestServer::start();
    let mut client = server.connect().await;

    client.ok("SET s text").await;
    for cmd in ["LPUSH s x", "SADD s x", "HSET s f v", "ZADD s 1 m"] {
        let msg = client.err(cmd).await;
        assert!(msg.starts_with("WRONGTYPE"), "{cmd}: {msg}");
    }
    // the original value is untouched
    assert_eq!(client.get_bulk("GET s").await.as_deref(), Some("text"));
}
