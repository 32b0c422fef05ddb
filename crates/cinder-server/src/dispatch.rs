//! Command execution against the shard vector.
//!
//! The executor owns the error boundary: every failure becomes a `-…`
//! reply and the connection stays open. Write commands are rejected on
//! read-only replicas and, once executed, appended to the log in aof
//! mode.

use std::sync::Arc;

use bytes::Bytes;
use cinder_cluster::NodeRole;
use cinder_core::{Db, DbManager, PersistenceMode, TtlResult};
use cinder_protocol::{Command, Frame};
use tracing::warn;

use crate::replication::SharedRepl;

/// Shared handles every connection dispatches against.
pub struct ServerContext {
    pub manager: Arc<DbManager>,
    pub repl: SharedRepl,
    pub cluster_enabled: bool,
    pub node_id: String,
    pub port: u16,
}

/// Per-connection state: the shard selected by SELECT.
#[derive(Debug, Default)]
pub struct ConnState {
    pub db_index: usize,
}

fn err(msg: impl std::fmt::Display) -> Frame {
    Frame::Error(msg.to_string())
}

fn bool_int(b: bool) -> Frame {
    Frame::Integer(i64::from(b))
}

fn bulk_array(items: Vec<Bytes>) -> Frame {
    Frame::Array(items.into_iter().map(Frame::Bulk).collect())
}

fn string_array(items: Vec<String>) -> Frame {
    Frame::Array(items.into_iter().map(Frame::bulk).collect())
}

/// Formats a sorted-set score the way the wire expects: integral
/// scores keep one decimal place, everything else prints naturally.
fn fmt_score(score: f64) -> String {
    if score.is_finite() && score.fract() == 0.0 {
        format!("{score:.1}")
    } else {
        format!("{score}")
    }
}

/// Executes one parsed command and returns the reply frame.
pub fn execute(ctx: &ServerContext, conn: &mut ConnState, cmd: Command) -> Frame {
    // a replica's client connections are read-only, unconditionally
    if cmd.is_write() {
        let role = ctx.repl.read().expect("repl state lock").role;
        if role == NodeRole::Slave {
            return Frame::Error(
                "READONLY You can't write against a read only replica".into(),
            );
        }
    }

    let db = match ctx.manager.db(conn.db_index) {
        Some(db) => Arc::clone(db),
        None => return err("ERR DB index is out of range"),
    };

    let append = cmd.is_write() && ctx.manager.mode() == PersistenceMode::Aof;
    let log_line = if append { aof_line(&cmd) } else { None };

    let reply = run(ctx, conn, &db, cmd);

    if let Some(line) = log_line {
        if !matches!(reply, Frame::Error(_)) {
            ctx.manager.append_aof(conn.db_index, line);
        }
    }
    reply
}

fn run(ctx: &ServerContext, conn: &mut ConnState, db: &Db, cmd: Command) -> Frame {
    match cmd {
        // -- connection --
        Command::Ping(None) => Frame::Simple("PONG".into()),
        Command::Ping(Some(msg)) => Frame::bulk(msg),
        Command::Echo(msg) => Frame::bulk(msg),
        Command::Select(index) => {
            if index >= 0 && (index as usize) < ctx.manager.shard_count() {
                conn.db_index = index as usize;
                Frame::ok()
            } else {
                err("ERR DB index is out of range")
            }
        }
        Command::Quit => Frame::Simple("OK bye".into()),

        // -- keyspace --
        Command::Del(keys) => {
            let removed = keys.iter().filter(|k| db.delete(k).is_some()).count();
            Frame::Integer(removed as i64)
        }
        Command::Exists(keys) => {
            let present = keys.iter().filter(|k| db.exists(k)).count();
            Frame::Integer(present as i64)
        }
        Command::Type(key) => match db.type_name(&key) {
            Some(name) => Frame::Simple(name.into()),
            None => Frame::Simple("none".into()),
        },
        Command::Expire { key, seconds } => {
            if seconds <= 0 {
                // an expiration in the past is an immediate delete
                db.delete(&key);
            } else {
                db.expire(&key, seconds.saturating_mul(1000));
            }
            Frame::ok()
        }
        Command::Ttl(key) => match db.ttl(&key) {
            // milliseconds round up so a freshly-set TTL reads whole
            TtlResult::Remaining(ms) => Frame::Integer((ms + 999) / 1000),
            TtlResult::NoExpiry => Frame::Integer(-1),
            TtlResult::Missing => Frame::Integer(-2),
        },
        Command::Persist(key) => {
            db.persist(&key);
            Frame::ok()
        }
        Command::Keys(pattern) => {
            let mut keys: Vec<String> = db
                .keys()
                .into_iter()
                .filter(|k| cinder_core::pattern::glob_match(&pattern, k))
                .collect();
            keys.sort();
            string_array(keys)
        }
        Command::FlushDb => {
            db.clear();
            Frame::ok()
        }
        Command::Info => Frame::bulk(info_text(ctx)),

        // -- string --
        Command::Set { key, value } => {
            db.set(&key, Bytes::from(value));
            Frame::ok()
        }
        Command::Get(key) => match db.get(&key) {
            Ok(Some(value)) => Frame::Bulk(value),
            Ok(None) => Frame::Null,
            Err(e) => err(e),
        },
        Command::GetSet { key, value } => match db.getset(&key, Bytes::from(value)) {
            Ok(Some(previous)) => Frame::Bulk(previous),
            Ok(None) => Frame::Null,
            Err(e) => err(e),
        },
        Command::Incr(key) => int_reply(db.incr_by(&key, 1)),
        Command::Decr(key) => int_reply(db.incr_by(&key, -1)),
        Command::IncrBy { key, delta } => int_reply(db.incr_by(&key, delta)),
        Command::DecrBy { key, delta } => match delta.checked_neg() {
            Some(neg) => int_reply(db.incr_by(&key, neg)),
            None => err("ERR increment or decrement would overflow"),
        },

        // -- list --
        Command::LPush { key, values } => {
            len_reply(db.lpush(&key, values.into_iter().map(Bytes::from).collect()))
        }
        Command::RPush { key, values } => {
            len_reply(db.rpush(&key, values.into_iter().map(Bytes::from).collect()))
        }
        Command::LPop(key) => opt_bulk_reply(db.lpop(&key)),
        Command::RPop(key) => opt_bulk_reply(db.rpop(&key)),
        Command::LLen(key) => len_reply(db.llen(&key)),
        Command::LRange { key, start, stop } => match db.lrange(&key, start, stop) {
            Ok(items) => bulk_array(items),
            Err(e) => err(e),
        },
        Command::LIndex { key, index } => opt_bulk_reply(db.lindex(&key, index)),
        Command::LSet { key, index, value } => {
            match db.lset(&key, index, Bytes::from(value)) {
                Ok(()) => Frame::ok(),
                Err(e) => err(e),
            }
        }
        Command::LRem { key, count, value } => {
            match db.lrem(&key, count, value.as_bytes()) {
                Ok(removed) => Frame::Integer(removed as i64),
                Err(e) => err(e),
            }
        }

        // -- set --
        Command::SAdd { key, members } => len_reply(db.sadd(&key, members)),
        Command::SRem { key, members } => len_reply(db.srem(&key, &members)),
        Command::SMembers(key) => match db.smembers(&key) {
            Ok(members) => string_array(members),
            Err(e) => err(e),
        },
        Command::SIsMember { key, member } => match db.sismember(&key, &member) {
            Ok(present) => bool_int(present),
            Err(e) => err(e),
        },
        Command::SCard(key) => len_reply(db.scard(&key)),
        Command::SPop { key, count } => match db.spop(&key, count.unwrap_or(1)) {
            Ok(mut popped) => match count {
                Some(_) => string_array(popped),
                None => match popped.pop() {
                    Some(member) => Frame::bulk(member),
                    None => Frame::Null,
                },
            },
            Err(e) => err(e),
        },
        Command::SRandMember { key, count } => {
            match db.srandmember(&key, count.unwrap_or(1)) {
                Ok(mut sampled) => match count {
                    Some(_) => string_array(sampled),
                    None => match sampled.pop() {
                        Some(member) => Frame::bulk(member),
                        None => Frame::Null,
                    },
                },
                Err(e) => err(e),
            }
        }
        Command::SInter(keys) => set_algebra_reply(db.sinter(&as_refs(&keys))),
        Command::SUnion(keys) => set_algebra_reply(db.sunion(&as_refs(&keys))),
        Command::SDiff(keys) => set_algebra_reply(db.sdiff(&as_refs(&keys))),

        // -- hash --
        Command::HSet { key, pairs } => len_reply(db.hset(
            &key,
            pairs
                .into_iter()
                .map(|(f, v)| (f, Bytes::from(v)))
                .collect(),
        )),
        Command::HGet { key, field } => opt_bulk_reply(db.hget(&key, &field)),
        Command::HDel { key, fields } => len_reply(db.hdel(&key, &fields)),
        Command::HExists { key, field } => match db.hexists(&key, &field) {
            Ok(present) => bool_int(present),
            Err(e) => err(e),
        },
        Command::HGetAll(key) => match db.hgetall(&key) {
            Ok(pairs) => {
                let mut frames = Vec::with_capacity(pairs.len() * 2);
                for (field, value) in pairs {
                    frames.push(Frame::bulk(field));
                    frames.push(Frame::Bulk(value));
                }
                Frame::Array(frames)
            }
            Err(e) => err(e),
        },
        Command::HKeys(key) => match db.hkeys(&key) {
            Ok(fields) => string_array(fields),
            Err(e) => err(e),
        },
        Command::HVals(key) => match db.hvals(&key) {
            Ok(values) => bulk_array(values),
            Err(e) => err(e),
        },
        Command::HLen(key) => len_reply(db.hlen(&key)),
        Command::HMGet { key, fields } => match db.hmget(&key, &fields) {
            Ok(values) => Frame::Array(
                values
                    .into_iter()
                    .map(|v| v.map(Frame::Bulk).unwrap_or(Frame::Null))
                    .collect(),
            ),
            Err(e) => err(e),
        },
        Command::HSetNx { key, field, value } => {
            match db.hsetnx(&key, field, Bytes::from(value)) {
                Ok(set) => bool_int(set),
                Err(e) => err(e),
            }
        }
        Command::HIncrBy { key, field, delta } => int_reply(db.hincrby(&key, &field, delta)),

        // -- sorted set --
        Command::ZAdd { key, members } => len_reply(db.zadd(&key, members)),
        Command::ZCard(key) => len_reply(db.zcard(&key)),
        Command::ZCount { key, min, max } => len_reply(db.zcount(&key, min, max)),
        Command::ZIncrBy { key, delta, member } => match db.zincrby(&key, delta, &member) {
            Ok(score) => Frame::bulk(fmt_score(score)),
            Err(e) => err(e),
        },
        Command::ZRange {
            key,
            start,
            stop,
            with_scores,
        } => zrange_reply(db.zrange(&key, start, stop), with_scores),
        Command::ZRevRange {
            key,
            start,
            stop,
            with_scores,
        } => zrange_reply(db.zrevrange(&key, start, stop), with_scores),
        Command::ZRank { key, member } => rank_reply(db.zrank(&key, &member)),
        Command::ZRevRank { key, member } => rank_reply(db.zrevrank(&key, &member)),
        Command::ZRem { key, members } => len_reply(db.zrem(&key, &members)),
        Command::ZScore { key, member } => match db.zscore(&key, &member) {
            Ok(Some(score)) => Frame::bulk(fmt_score(score)),
            Ok(None) => Frame::Null,
            Err(e) => err(e),
        },

        // -- replication / cluster --
        Command::ReadOnly => Frame::ok(),
        Command::Role => {
            let state = ctx.repl.read().expect("repl state lock").clone();
            match state.role {
                NodeRole::Master => Frame::Array(vec![Frame::bulk("master")]),
                NodeRole::Slave => {
                    let (host, port) = state.master.unwrap_or_default();
                    Frame::Array(vec![
                        Frame::bulk("slave"),
                        Frame::bulk(host),
                        Frame::Integer(i64::from(port)),
                    ])
                }
            }
        }
        Command::SlaveOf(target) => {
            if !ctx.cluster_enabled {
                return err("ERR not running in cluster mode");
            }
            let mut state = ctx.repl.write().expect("repl state lock");
            match target {
                Some((host, port)) => {
                    state.role = NodeRole::Slave;
                    state.master = Some((host, port));
                }
                None => {
                    state.role = NodeRole::Master;
                    state.master = None;
                }
            }
            Frame::ok()
        }
    }
}

fn as_refs(keys: &[String]) -> Vec<&str> {
    keys.iter().map(String::as_str).collect()
}

fn int_reply(result: Result<i64, cinder_core::IntegerError>) -> Frame {
    match result {
        Ok(value) => Frame::Integer(value),
        Err(e) => err(e),
    }
}

fn len_reply(result: Result<usize, cinder_core::WrongType>) -> Frame {
    match result {
        Ok(len) => Frame::Integer(len as i64),
        Err(e) => err(e),
    }
}

fn opt_bulk_reply(result: Result<Option<Bytes>, cinder_core::WrongType>) -> Frame {
    match result {
        Ok(Some(value)) => Frame::Bulk(value),
        Ok(None) => Frame::Null,
        Err(e) => err(e),
    }
}

fn set_algebra_reply(result: Result<Vec<String>, cinder_core::WrongType>) -> Frame {
    match result {
        Ok(members) => string_array(members),
        Err(e) => err(e),
    }
}

fn rank_reply(result: Result<Option<usize>, cinder_core::WrongType>) -> Frame {
    match result {
        Ok(Some(rank)) => Frame::Integer(rank as i64),
        Ok(None) => Frame::Null,
        Err(e) => err(e),
    }
}

fn zrange_reply(
    result: Result<Vec<(String, f64)>, cinder_core::WrongType>,
    with_scores: bool,
) -> Frame {
    match result {
        Ok(members) => {
            let mut frames = Vec::with_capacity(members.len() * if with_scores { 2 } else { 1 });
            for (member, score) in members {
                frames.push(Frame::bulk(member));
                if with_scores {
                    frames.push(Frame::bulk(fmt_score(score)));
                }
            }
            Frame::Array(frames)
        }
        Err(e) => err(e),
    }
}

/// The INFO reply. Role comes from the live replication state, never
/// from the cluster flag.
fn info_text(ctx: &ServerContext) -> String {
    let state = ctx.repl.read().expect("repl state lock").clone();
    let mut text = String::new();

    text.push_str("# Server\r\n");
    text.push_str(&format!("cinder_version:{}\r\n", env!("CARGO_PKG_VERSION")));
    text.push_str(&format!("node_id:{}\r\n", ctx.node_id));
    text.push_str(&format!("tcp_port:{}\r\n", ctx.port));
    text.push_str("\r\n# Replication\r\n");
    text.push_str(&format!("role:{}\r\n", state.role.as_str()));
    if let Some((host, port)) = state.master {
        text.push_str(&format!("master_host:{host}\r\n"));
        text.push_str(&format!("master_port:{port}\r\n"));
    }
    text.push_str(&format!(
        "cluster_enabled:{}\r\n",
        i64::from(ctx.cluster_enabled)
    ));
    text.push_str("\r\n# Keyspace\r\n");
    for (index, db) in ctx.manager.dbs().iter().enumerate() {
        let keys = db.size();
        if keys > 0 {
            text.push_str(&format!("db{index}:keys={keys}\r\n"));
        }
    }
    text
}

/// Rebuilds the canonical log line for a write command. `None` for
/// writes that need no replay (none currently).
fn aof_line(cmd: &Command) -> Option<String> {
    use cinder_persistence::aof::encode_command;

    fn strs(items: &[String]) -> Vec<&str> {
        items.iter().map(String::as_str).collect()
    }

    let line = match cmd {
        Command::Del(keys) => encode_command("DEL", &strs(keys)),
        Command::Expire { key, seconds } => {
            encode_command("EXPIRE", &[key, &seconds.to_string()])
        }
        Command::Persist(key) => encode_command("PERSIST", &[key]),
        Command::FlushDb => encode_command("FLUSHDB", &[]),
        Command::Set { key, value } => encode_command("SET", &[key, value]),
        Command::GetSet { key, value } => encode_command("SET", &[key, value]),
        Command::Incr(key) => encode_command("INCR", &[key]),
        Command::Decr(key) => encode_command("DECR", &[key]),
        Command::IncrBy { key, delta } => encode_command("INCRBY", &[key, &delta.to_string()]),
        Command::DecrBy { key, delta } => encode_command("DECRBY", &[key, &delta.to_string()]),
        Command::LPush { key, values } => {
            let mut args = vec![key.as_str()];
            args.extend(values.iter().map(String::as_str));
            encode_command("LPUSH", &args)
        }
        Command::RPush { key, values } => {
            let mut args = vec![key.as_str()];
            args.extend(values.iter().map(String::as_str));
            encode_command("RPUSH", &args)
        }
        Command::LPop(key) => encode_command("LPOP", &[key]),
        Command::RPop(key) => encode_command("RPOP", &[key]),
        Command::LSet { key, index, value } => {
            encode_command("LSET", &[key, &index.to_string(), value])
        }
        Command::LRem { key, count, value } => {
            encode_command("LREM", &[key, &count.to_string(), value])
        }
        Command::SAdd { key, members } => {
            let mut args = vec![key.as_str()];
            args.extend(members.iter().map(String::as_str));
            encode_command("SADD", &args)
        }
        Command::SRem { key, members } => {
            let mut args = vec![key.as_str()];
            args.extend(members.iter().map(String::as_str));
            encode_command("SREM", &args)
        }
        Command::SPop { key, count } => match count {
            Some(n) => encode_command("SPOP", &[key, &n.to_string()]),
            None => encode_command("SPOP", &[key]),
        },
        Command::HSet { key, pairs } => {
            let mut args = vec![key.as_str()];
            for (field, value) in pairs {
                args.push(field);
                args.push(value);
            }
            encode_command("HSET", &args)
        }
        Command::HDel { key, fields } => {
            let mut args = vec![key.as_str()];
            args.extend(fields.iter().map(String::as_str));
            encode_command("HDEL", &args)
        }
        Command::HSetNx { key, field, value } => {
            encode_command("HSETNX", &[key, field, value])
        }
        Command::HIncrBy { key, field, delta } => {
            encode_command("HINCRBY", &[key, field, &delta.to_string()])
        }
        Command::ZAdd { key, members } => {
            let mut line = format!("ZADD {key}");
            for (score, member) in members {
                line.push(' ');
                line.push_str(&score.to_string());
                line.push(' ');
                line.push_str(member);
            }
            line
        }
        Command::ZRem { key, members } => {
            let mut args = vec![key.as_str()];
            args.extend(members.iter().map(String::as_str));
            encode_command("ZREM", &args)
        }
        Command::ZIncrBy { key, delta, member } => {
            encode_command("ZINCRBY", &[key, &delta.to_string(), member])
        }
        other => {
            warn!("no log form for write command {other:?}");
            return None;
        }
    };
    Some(line)
}
