//! Typed commands and their argument validation.
//!
//! [`Command::parse`] consumes the token list produced by the
//! tokenizer. Argument counts are checked here; value-domain checks
//! (integer parsing, float parsing) also happen here so the executor
//! only ever sees well-formed commands. Outer quotes on arguments are
//! stripped at this boundary.

use crate::error::ProtocolError;
use crate::tokenize::strip_quotes;

/// A fully parsed client command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // -- connection --
    Ping(Option<String>),
    Echo(String),
    Select(i64),
    Quit,

    // -- keyspace --
    Del(Vec<String>),
    Exists(Vec<String>),
    Type(String),
    Expire { key: String, seconds: i64 },
    Ttl(String),
    Persist(String),
    Keys(String),
    FlushDb,
    Info,

    // -- string --
    Set { key: String, value: String },
    Get(String),
    GetSet { key: String, value: String },
    Incr(String),
    IncrBy { key: String, delta: i64 },
    Decr(String),
    DecrBy { key: String, delta: i64 },

    // -- list --
    LPush { key: String, values: Vec<String> },
    RPush { key: String, values: Vec<String> },
    LPop(String),
    RPop(String),
    LLen(String),
    LRange { key: String, start: i64, stop: i64 },
    LIndex { key: String, index: i64 },
    LSet { key: String, index: i64, value: String },
    LRem { key: String, count: i64, value: String },

    // -- set --
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    SMembers(String),
    SIsMember { key: String, member: String },
    SCard(String),
    SPop { key: String, count: Option<usize> },
    SRandMember { key: String, count: Option<i64> },
    SInter(Vec<String>),
    SUnion(Vec<String>),
    SDiff(Vec<String>),

    // -- hash --
    HSet { key: String, pairs: Vec<(String, String)> },
    HGet { key: String, field: String },
    HDel { key: String, fields: Vec<String> },
    HExists { key: String, field: String },
    HGetAll(String),
    HKeys(String),
    HVals(String),
    HLen(String),
    HMGet { key: String, fields: Vec<String> },
    HSetNx { key: String, field: String, value: String },
    HIncrBy { key: String, field: String, delta: i64 },

    // -- sorted set --
    ZAdd { key: String, members: Vec<(f64, String)> },
    ZCard(String),
    ZCount { key: String, min: f64, max: f64 },
    ZIncrBy { key: String, delta: f64, member: String },
    ZRange { key: String, start: i64, stop: i64, with_scores: bool },
    ZRank { key: String, member: String },
    ZRem { key: String, members: Vec<String> },
    ZRevRange { key: String, start: i64, stop: i64, with_scores: bool },
    ZRevRank { key: String, member: String },
    ZScore { key: String, member: String },

    // -- replication / cluster --
    ReadOnly,
    Role,
    /// `SLAVEOF host port`; `None` is `SLAVEOF NO ONE`.
    SlaveOf(Option<(String, u16)>),
}

fn parse_int(token: &str) -> Result<i64, ProtocolError> {
    token.parse().map_err(|_| ProtocolError::NotAnInteger)
}

fn parse_float(token: &str) -> Result<f64, ProtocolError> {
    match token {
        "+inf" | "inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        _ => token.parse().map_err(|_| ProtocolError::NotAFloat),
    }
}

fn arity(name: &str, ok: bool) -> Result<(), ProtocolError> {
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::WrongArity(name.to_lowercase()))
    }
}

impl Command {
    /// Parses a tokenized command line.
    pub fn parse(tokens: Vec<String>) -> Result<Self, ProtocolError> {
        let mut iter = tokens.into_iter();
        let name = iter.next().ok_or(ProtocolError::Empty)?;
        let args: Vec<String> = iter.map(|t| strip_quotes(&t).to_owned()).collect();
        let upper = name.to_ascii_uppercase();

        let cmd = match upper.as_str() {
            "PING" => {
                arity("ping", args.len() <= 1)?;
                Command::Ping(args.into_iter().next())
            }
            "ECHO" => {
                arity("echo", args.len() == 1)?;
                Command::Echo(args.into_iter().next().unwrap())
            }
            "SELECT" => {
                arity("select", args.len() == 1)?;
                Command::Select(parse_int(&args[0])?)
            }
            "QUIT" | "EXIT" => Command::Quit,

            "DEL" => {
                arity("del", !args.is_empty())?;
                Command::Del(args)
            }
            "EXISTS" => {
                arity("exists", !args.is_empty())?;
                Command::Exists(args)
            }
            "TYPE" => {
                arity("type", args.len() == 1)?;
                Command::Type(args.into_iter().next().unwrap())
            }
            "EXPIRE" => {
                arity("expire", args.len() == 2)?;
                Command::Expire {
                    seconds: parse_int(&args[1])?,
                    key: args.into_iter().next().unwrap(),
                }
            }
            "TTL" => {
                arity("ttl", args.len() == 1)?;
                Command::Ttl(args.into_iter().next().unwrap())
            }
            "PERSIST" => {
                arity("persist", args.len() == 1)?;
                Command::Persist(args.into_iter().next().unwrap())
            }
            "KEYS" => {
                arity("keys", args.len() == 1)?;
                Command::Keys(args.into_iter().next().unwrap())
            }
            "FLUSHDB" => {
                arity("flushdb", args.is_empty())?;
                Command::FlushDb
            }
            "INFO" => Command::Info,

            "SET" => {
                arity("set", args.len() == 2)?;
                let mut it = args.into_iter();
                Command::Set {
                    key: it.next().unwrap(),
                    value: it.next().unwrap(),
                }
            }
            "GET" => {
                arity("get", args.len() == 1)?;
                Command::Get(args.into_iter().next().unwrap())
            }
            "GETSET" => {
                arity("getset", args.len() == 2)?;
                let mut it = args.into_iter();
                Command::GetSet {
                    key: it.next().unwrap(),
                    value: it.next().unwrap(),
                }
            }
            "INCR" => {
                arity("incr", args.len() == 1)?;
                Command::Incr(args.into_iter().next().unwrap())
            }
            "INCRBY" => {
                arity("incrby", args.len() == 2)?;
                Command::IncrBy {
                    delta: parse_int(&args[1])?,
                    key: args.into_iter().next().unwrap(),
                }
            }
            "DECR" => {
                arity("decr", args.len() == 1)?;
                Command::Decr(args.into_iter().next().unwrap())
            }
            "DECRBY" => {
                arity("decrby", args.len() == 2)?;
                Command::DecrBy {
                    delta: parse_int(&args[1])?,
                    key: args.into_iter().next().unwrap(),
                }
            }

            "LPUSH" | "RPUSH" => {
                arity(&upper.to_lowercase(), args.len() >= 2)?;
                let mut it = args.into_iter();
                let key = it.next().unwrap();
                let values: Vec<String> = it.collect();
                if upper == "LPUSH" {
                    Command::LPush { key, values }
                } else {
                    Command::RPush { key, values }
                }
            }
            "LPOP" => {
                arity("lpop", args.len() == 1)?;
                Command::LPop(args.into_iter().next().unwrap())
            }
            "RPOP" => {
                arity("rpop", args.len() == 1)?;
                Command::RPop(args.into_iter().next().unwrap())
            }
            "LLEN" => {
                arity("llen", args.len() == 1)?;
                Command::LLen(args.into_iter().next().unwrap())
            }
            "LRANGE" => {
                arity("lrange", args.len() == 3)?;
                Command::LRange {
                    start: parse_int(&args[1])?,
                    stop: parse_int(&args[2])?,
                    key: args.into_iter().next().unwrap(),
                }
            }
            "LINDEX" => {
                arity("lindex", args.len() == 2)?;
                Command::LIndex {
                    index: parse_int(&args[1])?,
                    key: args.into_iter().next().unwrap(),
                }
            }
            "LSET" => {
                arity("lset", args.len() == 3)?;
                let index = parse_int(&args[1])?;
                let mut it = args.into_iter();
                let key = it.next().unwrap();
                it.next();
                Command::LSet {
                    key,
                    index,
                    value: it.next().unwrap(),
                }
            }
            "LREM" => {
                arity("lrem", args.len() == 3)?;
                let count = parse_int(&args[1])?;
                let mut it = args.into_iter();
                let key = it.next().unwrap();
                it.next();
                Command::LRem {
                    key,
                    count,
                    value: it.next().unwrap(),
                }
            }

            "SADD" | "SREM" => {
                arity(&upper.to_lowercase(), args.len() >= 2)?;
                let mut it = args.into_iter();
                let key = it.next().unwrap();
                let members: Vec<String> = it.collect();
                if upper == "SADD" {
                    Command::SAdd { key, members }
                } else {
                    Command::SRem { key, members }
                }
            }
            "SMEMBERS" => {
                arity("smembers", args.len() == 1)?;
                Command::SMembers(args.into_iter().next().unwrap())
            }
            "SISMEMBER" => {
                arity("sismember", args.len() == 2)?;
                let mut it = args.into_iter();
                Command::SIsMember {
                    key: it.next().unwrap(),
                    member: it.next().unwrap(),
                }
            }
            "SCARD" => {
                arity("scard", args.len() == 1)?;
                Command::SCard(args.into_iter().next().unwrap())
            }
            "SPOP" => {
                arity("spop", args.len() == 1 || args.len() == 2)?;
                let count = match args.get(1) {
                    Some(token) => {
                        let n = parse_int(token)?;
                        if n < 0 {
                            return Err(ProtocolError::NotAnInteger);
                        }
                        Some(n as usize)
                    }
                    None => None,
                };
                Command::SPop {
                    key: args.into_iter().next().unwrap(),
                    count,
                }
            }
            "SRANDMEMBER" => {
                arity("srandmember", args.len() == 1 || args.len() == 2)?;
                let count = match args.get(1) {
                    Some(token) => Some(parse_int(token)?),
                    None => None,
                };
                Command::SRandMember {
                    key: args.into_iter().next().unwrap(),
                    count,
                }
            }
            "SINTER" => {
                arity("sinter", !args.is_empty())?;
                Command::SInter(args)
            }
            "SUNION" => {
                arity("sunion", !args.is_empty())?;
                Command::SUnion(args)
            }
            "SDIFF" => {
                arity("sdiff", !args.is_empty())?;
                Command::SDiff(args)
            }

            "HSET" | "HMSET" => {
                // field/value pairs after the key
                arity(&upper.to_lowercase(), args.len() >= 3 && args.len() % 2 == 1)?;
                let mut it = args.into_iter();
                let key = it.next().unwrap();
                let rest: Vec<String> = it.collect();
                let pairs = rest
                    .chunks(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                Command::HSet { key, pairs }
            }
            "HGET" => {
                arity("hget", args.len() == 2)?;
                let mut it = args.into_iter();
                Command::HGet {
                    key: it.next().unwrap(),
                    field: it.next().unwrap(),
                }
            }
            "HDEL" => {
                arity("hdel", args.len() >= 2)?;
                let mut it = args.into_iter();
                let key = it.next().unwrap();
                Command::HDel {
                    key,
                    fields: it.collect(),
                }
            }
            "HEXISTS" => {
                arity("hexists", args.len() == 2)?;
                let mut it = args.into_iter();
                Command::HExists {
                    key: it.next().unwrap(),
                    field: it.next().unwrap(),
                }
            }
            "HGETALL" => {
                arity("hgetall", args.len() == 1)?;
                Command::HGetAll(args.into_iter().next().unwrap())
            }
            "HKEYS" => {
                arity("hkeys", args.len() == 1)?;
                Command::HKeys(args.into_iter().next().unwrap())
            }
            "HVALS" => {
                arity("hvals", args.len() == 1)?;
                Command::HVals(args.into_iter().next().unwrap())
            }
            "HLEN" => {
                arity("hlen", args.len() == 1)?;
                Command::HLen(args.into_iter().next().unwrap())
            }
            "HMGET" => {
                arity("hmget", args.len() >= 2)?;
                let mut it = args.into_iter();
                let key = it.next().unwrap();
                Command::HMGet {
                    key,
                    fields: it.collect(),
                }
            }
            "HSETNX" => {
                arity("hsetnx", args.len() == 3)?;
                let mut it = args.into_iter();
                Command::HSetNx {
                    key: it.next().unwrap(),
                    field: it.next().unwrap(),
                    value: it.next().unwrap(),
                }
            }
            "HINCRBY" => {
                arity("hincrby", args.len() == 3)?;
                let delta = parse_int(&args[2])?;
                let mut it = args.into_iter();
                Command::HIncrBy {
                    key: it.next().unwrap(),
                    field: it.next().unwrap(),
                    delta,
                }
            }

            "ZADD" => {
                arity("zadd", args.len() >= 3 && args.len() % 2 == 1)?;
                let mut it = args.into_iter();
                let key = it.next().unwrap();
                let rest: Vec<String> = it.collect();
                let mut members = Vec::with_capacity(rest.len() / 2);
                for pair in rest.chunks(2) {
                    members.push((parse_float(&pair[0])?, pair[1].clone()));
                }
                Command::ZAdd { key, members }
            }
            "ZCARD" => {
                arity("zcard", args.len() == 1)?;
                Command::ZCard(args.into_iter().next().unwrap())
            }
            "ZCOUNT" => {
                arity("zcount", args.len() == 3)?;
                Command::ZCount {
                    min: parse_float(&args[1])?,
                    max: parse_float(&args[2])?,
                    key: args.into_iter().next().unwrap(),
                }
            }
            "ZINCRBY" => {
                arity("zincrby", args.len() == 3)?;
                let delta = parse_float(&args[1])?;
                let mut it = args.into_iter();
                let key = it.next().unwrap();
                it.next();
                Command::ZIncrBy {
                    key,
                    delta,
                    member: it.next().unwrap(),
                }
            }
            "ZRANGE" | "ZREVRANGE" => {
                let lower = upper.to_lowercase();
                arity(&lower, args.len() == 3 || args.len() == 4)?;
                let with_scores = match args.get(3) {
                    Some(token) if token.eq_ignore_ascii_case("WITHSCORES") => true,
                    Some(_) => return Err(ProtocolError::Syntax),
                    None => false,
                };
                let start = parse_int(&args[1])?;
                let stop = parse_int(&args[2])?;
                let key = args.into_iter().next().unwrap();
                if upper == "ZRANGE" {
                    Command::ZRange {
                        key,
                        start,
                        stop,
                        with_scores,
                    }
                } else {
                    Command::ZRevRange {
                        key,
                        start,
                        stop,
                        with_scores,
                    }
                }
            }
            "ZRANK" => {
                arity("zrank", args.len() == 2)?;
                let mut it = args.into_iter();
                Command::ZRank {
                    key: it.next().unwrap(),
                    member: it.next().unwrap(),
                }
            }
            "ZREVRANK" => {
                arity("zrevrank", args.len() == 2)?;
                let mut it = args.into_iter();
                Command::ZRevRank {
                    key: it.next().unwrap(),
                    member: it.next().unwrap(),
                }
            }
            "ZREM" => {
                arity("zrem", args.len() >= 2)?;
                let mut it = args.into_iter();
                let key = it.next().unwrap();
                Command::ZRem {
                    key,
                    members: it.collect(),
                }
            }
            "ZSCORE" => {
                arity("zscore", args.len() == 2)?;
                let mut it = args.into_iter();
                Command::ZScore {
                    key: it.next().unwrap(),
                    member: it.next().unwrap(),
                }
            }

            "READONLY" => Command::ReadOnly,
            "ROLE" => Command::Role,
            "SLAVEOF" => {
                arity("slaveof", args.len() == 2)?;
                if args[0].eq_ignore_ascii_case("NO") && args[1].eq_ignore_ascii_case("ONE") {
                    Command::SlaveOf(None)
                } else {
                    let port: u16 = args[1]
                        .parse()
                        .map_err(|_| ProtocolError::NotAnInteger)?;
                    Command::SlaveOf(Some((args.into_iter().next().unwrap(), port)))
                }
            }

            _ => return Err(ProtocolError::UnknownCommand(name)),
        };
        Ok(cmd)
    }

    /// True for commands that mutate the keyspace. These are appended
    /// to the log and rejected on read-only replicas.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Del(_)
                | Command::Expire { .. }
                | Command::Persist(_)
                | Command::FlushDb
                | Command::Set { .. }
                | Command::GetSet { .. }
                | Command::Incr(_)
                | Command::IncrBy { .. }
                | Command::Decr(_)
                | Command::DecrBy { .. }
                | Command::LPush { .. }
                | Command::RPush { .. }
                | Command::LPop(_)
                | Command::RPop(_)
                | Command::LSet { .. }
                | Command::LRem { .. }
                | Command::SAdd { .. }
                | Command::SRem { .. }
                | Command::SPop { .. }
                | Command::HSet { .. }
                | Command::HDel { .. }
                | Command::HSetNx { .. }
                | Command::HIncrBy { .. }
                | Command::ZAdd { .. }
                | Command::ZRem { .. }
                | Command::ZIncrBy { .. }
        )
    }
}
