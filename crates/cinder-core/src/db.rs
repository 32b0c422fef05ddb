//! A database shard: one concurrent key → value-object mapping.
//!
//! Each server owns a fixed vector of shards; clients address one at a
//! time via SELECT. Shards are fully independent: no operation spans
//! two shards and no lock is shared between them. The map itself is a
//! `DashMap`, which gives linearizable per-key semantics under
//! concurrent callers without a shard-wide lock.
//!
//! Expiration is checked lazily on every read: an entry whose
//! expiration instant has passed is removed on sight, an `Expired`
//! event is published, and the caller observes an absent key. The
//! periodic reaper in [`crate::expiry`] is the backstop that reclaims
//! memory for keys nobody reads.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use bytes::Bytes;
use dashmap::DashMap;
use rand::seq::{IteratorRandom, SliceRandom};

use cinder_persistence::snapshot::{SnapEntry, SnapValue};

use crate::error::{IntegerError, ListSetError, WrongType};
use crate::events::{EventBus, KeyEvent, KeyEventKind, Subscriber};
use crate::time::{is_past, now_ms};
use crate::types::{normalize_range, SortedSet, Value};

/// A stored value object: payload plus bookkeeping instants.
#[derive(Debug, Clone)]
pub struct Object {
    pub value: Value,
    /// Wall-clock ms at creation.
    pub created_at: i64,
    /// Wall-clock ms of the last read.
    pub last_access: i64,
    /// Absolute expiration instant in wall-clock ms; `None` = never.
    pub expire_at: Option<i64>,
}

impl Object {
    pub fn new(value: Value) -> Self {
        let now = now_ms();
        Self {
            value,
            created_at: now,
            last_access: now,
            expire_at: None,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        is_past(self.expire_at, now)
    }
}

/// Result of a TTL query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlResult {
    /// Remaining lifetime in milliseconds.
    Remaining(i64),
    /// The key exists and never expires.
    NoExpiry,
    /// The key does not exist.
    Missing,
}

/// One shard of the keyspace.
#[derive(Debug)]
pub struct Db {
    index: usize,
    map: DashMap<String, Object>,
    events: EventBus,
}

impl Db {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            map: DashMap::new(),
            events: EventBus::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Registers a keyspace event subscriber on this shard.
    pub fn subscribe(&self, subscriber: Subscriber) {
        self.events.subscribe(subscriber);
    }

    fn publish(&self, key: &str, kind: KeyEventKind) {
        self.events.publish(&KeyEvent {
            shard: self.index,
            key: key.to_owned(),
            kind,
            at: now_ms(),
        });
    }

    /// Removes the key if its expiration has passed. Publishes an
    /// `Expired` event on removal. Returns true if the key was reaped.
    fn purge_if_expired(&self, key: &str) -> bool {
        let now = now_ms();
        let expired = match self.map.get(key) {
            Some(entry) => entry.is_expired(now),
            None => return false,
        };
        if !expired {
            return false;
        }
        // the guard is dropped; re-check under the entry lock so a
        // concurrent PERSIST does not lose its key
        if self.map.remove_if(key, |_, obj| obj.is_expired(now)).is_some() {
            self.publish(key, KeyEventKind::Expired);
            true
        } else {
            false
        }
    }

    /// Runs `f` against the live value for `key`, bumping last-access.
    /// `Ok(None)` means the key is absent (or just expired).
    fn read_value<T>(
        &self,
        key: &str,
        f: impl FnOnce(&Value) -> Result<T, WrongType>,
    ) -> Result<Option<T>, WrongType> {
        self.purge_if_expired(key);
        match self.map.get_mut(key) {
            Some(mut entry) => {
                entry.last_access = now_ms();
                f(&entry.value).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Runs `f` against the live value for `key`, mutating in place.
    /// Collections left empty by `f` are removed from the map.
    fn write_value<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Value) -> Result<T, WrongType>,
    ) -> Result<Option<T>, WrongType> {
        self.purge_if_expired(key);
        let (result, now_empty) = match self.map.get_mut(key) {
            Some(mut entry) => {
                let result = f(&mut entry.value)?;
                (result, entry.value.is_empty_collection())
            }
            None => return Ok(None),
        };
        if now_empty {
            self.map.remove(key);
        }
        self.publish(key, KeyEventKind::Updated);
        Ok(Some(result))
    }

    /// Like [`write_value`], but creates the entry with `default` when
    /// the key is absent. Publishes `Added` or `Updated` accordingly.
    fn upsert_value<T>(
        &self,
        key: &str,
        default: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Value) -> Result<T, WrongType>,
    ) -> Result<T, WrongType> {
        self.purge_if_expired(key);
        let (result, created, now_empty) = match self.map.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let obj = occupied.get_mut();
                let result = f(&mut obj.value)?;
                (result, false, obj.value.is_empty_collection())
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let mut obj = Object::new(default());
                let result = f(&mut obj.value)?;
                let empty = obj.value.is_empty_collection();
                if !empty {
                    vacant.insert(obj);
                }
                (result, true, false)
            }
        };
        if now_empty {
            self.map.remove(key);
        }
        self.publish(
            key,
            if created {
                KeyEventKind::Added
            } else {
                KeyEventKind::Updated
            },
        );
        Ok(result)
    }

    // -- keyspace operations ------------------------------------------------

    /// Stores a string value, replacing whatever was there.
    pub fn set(&self, key: &str, value: Bytes) {
        let existed = self.map.insert(key.to_owned(), Object::new(Value::Str(value)));
        self.publish(
            key,
            if existed.is_some() {
                KeyEventKind::Updated
            } else {
                KeyEventKind::Added
            },
        );
    }

    /// Reads a string value.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>, WrongType> {
        self.read_value(key, |value| match value {
            Value::Str(data) => Ok(data.clone()),
            _ => Err(WrongType),
        })
    }

    /// Stores a string and returns the previous string value.
    pub fn getset(&self, key: &str, value: Bytes) -> Result<Option<Bytes>, WrongType> {
        self.purge_if_expired(key);
        let previous = match self.map.get(key) {
            Some(entry) => match &entry.value {
                Value::Str(data) => Some(data.clone()),
                _ => return Err(WrongType),
            },
            None => None,
        };
        self.set(key, value);
        Ok(previous)
    }

    /// Removes a key. Returns the removed object, if any.
    pub fn delete(&self, key: &str) -> Option<Object> {
        self.purge_if_expired(key);
        let removed = self.map.remove(key).map(|(_, obj)| obj);
        if removed.is_some() {
            self.publish(key, KeyEventKind::Deleted);
        }
        removed
    }

    pub fn exists(&self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.map.contains_key(key)
    }

    /// A snapshot of the live keys.
    pub fn keys(&self) -> Vec<String> {
        let now = now_ms();
        self.map
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Count of live keys.
    pub fn size(&self) -> usize {
        let now = now_ms();
        self.map.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    /// Sets the key's expiration `ttl_ms` from now. Returns whether a
    /// key existed to expire.
    pub fn expire(&self, key: &str, ttl_ms: i64) -> bool {
        self.purge_if_expired(key);
        let set = match self.map.get_mut(key) {
            Some(mut entry) => {
                entry.expire_at = Some(now_ms() + ttl_ms);
                true
            }
            None => false,
        };
        if set {
            self.publish(key, KeyEventKind::ExpireSet);
        }
        set
    }

    /// Remaining lifetime of a key.
    pub fn ttl(&self, key: &str) -> TtlResult {
        self.purge_if_expired(key);
        match self.map.get(key) {
            Some(entry) => match entry.expire_at {
                Some(at) => TtlResult::Remaining((at - now_ms()).max(0)),
                None => TtlResult::NoExpiry,
            },
            None => TtlResult::Missing,
        }
    }

    /// Clears the key's expiration. Returns whether an expiration was
    /// actually removed.
    pub fn persist(&self, key: &str) -> bool {
        self.purge_if_expired(key);
        let cleared = match self.map.get_mut(key) {
            Some(mut entry) => entry.expire_at.take().is_some(),
            None => false,
        };
        if cleared {
            self.publish(key, KeyEventKind::Updated);
        }
        cleared
    }

    /// True if the key exists but its expiration instant has passed.
    /// Unlike the read path this does not reap the entry.
    pub fn is_expired(&self, key: &str) -> bool {
        let now = now_ms();
        self.map
            .get(key)
            .map(|entry| entry.is_expired(now))
            .unwrap_or(false)
    }

    /// The TYPE name of the key's value, if present.
    pub fn type_name(&self, key: &str) -> Option<&'static str> {
        self.purge_if_expired(key);
        self.map.get(key).map(|entry| entry.value.type_name())
    }

    // -- string operations --------------------------------------------------

    /// Adds `delta` to the integer stored at `key` (missing = 0).
    pub fn incr_by(&self, key: &str, delta: i64) -> Result<i64, IntegerError> {
        self.purge_if_expired(key);
        let result = match self.map.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let obj = occupied.get_mut();
                let Value::Str(data) = &obj.value else {
                    return Err(IntegerError::WrongType);
                };
                let current: i64 = std::str::from_utf8(data)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(IntegerError::NotAnInteger)?;
                let next = current.checked_add(delta).ok_or(IntegerError::Overflow)?;
                obj.value = Value::Str(Bytes::from(next.to_string()));
                (next, false)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Object::new(Value::Str(Bytes::from(delta.to_string()))));
                (delta, true)
            }
        };
        let (next, created) = result;
        self.publish(
            key,
            if created {
                KeyEventKind::Added
            } else {
                KeyEventKind::Updated
            },
        );
        Ok(next)
    }

    // -- list operations ----------------------------------------------------

    pub fn lpush(&self, key: &str, values: Vec<Bytes>) -> Result<usize, WrongType> {
        self.upsert_value(key, || Value::List(VecDeque::new()), |value| match value {
            Value::List(items) => {
                for v in values {
                    items.push_front(v);
                }
                Ok(items.len())
            }
            _ => Err(WrongType),
        })
    }

    pub fn rpush(&self, key: &str, values: Vec<Bytes>) -> Result<usize, WrongType> {
        self.upsert_value(key, || Value::List(VecDeque::new()), |value| match value {
            Value::List(items) => {
                for v in values {
                    items.push_back(v);
                }
                Ok(items.len())
            }
            _ => Err(WrongType),
        })
    }

    pub fn lpop(&self, key: &str) -> Result<Option<Bytes>, WrongType> {
        Ok(self
            .write_value(key, |value| match value {
                Value::List(items) => Ok(items.pop_front()),
                _ => Err(WrongType),
            })?
            .flatten())
    }

    pub fn rpop(&self, key: &str) -> Result<Option<Bytes>, WrongType> {
        Ok(self
            .write_value(key, |value| match value {
                Value::List(items) => Ok(items.pop_back()),
                _ => Err(WrongType),
            })?
            .flatten())
    }

    pub fn llen(&self, key: &str) -> Result<usize, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::List(items) => Ok(items.len()),
                _ => Err(WrongType),
            })?
            .unwrap_or(0))
    }

    pub fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::List(items) => match normalize_range(start, stop, items.len()) {
                    Some((s, e)) => Ok(items.iter().skip(s).take(e - s + 1).cloned().collect()),
                    None => Ok(Vec::new()),
                },
                _ => Err(WrongType),
            })?
            .unwrap_or_default())
    }

    pub fn lindex(&self, key: &str, index: i64) -> Result<Option<Bytes>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::List(items) => {
                    let len = items.len() as i64;
                    let i = if index < 0 { len + index } else { index };
                    if i < 0 || i >= len {
                        Ok(None)
                    } else {
                        Ok(items.get(i as usize).cloned())
                    }
                }
                _ => Err(WrongType),
            })?
            .flatten())
    }

    pub fn lset(&self, key: &str, index: i64, value: Bytes) -> Result<(), ListSetError> {
        let result = self.write_value(key, |v| match v {
            Value::List(items) => {
                let len = items.len() as i64;
                let i = if index < 0 { len + index } else { index };
                if i < 0 || i >= len {
                    Ok(false)
                } else {
                    items[i as usize] = value;
                    Ok(true)
                }
            }
            _ => Err(WrongType),
        })?;
        match result {
            None => Err(ListSetError::NoSuchKey),
            Some(false) => Err(ListSetError::IndexOutOfRange),
            Some(true) => Ok(()),
        }
    }

    /// Removes occurrences of `value`. `count > 0` removes from the
    /// head, `count < 0` from the tail, `0` removes all.
    pub fn lrem(&self, key: &str, count: i64, value: &[u8]) -> Result<usize, WrongType> {
        Ok(self
            .write_value(key, |v| match v {
                Value::List(items) => {
                    let limit = if count == 0 {
                        usize::MAX
                    } else {
                        count.unsigned_abs() as usize
                    };
                    let mut removed = 0usize;
                    if count >= 0 {
                        let mut kept = VecDeque::with_capacity(items.len());
                        for item in items.drain(..) {
                            if removed < limit && item.as_ref() == value {
                                removed += 1;
                            } else {
                                kept.push_back(item);
                            }
                        }
                        *items = kept;
                    } else {
                        let mut kept = VecDeque::with_capacity(items.len());
                        while let Some(item) = items.pop_back() {
                            if removed < limit && item.as_ref() == value {
                                removed += 1;
                            } else {
                                kept.push_front(item);
                            }
                        }
                        *items = kept;
                    }
                    Ok(removed)
                }
                _ => Err(WrongType),
            })?
            .unwrap_or(0))
    }

    // -- set operations -----------------------------------------------------

    pub fn sadd(&self, key: &str, members: Vec<String>) -> Result<usize, WrongType> {
        self.upsert_value(key, || Value::Set(HashSet::new()), |value| match value {
            Value::Set(set) => Ok(members.into_iter().filter(|m| set.insert(m.clone())).count()),
            _ => Err(WrongType),
        })
    }

    pub fn srem(&self, key: &str, members: &[String]) -> Result<usize, WrongType> {
        Ok(self
            .write_value(key, |value| match value {
                Value::Set(set) => Ok(members.iter().filter(|m| set.remove(*m)).count()),
                _ => Err(WrongType),
            })?
            .unwrap_or(0))
    }

    /// Members in lexicographic order.
    pub fn smembers(&self, key: &str) -> Result<Vec<String>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::Set(set) => {
                    let mut members: Vec<String> = set.iter().cloned().collect();
                    members.sort();
                    Ok(members)
                }
                _ => Err(WrongType),
            })?
            .unwrap_or_default())
    }

    pub fn sismember(&self, key: &str, member: &str) -> Result<bool, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::Set(set) => Ok(set.contains(member)),
                _ => Err(WrongType),
            })?
            .unwrap_or(false))
    }

    pub fn scard(&self, key: &str) -> Result<usize, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::Set(set) => Ok(set.len()),
                _ => Err(WrongType),
            })?
            .unwrap_or(0))
    }

    /// Removes and returns up to `count` random members.
    pub fn spop(&self, key: &str, count: usize) -> Result<Vec<String>, WrongType> {
        Ok(self
            .write_value(key, |value| match value {
                Value::Set(set) => {
                    let picked: Vec<String> = set
                        .iter()
                        .cloned()
                        .choose_multiple(&mut rand::thread_rng(), count);
                    for member in &picked {
                        set.remove(member);
                    }
                    Ok(picked)
                }
                _ => Err(WrongType),
            })?
            .unwrap_or_default())
    }

    /// Random members without removing them. Positive `count` samples
    /// distinct members (reservoir); negative samples with replacement.
    pub fn srandmember(&self, key: &str, count: i64) -> Result<Vec<String>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::Set(set) => {
                    let mut rng = rand::thread_rng();
                    if count >= 0 {
                        Ok(set
                            .iter()
                            .cloned()
                            .choose_multiple(&mut rng, count as usize))
                    } else {
                        let pool: Vec<&String> = set.iter().collect();
                        let n = count.unsigned_abs() as usize;
                        Ok((0..n)
                            .filter_map(|_| pool.choose(&mut rng).map(|m| (*m).clone()))
                            .collect())
                    }
                }
                _ => Err(WrongType),
            })?
            .unwrap_or_default())
    }

    fn set_members(&self, key: &str) -> Result<HashSet<String>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::Set(set) => Ok(set.clone()),
                _ => Err(WrongType),
            })?
            .unwrap_or_default())
    }

    /// Intersection of the named sets, lexicographic order. A missing
    /// key is the empty set.
    pub fn sinter(&self, keys: &[&str]) -> Result<Vec<String>, WrongType> {
        let mut iter = keys.iter();
        let Some(first) = iter.next() else {
            return Ok(Vec::new());
        };
        let mut acc: BTreeSet<String> = self.set_members(first)?.into_iter().collect();
        for key in iter {
            if acc.is_empty() {
                break;
            }
            let other = self.set_members(key)?;
            acc.retain(|m| other.contains(m));
        }
        Ok(acc.into_iter().collect())
    }

    /// Union of the named sets, lexicographic order.
    pub fn sunion(&self, keys: &[&str]) -> Result<Vec<String>, WrongType> {
        let mut acc = BTreeSet::new();
        for key in keys {
            acc.extend(self.set_members(key)?);
        }
        Ok(acc.into_iter().collect())
    }

    /// Members of the first set absent from all the rest, lexicographic.
    pub fn sdiff(&self, keys: &[&str]) -> Result<Vec<String>, WrongType> {
        let mut iter = keys.iter();
        let Some(first) = iter.next() else {
            return Ok(Vec::new());
        };
        let mut acc: BTreeSet<String> = self.set_members(first)?.into_iter().collect();
        for key in iter {
            if acc.is_empty() {
                break;
            }
            let other = self.set_members(key)?;
            acc.retain(|m| !other.contains(m));
        }
        Ok(acc.into_iter().collect())
    }

    // -- hash operations ----------------------------------------------------

    /// Sets fields, returning the count of newly created fields.
    pub fn hset(&self, key: &str, pairs: Vec<(String, Bytes)>) -> Result<usize, WrongType> {
        self.upsert_value(key, || Value::Hash(HashMap::new()), |value| match value {
            Value::Hash(fields) => Ok(pairs
                .into_iter()
                .filter(|(field, val)| fields.insert(field.clone(), val.clone()).is_none())
                .count()),
            _ => Err(WrongType),
        })
    }

    /// Sets a field only if absent. Returns whether it was set.
    pub fn hsetnx(&self, key: &str, field: String, value: Bytes) -> Result<bool, WrongType> {
        self.upsert_value(key, || Value::Hash(HashMap::new()), |v| match v {
            Value::Hash(fields) => {
                if fields.contains_key(&field) {
                    Ok(false)
                } else {
                    fields.insert(field, value);
                    Ok(true)
                }
            }
            _ => Err(WrongType),
        })
    }

    pub fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::Hash(fields) => Ok(fields.get(field).cloned()),
                _ => Err(WrongType),
            })?
            .flatten())
    }

    pub fn hdel(&self, key: &str, fields: &[String]) -> Result<usize, WrongType> {
        Ok(self
            .write_value(key, |value| match value {
                Value::Hash(map) => Ok(fields.iter().filter(|f| map.remove(*f).is_some()).count()),
                _ => Err(WrongType),
            })?
            .unwrap_or(0))
    }

    pub fn hexists(&self, key: &str, field: &str) -> Result<bool, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::Hash(fields) => Ok(fields.contains_key(field)),
                _ => Err(WrongType),
            })?
            .unwrap_or(false))
    }

    /// Field/value pairs sorted by field name for stable output.
    pub fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::Hash(fields) => {
                    let mut pairs: Vec<(String, Bytes)> = fields
                        .iter()
                        .map(|(f, v)| (f.clone(), v.clone()))
                        .collect();
                    pairs.sort_by(|a, b| a.0.cmp(&b.0));
                    Ok(pairs)
                }
                _ => Err(WrongType),
            })?
            .unwrap_or_default())
    }

    pub fn hkeys(&self, key: &str) -> Result<Vec<String>, WrongType> {
        Ok(self.hgetall(key)?.into_iter().map(|(f, _)| f).collect())
    }

    pub fn hvals(&self, key: &str) -> Result<Vec<Bytes>, WrongType> {
        Ok(self.hgetall(key)?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn hlen(&self, key: &str) -> Result<usize, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::Hash(fields) => Ok(fields.len()),
                _ => Err(WrongType),
            })?
            .unwrap_or(0))
    }

    pub fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Bytes>>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::Hash(map) => Ok(fields.iter().map(|f| map.get(f).cloned()).collect()),
                _ => Err(WrongType),
            })?
            .unwrap_or_else(|| fields.iter().map(|_| None).collect()))
    }

    pub fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, IntegerError> {
        self.purge_if_expired(key);
        let (next, created) = match self.map.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let obj = occupied.get_mut();
                let Value::Hash(fields) = &mut obj.value else {
                    return Err(IntegerError::WrongType);
                };
                let current: i64 = match fields.get(field) {
                    Some(data) => std::str::from_utf8(data)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or(IntegerError::NotAnInteger)?,
                    None => 0,
                };
                let next = current.checked_add(delta).ok_or(IntegerError::Overflow)?;
                fields.insert(field.to_owned(), Bytes::from(next.to_string()));
                (next, false)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let mut fields = HashMap::new();
                fields.insert(field.to_owned(), Bytes::from(delta.to_string()));
                vacant.insert(Object::new(Value::Hash(fields)));
                (delta, true)
            }
        };
        self.publish(
            key,
            if created {
                KeyEventKind::Added
            } else {
                KeyEventKind::Updated
            },
        );
        Ok(next)
    }

    // -- sorted set operations ----------------------------------------------

    /// Adds members, returning the count of newly added ones.
    pub fn zadd(&self, key: &str, members: Vec<(f64, String)>) -> Result<usize, WrongType> {
        self.upsert_value(key, || Value::ZSet(SortedSet::new()), |value| match value {
            Value::ZSet(zset) => Ok(members
                .into_iter()
                .filter(|(score, member)| zset.add(member.clone(), *score))
                .count()),
            _ => Err(WrongType),
        })
    }

    pub fn zrem(&self, key: &str, members: &[String]) -> Result<usize, WrongType> {
        Ok(self
            .write_value(key, |value| match value {
                Value::ZSet(zset) => Ok(members.iter().filter(|m| zset.remove(m)).count()),
                _ => Err(WrongType),
            })?
            .unwrap_or(0))
    }

    pub fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::ZSet(zset) => Ok(zset.score(member)),
                _ => Err(WrongType),
            })?
            .flatten())
    }

    pub fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::ZSet(zset) => Ok(zset.rank(member)),
                _ => Err(WrongType),
            })?
            .flatten())
    }

    pub fn zrevrank(&self, key: &str, member: &str) -> Result<Option<usize>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::ZSet(zset) => Ok(zset.rev_rank(member)),
                _ => Err(WrongType),
            })?
            .flatten())
    }

    pub fn zcard(&self, key: &str) -> Result<usize, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::ZSet(zset) => Ok(zset.len()),
                _ => Err(WrongType),
            })?
            .unwrap_or(0))
    }

    pub fn zcount(&self, key: &str, min: f64, max: f64) -> Result<usize, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::ZSet(zset) => Ok(zset.count_in_score_range(min, max)),
                _ => Err(WrongType),
            })?
            .unwrap_or(0))
    }

    pub fn zincrby(&self, key: &str, delta: f64, member: &str) -> Result<f64, WrongType> {
        self.upsert_value(key, || Value::ZSet(SortedSet::new()), |value| match value {
            Value::ZSet(zset) => Ok(zset.incr(member, delta)),
            _ => Err(WrongType),
        })
    }

    pub fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<(String, f64)>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::ZSet(zset) => Ok(zset.range_by_rank(start, stop)),
                _ => Err(WrongType),
            })?
            .unwrap_or_default())
    }

    pub fn zrevrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, WrongType> {
        Ok(self
            .read_value(key, |value| match value {
                Value::ZSet(zset) => Ok(zset.rev_range_by_rank(start, stop)),
                _ => Err(WrongType),
            })?
            .unwrap_or_default())
    }

    // -- expiration sweep support -------------------------------------------

    /// Keys whose expiration instant is at or before `now`.
    pub fn expired_keys(&self, now: i64) -> Vec<String> {
        self.map
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Removes `key` if it is still expired at `now`; publishes the
    /// `Expired` event. Tolerates the entry having vanished or been
    /// refreshed since it was observed.
    pub fn reap(&self, key: &str, now: i64) -> bool {
        if self.map.remove_if(key, |_, obj| obj.is_expired(now)).is_some() {
            self.publish(key, KeyEventKind::Expired);
            true
        } else {
            false
        }
    }

    // -- snapshot / replication support --------------------------------------

    /// Serializable image of the live entries. Event subscribers and
    /// other lifecycle state are deliberately not part of the image.
    pub fn snapshot_entries(&self) -> Vec<SnapEntry> {
        let now = now_ms();
        self.map
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| SnapEntry {
                key: entry.key().clone(),
                value: value_to_snap(&entry.value),
                expire_at: entry.expire_at.unwrap_or(-1),
            })
            .collect()
    }

    /// Replaces this shard's contents with a deserialized image. The
    /// shard object itself, and with it the event subscriber list,
    /// stays in place; only the data is swapped.
    pub fn replace_entries(&self, entries: Vec<SnapEntry>) {
        let now = now_ms();
        self.map.clear();
        for entry in entries {
            let expire_at = (entry.expire_at >= 0).then_some(entry.expire_at);
            if is_past(expire_at, now) {
                continue;
            }
            let mut obj = Object::new(snap_to_value(entry.value));
            obj.expire_at = expire_at;
            self.map.insert(entry.key, obj);
        }
    }
}

/// Converts a live value into its snapshot form.
pub fn value_to_snap(value: &Value) -> SnapValue {
    match value {
        Value::Str(data) => SnapValue::Str(data.clone()),
        Value::List(items) => SnapValue::List(items.clone()),
        Value::Set(members) => {
            let mut sorted: Vec<String> = members.iter().cloned().collect();
            sorted.sort();
            SnapValue::Set(sorted)
        }
        Value::Hash(fields) => {
            SnapValue::Hash(fields.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
        }
        Value::ZSet(zset) => {
            SnapValue::ZSet(zset.iter().map(|(m, s)| (s, m.to_owned())).collect())
        }
    }
}

/// Rebuilds a live value from its snapshot form.
pub fn snap_to_value(snap: SnapValue) -> Value {
    match snap {
        SnapValue::Str(data) => Value::Str(data),
        SnapValue::List(items) => Value::List(items),
        SnapValue::Set(members) => Value::Set(members.into_iter().collect()),
        SnapValue::Hash(fields) => Value::Hash(fields.into_iter().collect()),
        SnapValue::ZSet(members) => {
            let mut zset = SortedSet::new();
            for (score, member) in members {
                zset.add(member, score);
            }
            Value::ZSet(zset)
        }
    }
}
