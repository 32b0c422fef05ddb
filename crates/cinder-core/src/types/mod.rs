//! Typed value payloads.

pub mod sorted_set;

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

pub use sorted_set::SortedSet;

/// The payload of a value object: one of the five supported shapes.
#[derive(Debug, Clone)]
pub enum Value {
    /// An opaque byte string.
    Str(Bytes),
    /// An ordered sequence, head first.
    List(VecDeque<Bytes>),
    /// An unordered set of members.
    Set(HashSet<String>),
    /// Field → value mapping.
    Hash(HashMap<String, Bytes>),
    /// Score-ordered members with a member → score inverse index.
    ZSet(SortedSet),
}

impl Value {
    /// The TYPE command's name for this variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
            Value::ZSet(_) => "zset",
        }
    }

    /// True for collection variants that should be dropped when their
    /// last element is removed.
    pub fn is_empty_collection(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::List(items) => items.is_empty(),
            Value::Set(members) => members.is_empty(),
            Value::Hash(fields) => fields.is_empty(),
            Value::ZSet(zset) => zset.is_empty(),
        }
    }
}

/// Clamps a possibly-negative inclusive range onto `[0, len)`.
///
/// Negative indices count from the end (-1 = last element). Returns
/// `None` when the normalized range is empty.
pub fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let mut s = if start < 0 { len + start } else { start };
    let mut e = if stop < 0 { len + stop } else { stop };
    if s < 0 {
        s = 0;
    }
    if e >= len {
        e = len - 1;
    }
    if s > e || s >= len || e < 0 {
        return None;
    }
    Some((s as usize, e as usize))
}
