//! Full-keyspace snapshot files.
//!
//! A snapshot holds every shard of the keyspace in one file. Layout:
//!
//! ```text
//! [REDIS0001: 9B plaintext]
//! [body, optionally gzip-compressed:]
//!   [shard_count: i32]
//!   for each shard:
//!     [shard_index: i32][entry_count: i32]
//!     [entry]*
//!   [trailer: 0xFF]
//! ```
//!
//! Each entry is framed as `[entry_len: u32][entry bytes]` so that one
//! malformed entry can be skipped without desynchronizing the stream.
//! Entry bytes: `[key: len-prefixed][tag: 1B][payload][expire_at: i64]`
//! where `expire_at` is an absolute wall-clock millisecond instant, or
//! -1 for no expiration.
//!
//! The header is never compressed: the loader decides whether a file is
//! a snapshot at all by checking the `REDIS` prefix on the raw bytes,
//! and quarantines anything else. The body is read compression-first,
//! then plain, so a node recovers files written under either setting.
//!
//! Writes go to `<path>.tmp` and are renamed over the target on
//! completion; a crashed save never corrupts the previous snapshot.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{info, warn};

use crate::format::{self, FormatError};

/// Hard upper bound on the shard count field. Anything beyond this is
/// treated as corruption rather than an oversized deployment.
const MAX_SHARD_COUNT: i32 = 100;

/// The value stored in a snapshot entry.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapValue {
    /// A byte-string value.
    Str(Bytes),
    /// An ordered list, head first.
    List(VecDeque<Bytes>),
    /// Unordered set members.
    Set(Vec<String>),
    /// Hash fields and their values.
    Hash(Vec<(String, Bytes)>),
    /// Sorted-set members as (score, member) pairs.
    ZSet(Vec<(f64, String)>),
}

/// A single key in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapEntry {
    pub key: String,
    pub value: SnapValue,
    /// Absolute expiration instant in wall-clock ms, or -1 for none.
    pub expire_at: i64,
}

/// Outcome of [`load`].
#[derive(Debug)]
pub enum LoadOutcome {
    /// Shards read from an existing snapshot, as (shard_index, entries).
    Loaded(Vec<(usize, Vec<SnapEntry>)>),
    /// No usable snapshot existed; an empty one was written in its place.
    Initialized,
}

// ---------------------------------------------------------------------------
// entry codec (shared with the replication payload)
// ---------------------------------------------------------------------------

/// Serializes one entry, including its length frame, into `buf`.
pub fn write_entry(buf: &mut impl Write, entry: &SnapEntry) -> Result<(), FormatError> {
    let mut inner = Vec::new();
    format::write_bytes(&mut inner, entry.key.as_bytes())?;
    match &entry.value {
        SnapValue::Str(data) => {
            format::write_u8(&mut inner, format::TAG_STRING)?;
            format::write_bytes(&mut inner, data)?;
        }
        SnapValue::List(items) => {
            format::write_u8(&mut inner, format::TAG_LIST)?;
            format::write_u32(&mut inner, items.len() as u32)?;
            for item in items {
                format::write_bytes(&mut inner, item)?;
            }
        }
        SnapValue::Set(members) => {
            format::write_u8(&mut inner, format::TAG_SET)?;
            format::write_u32(&mut inner, members.len() as u32)?;
            for member in members {
                format::write_bytes(&mut inner, member.as_bytes())?;
            }
        }
        SnapValue::Hash(fields) => {
            format::write_u8(&mut inner, format::TAG_HASH)?;
            format::write_u32(&mut inner, fields.len() as u32)?;
            for (field, value) in fields {
                format::write_bytes(&mut inner, field.as_bytes())?;
                format::write_bytes(&mut inner, value)?;
            }
        }
        SnapValue::ZSet(members) => {
            format::write_u8(&mut inner, format::TAG_ZSET)?;
            format::write_u32(&mut inner, members.len() as u32)?;
            for (score, member) in members {
                format::write_f64(&mut inner, *score)?;
                format::write_bytes(&mut inner, member.as_bytes())?;
            }
        }
    }
    format::write_i64(&mut inner, entry.expire_at)?;

    format::write_bytes(buf, &inner)?;
    Ok(())
}

/// Result of reading one framed entry.
#[derive(Debug)]
pub enum EntryRead {
    Entry(SnapEntry),
    /// The frame was read but its payload did not parse. The stream
    /// position is past the frame, so the caller may keep reading.
    Skipped,
}

/// Reads one framed entry. Frame-level failures (truncation, oversized
/// length) are fatal; payload-level failures yield [`EntryRead::Skipped`].
pub fn read_entry(r: &mut impl Read) -> Result<EntryRead, FormatError> {
    let frame = format::read_bytes(r)?;
    match parse_entry(&frame) {
        Ok(entry) => Ok(EntryRead::Entry(entry)),
        Err(e) => {
            warn!("skipping malformed snapshot entry: {e}");
            Ok(EntryRead::Skipped)
        }
    }
}

fn parse_entry(frame: &[u8]) -> Result<SnapEntry, FormatError> {
    let mut cursor = Cursor::new(frame);
    let key = format::read_string(&mut cursor, "key")?;
    let tag = format::read_u8(&mut cursor)?;
    let value = match tag {
        format::TAG_STRING => SnapValue::Str(Bytes::from(format::read_bytes(&mut cursor)?)),
        format::TAG_LIST => {
            let count = format::read_u32(&mut cursor)?;
            format::validate_count(count, "list")?;
            let mut items = VecDeque::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                items.push_back(Bytes::from(format::read_bytes(&mut cursor)?));
            }
            SnapValue::List(items)
        }
        format::TAG_SET => {
            let count = format::read_u32(&mut cursor)?;
            format::validate_count(count, "set")?;
            let mut members = Vec::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                members.push(format::read_string(&mut cursor, "set member")?);
            }
            SnapValue::Set(members)
        }
        format::TAG_HASH => {
            let count = format::read_u32(&mut cursor)?;
            format::validate_count(count, "hash")?;
            let mut fields = Vec::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                let field = format::read_string(&mut cursor, "hash field")?;
                let value = Bytes::from(format::read_bytes(&mut cursor)?);
                fields.push((field, value));
            }
            SnapValue::Hash(fields)
        }
        format::TAG_ZSET => {
            let count = format::read_u32(&mut cursor)?;
            format::validate_count(count, "zset")?;
            let mut members = Vec::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                let score = format::read_f64(&mut cursor)?;
                let member = format::read_string(&mut cursor, "zset member")?;
                members.push((score, member));
            }
            SnapValue::ZSet(members)
        }
        other => return Err(FormatError::UnknownTag(other)),
    };
    let expire_at = format::read_i64(&mut cursor)?;
    Ok(SnapEntry {
        key,
        value,
        expire_at,
    })
}

// ---------------------------------------------------------------------------
// replication payload
// ---------------------------------------------------------------------------

/// Serializes the full shard vector for a replication response:
/// `[shard_count: i32]` then per shard `[entry_count: u32][entry]*`,
/// back to back. Only data travels; no event subscribers, no timers.
pub fn serialize_shards(shards: &[Vec<SnapEntry>]) -> Result<Vec<u8>, FormatError> {
    let mut buf = Vec::new();
    format::write_i32(&mut buf, shards.len() as i32)?;
    for entries in shards {
        format::write_u32(&mut buf, entries.len() as u32)?;
        for entry in entries {
            write_entry(&mut buf, entry)?;
        }
    }
    Ok(buf)
}

/// Decodes a replication payload back into per-shard entry lists.
pub fn deserialize_shards(data: &[u8]) -> Result<Vec<Vec<SnapEntry>>, FormatError> {
    let mut cursor = Cursor::new(data);
    let count = format::read_i32(&mut cursor)?;
    if !(0..=MAX_SHARD_COUNT).contains(&count) {
        return Err(FormatError::ShardCountOutOfRange(count));
    }
    let mut shards = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let entry_count = format::read_u32(&mut cursor)?;
        format::validate_count(entry_count, "shard entry")?;
        let mut entries = Vec::with_capacity(format::capped_capacity(entry_count));
        for _ in 0..entry_count {
            if let EntryRead::Entry(entry) = read_entry(&mut cursor)? {
                entries.push(entry);
            }
        }
        shards.push(entries);
    }
    Ok(shards)
}

// ---------------------------------------------------------------------------
// file save / load
// ---------------------------------------------------------------------------

fn write_body(w: &mut impl Write, shards: &[Vec<SnapEntry>]) -> Result<(), FormatError> {
    format::write_i32(w, shards.len() as i32)?;
    for (index, entries) in shards.iter().enumerate() {
        format::write_i32(w, index as i32)?;
        format::write_i32(w, entries.len() as i32)?;
        for entry in entries {
            write_entry(w, entry)?;
        }
    }
    format::write_u8(w, format::SNAP_TRAILER)?;
    Ok(())
}

fn read_body(r: &mut impl Read) -> Result<Vec<(usize, Vec<SnapEntry>)>, FormatError> {
    let shard_count = format::read_i32(r)?;
    if !(0..=MAX_SHARD_COUNT).contains(&shard_count) {
        return Err(FormatError::ShardCountOutOfRange(shard_count));
    }

    let mut shards = Vec::with_capacity(shard_count as usize);
    for _ in 0..shard_count {
        let index = format::read_i32(r)?;
        if index < 0 || index >= shard_count {
            warn!(index, "snapshot shard index out of range, skipping record");
            continue;
        }
        let entry_count = format::read_i32(r)?;
        if entry_count < 0 {
            warn!(index, entry_count, "negative entry count, skipping shard");
            continue;
        }
        format::validate_count(entry_count as u32, "shard entry")?;

        let mut entries = Vec::with_capacity(format::capped_capacity(entry_count as u32));
        for _ in 0..entry_count {
            if let EntryRead::Entry(entry) = read_entry(r)? {
                entries.push(entry);
            }
        }
        shards.push((index as usize, entries));
    }

    if format::read_u8(r)? != format::SNAP_TRAILER {
        return Err(FormatError::MissingTrailer);
    }
    Ok(shards)
}

/// Writes a complete snapshot with atomic replacement.
///
/// The whole file goes to `<path>.tmp` first. The rename-over-target is
/// retried once after deleting the target, matching platforms where
/// rename does not overwrite.
pub fn save(path: &Path, shards: &[Vec<SnapEntry>], compression: bool) -> Result<(), FormatError> {
    let tmp_path = tmp_path_for(path);
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(format::SNAP_MAGIC)?;

        if compression {
            let mut encoder = GzEncoder::new(&mut writer, Compression::default());
            write_body(&mut encoder, shards)?;
            encoder.finish()?;
        } else {
            write_body(&mut writer, shards)?;
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    replace_file(&tmp_path, path)
}

/// Loads a snapshot per the startup contract.
///
/// Missing or empty files, and files without the `REDIS` prefix, never
/// fail startup: the former get an empty snapshot written in place, the
/// latter are quarantined to `<path>.bak.<millis>` first. An existing
/// snapshot is read with the compressed body first, then plain, so a
/// file written under either compression setting loads.
pub fn load(
    path: &Path,
    shard_count: usize,
    compression: bool,
) -> Result<LoadOutcome, FormatError> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no snapshot found, initializing empty file");
            save_empty(path, shard_count, compression)?;
            return Ok(LoadOutcome::Initialized);
        }
        Err(e) => return Err(e.into()),
    };
    if len == 0 {
        info!(path = %path.display(), "empty snapshot file, reinitializing");
        save_empty(path, shard_count, compression)?;
        return Ok(LoadOutcome::Initialized);
    }

    if !has_magic_prefix(path)? {
        let backup = quarantine_path(path);
        warn!(
            path = %path.display(),
            backup = %backup.display(),
            "snapshot header invalid, quarantining file"
        );
        if let Err(e) = fs::rename(path, &backup) {
            warn!("failed to quarantine corrupt snapshot: {e}");
        }
        save_empty(path, shard_count, compression)?;
        return Ok(LoadOutcome::Initialized);
    }

    // compression settings can change between runs; try both readings.
    match load_with(path, true) {
        Ok(shards) => Ok(LoadOutcome::Loaded(shards)),
        Err(first_err) => {
            warn!("compressed snapshot read failed ({first_err}), retrying without compression");
            let shards = load_with(path, false)?;
            Ok(LoadOutcome::Loaded(shards))
        }
    }
}

fn save_empty(path: &Path, shard_count: usize, compression: bool) -> Result<(), FormatError> {
    let empty: Vec<Vec<SnapEntry>> = vec![Vec::new(); shard_count];
    save(path, &empty, compression)
}

fn load_with(path: &Path, compressed: bool) -> Result<Vec<(usize, Vec<SnapEntry>)>, FormatError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; 9];
    reader.read_exact(&mut header).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::UnexpectedEof
        } else {
            FormatError::Io(e)
        }
    })?;
    if !header.starts_with(b"REDIS") {
        return Err(FormatError::InvalidHeader);
    }

    if compressed {
        let mut decoder = GzDecoder::new(reader);
        read_body(&mut decoder)
    } else {
        read_body(&mut reader)
    }
}

fn has_magic_prefix(path: &Path) -> Result<bool, FormatError> {
    let mut file = File::open(path)?;
    let mut prefix = [0u8; 5];
    match file.read_exact(&mut prefix) {
        Ok(()) => Ok(&prefix == b"REDIS"),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".bak.{millis}"));
    PathBuf::from(name)
}

/// Returns the temp-file path used for atomic replacement of `path`.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Renames `tmp` over `target`. If the rename fails while the target
/// exists, the target is deleted and the rename retried once.
pub fn replace_file(tmp: &Path, target: &Path) -> Result<(), FormatError> {
    match fs::rename(tmp, target) {
        Ok(()) => Ok(()),
        Err(first) => {
            if target.exists() {
                let _ = fs::remove_file(target);
                fs::rename(tmp, target).map_err(|source| FormatError::Replace {
                    path: target.display().to_string(),
                    source,
                })
            } else {
                Err(FormatError::Replace {
                    path: target.display().to_string(),
                    source: first,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_shards() -> Vec<Vec<SnapEntry>> {
        let mut list = VecDeque::new();
        list.push_back(Bytes::from("c"));
        list.push_back(Bytes::from("b"));
        list.push_back(Bytes::from("a"));

        vec![
            vec![
                SnapEntry {
                    key: "greeting".into(),
                    value: SnapValue::Str(Bytes::from("hello")),
                    expire_at: -1,
                },
                SnapEntry {
                    key: "nums".into(),
                    value: SnapValue::List(list),
                    expire_at: -1,
                },
                SnapEntry {
                    key: "board".into(),
                    value: SnapValue::ZSet(vec![
                        (1.0, "a".into()),
                        (2.0, "b".into()),
                        (2.0, "c".into()),
                    ]),
                    expire_at: -1,
                },
            ],
            vec![SnapEntry {
                key: "session".into(),
                value: SnapValue::Hash(vec![("user".into(), Bytes::from("alice"))]),
                expire_at: 4_102_444_800_000,
            }],
        ]
    }

    fn load_entries(path: &Path, shard_count: usize) -> Vec<(usize, Vec<SnapEntry>)> {
        match load(path, shard_count, true).unwrap() {
            LoadOutcome::Loaded(shards) => shards,
            LoadOutcome::Initialized => panic!("expected loaded snapshot"),
        }
    }

    #[test]
    fn round_trip_plain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        let shards = sample_shards();

        save(&path, &shards, false).unwrap();
        let loaded = load_entries(&path, 2);

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0, 0);
        assert_eq!(loaded[0].1, shards[0]);
        assert_eq!(loaded[1].1, shards[1]);
    }

    #[test]
    fn round_trip_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        let shards = sample_shards();

        save(&path, &shards, true).unwrap();
        let loaded = load_entries(&path, 2);
        assert_eq!(loaded[0].1, shards[0]);
    }

    #[test]
    fn plain_file_loads_when_compression_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        let shards = sample_shards();

        // written without compression, loaded by a node configured with it
        save(&path, &shards, false).unwrap();
        let loaded = load_entries(&path, 2);
        assert_eq!(loaded[0].1, shards[0]);
    }

    #[test]
    fn header_is_plaintext_even_when_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        save(&path, &sample_shards(), true).unwrap();

        let data = fs::read(&path).unwrap();
        assert!(data.starts_with(b"REDIS0001"));
    }

    #[test]
    fn missing_file_initializes_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");

        let outcome = load(&path, 4, true).unwrap();
        assert!(matches!(outcome, LoadOutcome::Initialized));
        assert!(path.exists());

        // the initialized file is itself loadable
        let loaded = load_entries(&path, 4);
        assert_eq!(loaded.len(), 4);
        assert!(loaded.iter().all(|(_, entries)| entries.is_empty()));
    }

    #[test]
    fn zero_length_file_initializes_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        fs::write(&path, b"").unwrap();

        let outcome = load(&path, 2, false).unwrap();
        assert!(matches!(outcome, LoadOutcome::Initialized));
        assert!(fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn corrupt_header_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        fs::write(&path, b"definitely not a snapshot").unwrap();

        let outcome = load(&path, 2, true).unwrap();
        assert!(matches!(outcome, LoadOutcome::Initialized));

        // the corrupt original was moved aside, a fresh file took its place
        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".bak."))
            .collect();
        assert_eq!(backups.len(), 1);
        assert!(has_magic_prefix(&path).unwrap());
    }

    #[test]
    fn save_replaces_existing_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");

        save(&path, &sample_shards(), false).unwrap();
        let first = fs::read(&path).unwrap();

        save(&path, &vec![Vec::new(), Vec::new()], false).unwrap();
        let second = fs::read(&path).unwrap();

        assert_ne!(first, second);
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn expire_instant_survives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        let shards = vec![vec![SnapEntry {
            key: "k".into(),
            value: SnapValue::Str(Bytes::from("v")),
            expire_at: 1_900_000_000_000,
        }]];

        save(&path, &shards, false).unwrap();
        let loaded = load_entries(&path, 1);
        assert_eq!(loaded[0].1[0].expire_at, 1_900_000_000_000);
    }

    #[test]
    fn malformed_entry_is_skipped_not_fatal() {
        // hand-build a body with one good entry and one framed garbage entry
        let mut body = Vec::new();
        format::write_i32(&mut body, 1).unwrap();
        format::write_i32(&mut body, 0).unwrap();
        format::write_i32(&mut body, 2).unwrap();
        write_entry(
            &mut body,
            &SnapEntry {
                key: "good".into(),
                value: SnapValue::Str(Bytes::from("v")),
                expire_at: -1,
            },
        )
        .unwrap();
        format::write_bytes(&mut body, &[0xAB, 0xCD, 0xEF]).unwrap(); // framed garbage
        format::write_u8(&mut body, format::SNAP_TRAILER).unwrap();

        let shards = read_body(&mut Cursor::new(&body)).unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].1.len(), 1);
        assert_eq!(shards[0].1[0].key, "good");
    }

    #[test]
    fn shard_count_out_of_bounds_rejected() {
        let mut body = Vec::new();
        format::write_i32(&mut body, 101).unwrap();
        let err = read_body(&mut Cursor::new(&body)).unwrap_err();
        assert!(matches!(err, FormatError::ShardCountOutOfRange(101)));
    }

    #[test]
    fn replication_payload_round_trip() {
        let shards = sample_shards();
        let payload = serialize_shards(&shards).unwrap();
        let decoded = deserialize_shards(&payload).unwrap();
        assert_eq!(decoded, shards);
    }

    #[test]
    fn replication_payload_empty_shards() {
        let shards: Vec<Vec<SnapEntry>> = vec![Vec::new(); 16];
        let payload = serialize_shards(&shards).unwrap();
        let decoded = deserialize_shards(&payload).unwrap();
        assert_eq!(decoded.len(), 16);
        assert!(decoded.iter().all(Vec::is_empty));
    }
}
