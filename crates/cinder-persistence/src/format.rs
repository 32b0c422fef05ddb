//! Binary primitives shared by the snapshot format and the replication
//! payload. All multi-byte integers are little-endian.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Snapshot file header. The loader only requires the `REDIS` prefix;
/// the trailing digits carry the format revision.
pub const SNAP_MAGIC: &[u8; 9] = b"REDIS0001";

/// Byte written after the last shard record.
pub const SNAP_TRAILER: u8 = 0xFF;

/// Value variant tags used in entry encoding.
pub const TAG_STRING: u8 = 0;
pub const TAG_LIST: u8 = 1;
pub const TAG_SET: u8 = 2;
pub const TAG_HASH: u8 = 3;
pub const TAG_ZSET: u8 = 4;

/// Maximum length accepted for a single length-prefixed field. A corrupt
/// length prefix must not translate into a multi-gigabyte allocation.
pub const MAX_FIELD_LEN: usize = 512 * 1024 * 1024;

/// Maximum element count accepted for a persisted collection.
pub const MAX_COLLECTION_COUNT: u32 = 100_000_000;

/// Errors raised while reading or writing persistence formats.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("invalid snapshot header")]
    InvalidHeader,

    #[error("missing snapshot trailer")]
    MissingTrailer,

    #[error("unknown value tag: {0}")]
    UnknownTag(u8),

    #[error("shard count {0} out of range")]
    ShardCountOutOfRange(i32),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("failed to replace {path}: {source}")]
    Replace {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// write helpers
// ---------------------------------------------------------------------------

pub fn write_u8(w: &mut impl Write, val: u8) -> io::Result<()> {
    w.write_all(&[val])
}

pub fn write_u32(w: &mut impl Write, val: u32) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn write_i32(w: &mut impl Write, val: i32) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn write_i64(w: &mut impl Write, val: i64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn write_f64(w: &mut impl Write, val: f64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

/// Writes a length-prefixed byte slice: `[len: u32][data]`.
pub fn write_bytes(w: &mut impl Write, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("field length {} exceeds u32::MAX", data.len()),
        )
    })?;
    write_u32(w, len)?;
    w.write_all(data)
}

// ---------------------------------------------------------------------------
// read helpers
// ---------------------------------------------------------------------------

fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), FormatError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::UnexpectedEof
        } else {
            FormatError::Io(e)
        }
    })
}

pub fn read_u8(r: &mut impl Read) -> Result<u8, FormatError> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf)?;
    Ok(buf[0])
}

pub fn read_u32(r: &mut impl Read) -> Result<u32, FormatError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_i32(r: &mut impl Read) -> Result<i32, FormatError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn read_i64(r: &mut impl Read) -> Result<i64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub fn read_f64(r: &mut impl Read) -> Result<f64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Reads a length-prefixed byte vector, rejecting lengths beyond
/// [`MAX_FIELD_LEN`].
pub fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>, FormatError> {
    let len = read_u32(r)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(FormatError::InvalidData(format!(
            "field length {len} exceeds maximum of {MAX_FIELD_LEN}"
        )));
    }
    let mut buf = vec![0u8; len];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

/// Reads a length-prefixed field and decodes it as UTF-8.
pub fn read_string(r: &mut impl Read, field: &str) -> Result<String, FormatError> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes)
        .map_err(|_| FormatError::InvalidData(format!("{field} is not valid utf-8")))
}

/// Validates a deserialized collection count against the global cap.
pub fn validate_count(count: u32, label: &str) -> Result<(), FormatError> {
    if count > MAX_COLLECTION_COUNT {
        return Err(FormatError::InvalidData(format!(
            "{label} count {count} exceeds max {MAX_COLLECTION_COUNT}"
        )));
    }
    Ok(())
}

/// Caps pre-allocation so a corrupt count field cannot exhaust memory
/// before the element reads start failing.
pub fn capped_capacity(count: u32) -> usize {
    (count as usize).min(65_536)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn u32_round_trip() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0xDEAD_BEEF).unwrap();
        assert_eq!(read_u32(&mut Cursor::new(&buf)).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn i64_round_trip() {
        let mut buf = Vec::new();
        write_i64(&mut buf, -1).unwrap();
        assert_eq!(read_i64(&mut Cursor::new(&buf)).unwrap(), -1);

        let mut buf2 = Vec::new();
        write_i64(&mut buf2, i64::MAX).unwrap();
        assert_eq!(read_i64(&mut Cursor::new(&buf2)).unwrap(), i64::MAX);
    }

    #[test]
    fn f64_round_trip() {
        let mut buf = Vec::new();
        write_f64(&mut buf, 2.5).unwrap();
        assert_eq!(read_f64(&mut Cursor::new(&buf)).unwrap(), 2.5);
    }

    #[test]
    fn bytes_round_trip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"hello world").unwrap();
        assert_eq!(read_bytes(&mut Cursor::new(&buf)).unwrap(), b"hello world");
    }

    #[test]
    fn empty_bytes_round_trip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"").unwrap();
        assert_eq!(read_bytes(&mut Cursor::new(&buf)).unwrap(), b"");
    }

    #[test]
    fn truncated_input_returns_eof() {
        let buf = [0u8; 2];
        let err = read_u32(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, FormatError::UnexpectedEof));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut buf = Vec::new();
        write_u32(&mut buf, (MAX_FIELD_LEN as u32) + 1).unwrap();
        let err = read_bytes(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, FormatError::InvalidData(_)));
    }

    #[test]
    fn invalid_utf8_string_rejected() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, &[0xFF, 0xFE]).unwrap();
        let err = read_string(&mut Cursor::new(&buf), "key").unwrap_err();
        assert!(matches!(err, FormatError::InvalidData(_)));
    }
}
