//! Binary value encoding and on-disk record framing.
//!
//! Every value is encoded as a one-byte type tag followed by a
//! type-specific payload; all integers are little-endian. A record frames
//! one (box, tag, value?) triple:
//!
//! ```text
//! byte   0        : 0xDC  (magic, V2)
//! bytes  1..4     : u32   box id byte length
//! bytes  5..5+B   : UTF-8 box id
//! next   4        : u32   tag byte length
//! next   T        : UTF-8 tag
//! next   4        : u32   data byte length  (0 = tombstone)
//! next   D        : encoded value
//! last   4        : u32   CRC32 of every preceding byte of this record
//! ```
//!
//! V1 records (magic 0xDB) are identical minus the CRC trailer and are
//! accepted on read only; writers always emit V2.

use std::collections::BTreeMap;

use chrono::TimeZone;
use num_bigint::BigInt;

use crate::error::{FreightError, FreightResult};
use crate::value::Value;

/// Legacy record magic, no CRC trailer. Read-only.
pub const MAGIC_V1: u8 = 0xDB;
/// Current record magic, CRC32 trailer.
pub const MAGIC_V2: u8 = 0xDC;

/// Upper bound on box id and tag byte lengths.
pub const MAX_ID_LEN: usize = 1024;

/// Reserved box id used for transaction framing records.
pub const SYS_BOX: &str = "__SYS__";
/// Tag prefix of a transaction start marker; the ASCII decimal id follows.
pub const TX_START_PREFIX: &str = "TX_START_";
/// Tag prefix of a transaction commit marker.
pub const TX_COMMIT_PREFIX: &str = "TX_COMMIT_";

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_LIST: u8 = 5;
const TAG_MAP: u8 = 6;
const TAG_DATETIME: u8 = 7;
const TAG_BYTES: u8 = 8;
const TAG_BIGINT: u8 = 9;

/// CRC32 with the reflected 0xEDB88320 polynomial, init and final XOR
/// 0xFFFFFFFF.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

// ---------------------------------------------------------------------------
// Value encoding
// ---------------------------------------------------------------------------

/// Encode a value into its self-describing binary form.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    encode_into(value, &mut buf);
    buf
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(*b as u8);
        }
        Value::Int(n) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Double(x) => {
            buf.push(TAG_DOUBLE);
            buf.extend_from_slice(&x.to_le_bytes());
        }
        Value::Str(s) => {
            buf.push(TAG_STRING);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::List(items) => {
            buf.push(TAG_LIST);
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_into(item, buf);
            }
        }
        Value::Map(entries) => {
            buf.push(TAG_MAP);
            buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (key, val) in entries {
                encode_into(&Value::Str(key.clone()), buf);
                encode_into(val, buf);
            }
        }
        Value::DateTime(ts) => {
            buf.push(TAG_DATETIME);
            buf.extend_from_slice(&ts.timestamp_millis().to_le_bytes());
        }
        Value::Bytes(bytes) => {
            buf.push(TAG_BYTES);
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        Value::BigInt(n) => {
            let digits = n.to_string();
            buf.push(TAG_BIGINT);
            buf.extend_from_slice(&(digits.len() as u32).to_le_bytes());
            buf.extend_from_slice(digits.as_bytes());
        }
    }
}

/// Decode a value from `bytes`, requiring the whole buffer to be consumed.
pub fn decode_value(bytes: &[u8]) -> FreightResult<Value> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    let value = decode_next(&mut reader)?;
    if reader.pos != bytes.len() {
        return Err(codec_err(format!(
            "{} trailing bytes after value",
            bytes.len() - reader.pos
        )));
    }
    Ok(value)
}

fn decode_next(reader: &mut Reader) -> FreightResult<Value> {
    let tag = reader.u8()?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => match reader.u8()? {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            other => Err(codec_err(format!("invalid bool byte {}", other))),
        },
        TAG_INT => Ok(Value::Int(reader.i64()?)),
        TAG_DOUBLE => Ok(Value::Double(f64::from_le_bytes(reader.array::<8>()?))),
        TAG_STRING => Ok(Value::Str(reader.string()?)),
        TAG_LIST => {
            let count = reader.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_next(reader)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let count = reader.u32()? as usize;
            let mut entries = BTreeMap::new();
            for _ in 0..count {
                let key = match decode_next(reader)? {
                    Value::Str(key) => key,
                    other => {
                        return Err(codec_err(format!(
                            "map key must be a string, found {}",
                            other.kind()
                        )))
                    }
                };
                let val = decode_next(reader)?;
                entries.insert(key, val);
            }
            Ok(Value::Map(entries))
        }
        TAG_DATETIME => {
            let millis = reader.i64()?;
            match chrono::Utc.timestamp_millis_opt(millis).single() {
                Some(ts) => Ok(Value::DateTime(ts)),
                None => Err(codec_err(format!("timestamp {} out of range", millis))),
            }
        }
        TAG_BYTES => {
            let len = reader.u32()? as usize;
            Ok(Value::Bytes(reader.take(len)?.to_vec()))
        }
        TAG_BIGINT => {
            let digits = reader.string()?;
            digits
                .parse::<BigInt>()
                .map(Value::BigInt)
                .map_err(|e| codec_err(format!("invalid bigint '{}': {}", digits, e)))
        }
        other => Err(codec_err(format!("unknown type tag 0x{:02x}", other))),
    }
}

fn codec_err(reason: String) -> FreightError {
    FreightError::Codec { reason }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> FreightResult<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return Err(codec_err(format!(
                "need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> FreightResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> FreightResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> FreightResult<u32> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    fn i64(&mut self) -> FreightResult<i64> {
        Ok(i64::from_le_bytes(self.array::<8>()?))
    }

    fn string(&mut self) -> FreightResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| codec_err(format!("invalid UTF-8 string: {}", e)))
    }
}

// ---------------------------------------------------------------------------
// Record framing
// ---------------------------------------------------------------------------

/// A record parsed from a byte slice.
#[derive(Debug, Clone)]
pub struct Record {
    /// Magic byte, [`MAGIC_V1`] or [`MAGIC_V2`]
    pub version: u8,
    pub box_id: String,
    pub tag: String,
    /// Encoded value payload; `None` for a tombstone
    pub data: Option<Vec<u8>>,
    /// Total framed length in bytes, CRC trailer included
    pub len: usize,
}

/// Why a byte sequence is not a valid record. The recovery scan treats any
/// of these as "advance one byte and retry".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordParseError {
    /// First byte is neither V1 nor V2 magic
    Magic(u8),
    /// Record extends past the available bytes
    Truncated,
    /// Box or tag length of zero, or above [`MAX_ID_LEN`]
    IdLength(u32),
    /// Identifier bytes are not UTF-8
    IdEncoding,
    /// Stored CRC trailer does not match the record content
    Crc { stored: u32, computed: u32 },
}

/// Frame a record with V2 magic and CRC trailer. Empty `data` writes a
/// zero-length payload, the tombstone form; an encoded value is never
/// empty.
pub fn encode_record(box_id: &str, tag: &str, data: &[u8]) -> FreightResult<Vec<u8>> {
    if box_id.is_empty() || box_id.len() > MAX_ID_LEN {
        return Err(codec_err(format!("box id length {} out of range", box_id.len())));
    }
    if tag.is_empty() || tag.len() > MAX_ID_LEN {
        return Err(codec_err(format!("tag length {} out of range", tag.len())));
    }

    let mut buf = Vec::with_capacity(1 + 12 + box_id.len() + tag.len() + data.len() + 4);
    buf.push(MAGIC_V2);
    buf.extend_from_slice(&(box_id.len() as u32).to_le_bytes());
    buf.extend_from_slice(box_id.as_bytes());
    buf.extend_from_slice(&(tag.len() as u32).to_le_bytes());
    buf.extend_from_slice(tag.as_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    let checksum = crc32(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

/// Legacy V1 framing, kept for read-path and recovery tests.
#[cfg(test)]
pub(crate) fn encode_record_v1(box_id: &str, tag: &str, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(MAGIC_V1);
    buf.extend_from_slice(&(box_id.len() as u32).to_le_bytes());
    buf.extend_from_slice(box_id.as_bytes());
    buf.extend_from_slice(&(tag.len() as u32).to_le_bytes());
    buf.extend_from_slice(tag.as_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Parse one record from the start of `buf`. The slice may extend past the
/// record; `Record::len` reports where the next record would begin. V2
/// records have their CRC trailer verified; V1 records are accepted as-is.
pub fn parse_record(buf: &[u8]) -> Result<Record, RecordParseError> {
    if buf.is_empty() {
        return Err(RecordParseError::Truncated);
    }
    let version = buf[0];
    if version != MAGIC_V1 && version != MAGIC_V2 {
        return Err(RecordParseError::Magic(version));
    }

    let box_len = read_len(buf, 1)?;
    check_id_len(box_len)?;
    let box_start = 5;
    let tag_len_at = box_start + box_len as usize;
    let tag_len = read_len(buf, tag_len_at)?;
    check_id_len(tag_len)?;
    let tag_start = tag_len_at + 4;
    let data_len_at = tag_start + tag_len as usize;
    let data_len = read_len(buf, data_len_at)?;
    let data_start = data_len_at + 4;

    let trailer = if version == MAGIC_V2 { 4 } else { 0 };
    let total = data_start + data_len as usize + trailer;
    if buf.len() < total {
        return Err(RecordParseError::Truncated);
    }

    if version == MAGIC_V2 {
        let stored = u32::from_le_bytes([
            buf[total - 4],
            buf[total - 3],
            buf[total - 2],
            buf[total - 1],
        ]);
        let computed = crc32(&buf[..total - 4]);
        if stored != computed {
            return Err(RecordParseError::Crc { stored, computed });
        }
    }

    let box_id = std::str::from_utf8(&buf[box_start..box_start + box_len as usize])
        .map_err(|_| RecordParseError::IdEncoding)?
        .to_string();
    let tag = std::str::from_utf8(&buf[tag_start..tag_start + tag_len as usize])
        .map_err(|_| RecordParseError::IdEncoding)?
        .to_string();

    let data = if data_len == 0 {
        None
    } else {
        Some(buf[data_start..data_start + data_len as usize].to_vec())
    };

    Ok(Record { version, box_id, tag, data, len: total })
}

fn read_len(buf: &[u8], at: usize) -> Result<u32, RecordParseError> {
    if buf.len() < at + 4 {
        return Err(RecordParseError::Truncated);
    }
    Ok(u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]))
}

fn check_id_len(len: u32) -> Result<(), RecordParseError> {
    if len == 0 || len as usize > MAX_ID_LEN {
        return Err(RecordParseError::IdLength(len));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    fn roundtrip(value: Value) {
        let encoded = encode_value(&value);
        let decoded = decode_value(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_scalar_roundtrips() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(0));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Double(0.0));
        roundtrip(Value::Double(-123.456e78));
        roundtrip(Value::Str(String::new()));
        roundtrip(Value::Str("boîte à outils".to_string()));
        roundtrip(Value::Bytes(vec![]));
        roundtrip(Value::Bytes((0..=255).collect()));
    }

    #[test]
    fn test_bigint_roundtrip() {
        roundtrip(Value::BigInt(BigInt::from(0)));
        roundtrip(Value::BigInt(
            "-123456789012345678901234567890123456789".parse().unwrap(),
        ));
    }

    #[test]
    fn test_datetime_millisecond_precision() {
        let ts = chrono::Utc.timestamp_millis_opt(1_721_000_123_456).unwrap();
        roundtrip(Value::DateTime(ts));

        // Sub-millisecond precision is not representable on disk.
        let encoded = encode_value(&Value::DateTime(ts));
        assert_eq!(encoded.len(), 9);
    }

    #[test]
    fn test_nested_roundtrip() {
        roundtrip(Value::List(vec![
            Value::Int(1),
            Value::Str("two".into()),
            Value::List(vec![Value::Null]),
            value_map! { "k" => "v" },
        ]));
        roundtrip(value_map! {
            "name" => "Alice",
            "age" => 30i64,
            "scores" => Value::List(vec![Value::Double(1.5), Value::Double(2.5)]),
        });
    }

    #[test]
    fn test_non_string_map_key_rejected() {
        // A map of one entry whose key is an int, not a string.
        let mut buf = vec![TAG_MAP];
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(TAG_INT);
        buf.extend_from_slice(&7i64.to_le_bytes());
        buf.push(TAG_NULL);

        let err = decode_value(&buf).unwrap_err();
        assert!(format!("{}", err).contains("map key must be a string"));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = decode_value(&[0x7F]).unwrap_err();
        assert!(format!("{}", err).contains("unknown type tag"));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = encode_value(&Value::Int(1));
        buf.push(0);
        assert!(decode_value(&buf).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let buf = encode_value(&Value::Str("hello".into()));
        assert!(decode_value(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn test_record_roundtrip() {
        let data = encode_value(&value_map! { "v" => 1i64 });
        let rec = encode_record("users", "u1", &data).unwrap();

        assert_eq!(rec[0], MAGIC_V2);
        let parsed = parse_record(&rec).unwrap();
        assert_eq!(parsed.box_id, "users");
        assert_eq!(parsed.tag, "u1");
        assert_eq!(parsed.data.as_deref(), Some(data.as_slice()));
        assert_eq!(parsed.len, rec.len());
    }

    #[test]
    fn test_record_crc_trailer() {
        let rec = encode_record("b", "t", &encode_value(&Value::Int(9))).unwrap();
        let stored = u32::from_le_bytes(rec[rec.len() - 4..].try_into().unwrap());
        assert_eq!(stored, crc32(&rec[..rec.len() - 4]));
    }

    #[test]
    fn test_tombstone_record() {
        let rec = encode_record("users", "gone", &[]).unwrap();
        let parsed = parse_record(&rec).unwrap();
        assert!(parsed.data.is_none());
    }

    #[test]
    fn test_corrupted_record_detected() {
        let mut rec = encode_record("b", "t", &encode_value(&Value::Int(1))).unwrap();
        let mid = rec.len() / 2;
        rec[mid] ^= 0xFF;
        assert!(matches!(
            parse_record(&rec),
            Err(RecordParseError::Crc { .. })
        ));
    }

    #[test]
    fn test_v1_record_accepted_without_crc() {
        let data = encode_value(&value_map! { "old" => true });
        let rec = encode_record_v1("legacy", "t", &data);
        assert_eq!(rec[0], MAGIC_V1);

        let parsed = parse_record(&rec).unwrap();
        assert_eq!(parsed.version, MAGIC_V1);
        assert_eq!(parsed.box_id, "legacy");
        assert_eq!(parsed.data.as_deref(), Some(data.as_slice()));
        assert_eq!(parsed.len, rec.len());
    }

    #[test]
    fn test_bad_magic_rejected() {
        assert!(matches!(
            parse_record(&[0x00, 1, 2, 3]),
            Err(RecordParseError::Magic(0x00))
        ));
    }

    #[test]
    fn test_unreasonable_id_length_rejected() {
        let mut buf = vec![MAGIC_V2];
        buf.extend_from_slice(&(MAX_ID_LEN as u32 + 1).to_le_bytes());
        buf.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            parse_record(&buf),
            Err(RecordParseError::IdLength(_))
        ));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let rec = encode_record("b", "t", &encode_value(&Value::Int(1))).unwrap();
        assert!(matches!(
            parse_record(&rec[..rec.len() - 1]),
            Err(RecordParseError::Truncated)
        ));
    }

    #[test]
    fn test_oversized_identifiers_rejected_on_encode() {
        let long = "x".repeat(MAX_ID_LEN + 1);
        assert!(encode_record(&long, "t", &[]).is_err());
        assert!(encode_record("b", &long, &[]).is_err());
        assert!(encode_record("", "t", &[]).is_err());
        assert!(encode_record("b", "", &[]).is_err());
    }
}
