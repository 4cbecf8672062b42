//! Binary codec for the typed value sequences exchanged between peers.
//!
//! A sequence is encoded as `[optional count:u8] (tag:u8 payload)*`, where the
//! tag packs `(nbytes << 3) | type`. Integers and floats carry their sign in
//! the type nibble rather than the payload so magnitudes stay unsigned on the
//! wire. Big-endian throughout for bit-exact cross-platform reproducibility.
//! Floats are the one exception to the `nbytes` field: it is always written
//! as 0 and ignored on decode, since a float payload is unconditionally 8
//! bytes.

use crate::error::{CloudsyncError, Result};

/// The tombstone sentinel: a row or column was deleted.
pub const TOMBSTONE: &str = "__[RIP]__";
/// The row-level-security sentinel: server withheld this value.
pub const RLS_RESTRICTED: &str = "__[RLS]__";

const TYPE_INTEGER_NEG: u8 = 0;
const TYPE_INTEGER: u8 = 1;
const TYPE_FLOAT: u8 = 2;
const TYPE_TEXT: u8 = 3;
const TYPE_BLOB: u8 = 4;
const TYPE_NULL: u8 = 5;
const TYPE_INTEGER_MIN: u8 = 6;
const TYPE_FLOAT_NEG: u8 = 7;

/// A single typed value carried through the codec. Sentinel strings
/// (tombstone / row-level-security) are kept as distinguished variants so
/// callers never have to string-compare; they are only ever literal text on
/// the wire, per spec.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Null,
    /// Serializes as TEXT `__[RIP]__`.
    Tombstone,
    /// Serializes as TEXT `__[RLS]__`.
    RlsRestricted,
}

impl Value {
    fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            Value::Tombstone => Some(TOMBSTONE),
            Value::RlsRestricted => Some(RLS_RESTRICTED),
            _ => None,
        }
    }

    fn from_text(s: String) -> Value {
        Value::from_raw_text(s)
    }

    /// Classify a raw string into a sentinel variant if it matches one of
    /// the wire sentinels, otherwise a plain `Text`.
    pub fn from_raw_text(s: String) -> Value {
        match s.as_str() {
            TOMBSTONE => Value::Tombstone,
            RLS_RESTRICTED => Value::RlsRestricted,
            _ => Value::Text(s),
        }
    }
}

/// Visitor for decoded values. The default `Vec<Value>` sink is used by
/// [`decode_values`]; hosts binding to a prepared statement or a print sink
/// can implement this directly instead of collecting first.
pub trait ValueSink {
    fn push(&mut self, value: Value);
}

impl ValueSink for Vec<Value> {
    fn push(&mut self, value: Value) {
        Vec::push(self, value);
    }
}

/// Smallest byte width in `1..=8` that holds `value` big-endian, per the
/// threshold table in spec.md §4.1.
fn encoded_width(value: u64) -> u8 {
    const THRESHOLDS: [u64; 7] = [
        0x7F,
        0x7FFF,
        0x7FFFFF,
        0x7FFF_FFFF,
        0x7FFF_FFFF_FF,
        0x7FFF_FFFF_FFFF,
        0x7FFF_FFFF_FFFF_FF,
    ];
    for (i, t) in THRESHOLDS.iter().enumerate() {
        if value <= *t {
            return (i + 1) as u8;
        }
    }
    8
}

fn push_be(out: &mut Vec<u8>, value: u64, nbytes: u8) {
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[8 - nbytes as usize..]);
}

fn read_be(bytes: &[u8], nbytes: u8) -> Result<u64> {
    if bytes.len() < nbytes as usize {
        return Err(CloudsyncError::Codec("truncated integer payload".into()));
    }
    let mut buf = [0u8; 8];
    buf[8 - nbytes as usize..].copy_from_slice(&bytes[..nbytes as usize]);
    Ok(u64::from_be_bytes(buf))
}

fn encode_one(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push((0 << 3) | TYPE_NULL),
        Value::Integer(n) => {
            if *n == i64::MIN {
                out.push((0 << 3) | TYPE_INTEGER_MIN);
                return;
            }
            let neg = *n < 0;
            let abs = if neg { n.unsigned_abs() } else { *n as u64 };
            let nbytes = encoded_width(abs);
            let ty = if neg { TYPE_INTEGER_NEG } else { TYPE_INTEGER };
            out.push((nbytes << 3) | ty);
            push_be(out, abs, nbytes);
        }
        Value::Float(f) => {
            let neg = *f < 0.0 || (*f == 0.0 && f.is_sign_negative());
            let abs = f.abs();
            let bits = abs.to_bits();
            let ty = if neg { TYPE_FLOAT_NEG } else { TYPE_FLOAT };
            out.push((0u8 << 3) | ty);
            push_be(out, bits, 8);
        }
        Value::Blob(b) => {
            let nbytes = encoded_width(b.len() as u64);
            out.push((nbytes << 3) | TYPE_BLOB);
            push_be(out, b.len() as u64, nbytes);
            out.extend_from_slice(b);
        }
        Value::Text(_) | Value::Tombstone | Value::RlsRestricted => {
            let s = value.as_text().expect("text-like variant");
            let bytes = s.as_bytes();
            let nbytes = encoded_width(bytes.len() as u64);
            out.push((nbytes << 3) | TYPE_TEXT);
            push_be(out, bytes.len() as u64, nbytes);
            out.extend_from_slice(bytes);
        }
    }
}

fn decode_one(bytes: &[u8], pos: &mut usize) -> Result<Value> {
    if *pos >= bytes.len() {
        return Err(CloudsyncError::Codec("truncated tag".into()));
    }
    let tag = bytes[*pos];
    *pos += 1;
    let nbytes = tag >> 3;
    let ty = tag & 0x7;
    match ty {
        TYPE_NULL => Ok(Value::Null),
        TYPE_INTEGER_MIN => Ok(Value::Integer(i64::MIN)),
        TYPE_INTEGER | TYPE_INTEGER_NEG => {
            let abs = read_be(&bytes[*pos..], nbytes)?;
            *pos += nbytes as usize;
            let n = if ty == TYPE_INTEGER_NEG {
                if abs > i64::MAX as u64 + 1 {
                    return Err(CloudsyncError::Codec("negative integer overflow".into()));
                }
                -(abs as i128) as i64
            } else {
                if abs > i64::MAX as u64 {
                    return Err(CloudsyncError::Codec("integer overflow".into()));
                }
                abs as i64
            };
            Ok(Value::Integer(n))
        }
        TYPE_FLOAT | TYPE_FLOAT_NEG => {
            // The tag's nbytes field is unused for floats (always 0 on the
            // wire); the payload is unconditionally 8 bytes.
            let bits = read_be(&bytes[*pos..], 8)?;
            *pos += 8;
            let mut f = f64::from_bits(bits);
            if ty == TYPE_FLOAT_NEG {
                f = -f;
            }
            Ok(Value::Float(f))
        }
        TYPE_TEXT | TYPE_BLOB => {
            let len = read_be(&bytes[*pos..], nbytes)? as usize;
            *pos += nbytes as usize;
            if *pos + len > bytes.len() {
                return Err(CloudsyncError::Codec("truncated payload".into()));
            }
            let raw = bytes[*pos..*pos + len].to_vec();
            *pos += len;
            if ty == TYPE_TEXT {
                let s = String::from_utf8(raw)
                    .map_err(|e| CloudsyncError::Codec(format!("invalid utf8: {e}")))?;
                Ok(Value::from_text(s))
            } else {
                Ok(Value::Blob(raw))
            }
        }
        _ => Err(CloudsyncError::Codec(format!("unknown type tag {ty}"))),
    }
}

/// Value-row encoding: no leading count, used for change-log payload rows.
pub fn encode_values(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        encode_one(v, &mut out);
    }
    out
}

/// Value-row decode, collecting into a `Vec<Value>`.
pub fn decode_values(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut sink = Vec::new();
    decode_values_with(bytes, &mut sink)?;
    Ok(sink)
}

/// Value-row decode, dispatching each decoded value into `sink` as it is
/// produced (bind-to-statement, print, whatever the caller needs).
pub fn decode_values_with<S: ValueSink>(bytes: &[u8], sink: &mut S) -> Result<()> {
    let mut pos = 0;
    while pos < bytes.len() {
        sink.push(decode_one(bytes, &mut pos)?);
    }
    Ok(())
}

/// Primary-key encoding: a leading `u8` count (so at most 255 columns),
/// followed by the value-row encoding of the key's column values.
pub fn encode_pk(values: &[Value]) -> Result<Vec<u8>> {
    if values.len() > 255 {
        return Err(CloudsyncError::Codec("primary key has more than 255 columns".into()));
    }
    let mut out = Vec::with_capacity(1 + values.len() * 2);
    out.push(values.len() as u8);
    for v in values {
        encode_one(v, &mut out);
    }
    Ok(out)
}

/// Primary-key decode: reads the leading count, then exactly that many
/// values.
pub fn decode_pk(bytes: &[u8]) -> Result<Vec<Value>> {
    if bytes.is_empty() {
        return Err(CloudsyncError::Codec("empty primary key encoding".into()));
    }
    let count = bytes[0] as usize;
    let mut pos = 1;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(decode_one(bytes, &mut pos)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: Vec<Value>) {
        let encoded = encode_values(&values);
        let decoded = decode_values(&encoded).unwrap();
        assert_eq!(values, decoded);
    }

    #[test]
    fn roundtrips_mixed_types() {
        roundtrip(vec![
            Value::Integer(0),
            Value::Integer(-1),
            Value::Integer(127),
            Value::Integer(128),
            Value::Integer(-128),
            Value::Integer(i64::MAX),
            Value::Integer(i64::MIN),
            Value::Float(0.0),
            Value::Float(-0.5),
            Value::Float(3.1415926535),
            Value::Text("hello".into()),
            Value::Text(String::new()),
            Value::Blob(vec![1, 2, 3, 4]),
            Value::Null,
            Value::Tombstone,
            Value::RlsRestricted,
        ]);
    }

    #[test]
    fn encoded_width_matches_threshold_table() {
        assert_eq!(encoded_width(0x7F), 1);
        assert_eq!(encoded_width(0x80), 2);
        assert_eq!(encoded_width(0x7FFF), 2);
        assert_eq!(encoded_width(0x8000), 3);
        assert_eq!(encoded_width(u64::MAX), 8);
    }

    #[test]
    fn integer_encoded_length_follows_threshold() {
        for (n, expected_nbytes) in [
            (0i64, 1u8),
            (127, 1),
            (128, 2),
            (32767, 2),
            (32768, 3),
            (-1, 1),
            (-128, 2),
            (-129, 2),
        ] {
            let enc = encode_values(&[Value::Integer(n)]);
            // tag byte + payload
            assert_eq!(enc.len(), 1 + expected_nbytes as usize, "n={n}");
        }
    }

    #[test]
    fn pk_roundtrip_preserves_arity() {
        let pk = vec![Value::Integer(42), Value::Text("k".into())];
        let encoded = encode_pk(&pk).unwrap();
        assert_eq!(encoded[0], 2);
        let decoded = decode_pk(&encoded).unwrap();
        assert_eq!(pk, decoded);
    }

    #[test]
    fn rejects_truncated_input() {
        let enc = encode_values(&[Value::Text("abcdef".into())]);
        assert!(decode_values(&enc[..enc.len() - 2]).is_err());
    }
}
