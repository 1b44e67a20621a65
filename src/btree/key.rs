use std::cmp::Ordering;

use crate::{
    error::{ErrorKind, StratumError},
    io::{StratumReader, StratumWriter},
};

/// Column types a key may be composed of.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyKind {
    I16,
    I32,
    I64,
    Varchar,
}

#[derive(Debug, Clone)]
pub struct KeyCol {
    pub kind: KeyKind,
    /// Collation flag; only ascending (0) is used.
    pub flag: u8,
    /// Declared max length, informational for Varchar.
    pub length: u16,
}

/// Describes the columns a key value concatenates.
#[derive(Debug, Clone)]
pub struct KeyDesc {
    pub cols: Vec<KeyCol>,
}

impl KeyDesc {
    pub fn single(kind: KeyKind) -> Self {
        let length = match kind {
            KeyKind::I16 => 2,
            KeyKind::I32 => 4,
            KeyKind::I64 => 8,
            KeyKind::Varchar => 0,
        };
        Self {
            cols: vec![KeyCol {
                kind,
                flag: 0,
                length,
            }],
        }
    }

    pub fn i32() -> Self {
        Self::single(KeyKind::I32)
    }
}

/// A key value: the concatenated little-endian column encodings.
/// Varchar columns carry a u16 length prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyValue {
    pub bytes: Vec<u8>,
}

impl KeyValue {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_i32(v: i32) -> Self {
        let mut w = StratumWriter::new();
        w.write_i32(v);
        Self { bytes: w.to_bytes() }
    }

    pub fn from_i64(v: i64) -> Self {
        let mut w = StratumWriter::new();
        w.write_i64(v);
        Self { bytes: w.to_bytes() }
    }

    pub fn from_str(s: &str) -> Self {
        let mut w = StratumWriter::new();
        w.write_u16(s.len() as u16);
        w.write_bytes(s.as_bytes());
        Self { bytes: w.to_bytes() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn bad_key() -> StratumError {
    StratumError::new(ErrorKind::BadKeyValue, "truncated key value")
}

/// Column-wise lexicographic comparison of two key values.
pub fn compare_keys(kdesc: &KeyDesc, a: &KeyValue, b: &KeyValue) -> Result<Ordering, StratumError> {
    let mut ra = StratumReader::new(&a.bytes);
    let mut rb = StratumReader::new(&b.bytes);

    for col in &kdesc.cols {
        let ord = match col.kind {
            KeyKind::I16 => {
                if ra.remaining() < 2 || rb.remaining() < 2 {
                    return Err(bad_key());
                }
                ra.read_i16().cmp(&rb.read_i16())
            }
            KeyKind::I32 => {
                if ra.remaining() < 4 || rb.remaining() < 4 {
                    return Err(bad_key());
                }
                ra.read_i32().cmp(&rb.read_i32())
            }
            KeyKind::I64 => {
                if ra.remaining() < 8 || rb.remaining() < 8 {
                    return Err(bad_key());
                }
                ra.read_i64().cmp(&rb.read_i64())
            }
            KeyKind::Varchar => {
                if ra.remaining() < 2 || rb.remaining() < 2 {
                    return Err(bad_key());
                }
                let la = ra.read_u16() as usize;
                let lb = rb.read_u16() as usize;
                if ra.remaining() < la || rb.remaining() < lb {
                    return Err(bad_key());
                }
                ra.read_bytes(la).cmp(&rb.read_bytes(lb))
            }
        };
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(Ordering::Equal)
}

/// Validate that `kval` decodes fully under `kdesc`.
pub fn check_key(kdesc: &KeyDesc, kval: &KeyValue) -> Result<(), StratumError> {
    let mut r = StratumReader::new(&kval.bytes);
    for col in &kdesc.cols {
        let need = match col.kind {
            KeyKind::I16 => 2,
            KeyKind::I32 => 4,
            KeyKind::I64 => 8,
            KeyKind::Varchar => {
                if r.remaining() < 2 {
                    return Err(bad_key());
                }
                r.read_u16() as usize
            }
        };
        if r.remaining() < need {
            return Err(bad_key());
        }
        r.skip(need);
    }
    if r.remaining() != 0 {
        return Err(bad_key());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_i32() {
        let kd = KeyDesc::i32();
        let a = KeyValue::from_i32(-5);
        let b = KeyValue::from_i32(3);
        assert_eq!(compare_keys(&kd, &a, &b).unwrap(), Ordering::Less);
        assert_eq!(compare_keys(&kd, &b, &b).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_compare_multi_column() {
        let kd = KeyDesc {
            cols: vec![
                KeyCol {
                    kind: KeyKind::I16,
                    flag: 0,
                    length: 2,
                },
                KeyCol {
                    kind: KeyKind::I32,
                    flag: 0,
                    length: 4,
                },
            ],
        };
        let mut w = StratumWriter::new();
        w.write_i16(1);
        w.write_i32(100);
        let a = KeyValue::from_bytes(w.to_bytes());

        let mut w = StratumWriter::new();
        w.write_i16(1);
        w.write_i32(200);
        let b = KeyValue::from_bytes(w.to_bytes());

        assert_eq!(compare_keys(&kd, &a, &b).unwrap(), Ordering::Less);
        check_key(&kd, &a).unwrap();
    }

    #[test]
    fn test_truncated_key_is_rejected() {
        let kd = KeyDesc::i32();
        let bad = KeyValue::from_bytes(vec![1, 2]);
        assert!(check_key(&kd, &bad).is_err());
        assert_eq!(
            *compare_keys(&kd, &bad, &KeyValue::from_i32(0))
                .unwrap_err()
                .kind(),
            ErrorKind::BadKeyValue
        );
    }

    #[test]
    fn test_varchar_compare() {
        let kd = KeyDesc::single(KeyKind::Varchar);
        let a = KeyValue::from_str("apple");
        let b = KeyValue::from_str("apricot");
        assert_eq!(compare_keys(&kd, &a, &b).unwrap(), Ordering::Less);
    }
}
