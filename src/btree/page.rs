//! Typed views over B+ tree pages.
//!
//! Pages are raw byte buffers; these functions decode and build the
//! three entry shapes. A leaf entry holds its key and either an inline
//! sorted ObjectId array (`n_objects >= 0`) or the head page of an
//! overflow chain (`n_objects < 0`, strictly a mode flag).

use std::cmp::Ordering;

use crate::{
    error::{ErrorKind, StratumError},
    ids::{ObjectId, PageId, OBJECT_ID_SIZE},
    io::{StratumReader, StratumWriter},
    page::{
        dump_prefix, read_header, slot_offset, write_header, PAGE_HEADER_SIZE,
    },
    utils::aligned_length,
};

use super::key::{compare_keys, KeyDesc, KeyValue};

/// Internal pages reserve four bytes past the shared header for the
/// leftmost child pointer.
pub const INTERNAL_DATA_START: usize = PAGE_HEADER_SIZE + 4;
pub const LEAF_DATA_START: usize = PAGE_HEADER_SIZE;

pub fn check_type(page: &[u8], flag: u16, pid: &PageId) -> Result<(), StratumError> {
    let hdr = read_header(page);
    if hdr.type_flags & flag == 0 {
        return Err(StratumError::new(
            ErrorKind::BadBtreePage(*pid),
            &format!(
                "expected type {:#x}, header {}",
                flag,
                dump_prefix(page)
            ),
        ));
    }
    Ok(())
}

// ---- leaf entries ----

#[derive(Debug, Clone, PartialEq)]
pub enum LeafPayload {
    Inline(Vec<ObjectId>),
    Overflow(u32),
}

#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub key: KeyValue,
    pub payload: LeafPayload,
}

/// Stored length of a leaf entry, derived from its own header.
pub fn leaf_entry_len(bytes: &[u8]) -> usize {
    let mut r = StratumReader::new(bytes);
    let klen = r.read_u16() as usize;
    let n_objects = r.read_i16();
    let payload = if n_objects < 0 {
        4
    } else {
        n_objects as usize * OBJECT_ID_SIZE
    };
    4 + aligned_length(klen) + payload
}

pub fn build_leaf_entry(key: &KeyValue, payload: &LeafPayload) -> Vec<u8> {
    let mut w = StratumWriter::new();
    w.write_u16(key.len() as u16);
    match payload {
        LeafPayload::Inline(oids) => w.write_i16(oids.len() as i16),
        LeafPayload::Overflow(_) => w.write_i16(-1),
    }
    w.write_bytes(&key.bytes);
    for _ in key.len()..aligned_length(key.len()) {
        w.write_u8(0);
    }
    match payload {
        LeafPayload::Inline(oids) => {
            for oid in oids {
                w.write(oid);
            }
        }
        LeafPayload::Overflow(head) => w.write_u32(*head),
    }
    w.to_bytes()
}

pub fn read_leaf_entry(page: &[u8], slot_no: usize) -> LeafEntry {
    let off = slot_offset(page, slot_no);
    let mut r = StratumReader::new(&page[off..]);
    let klen = r.read_u16() as usize;
    let n_objects = r.read_i16();
    let key = KeyValue::from_bytes(r.read_bytes(klen));
    r.skip(aligned_length(klen) - klen);
    let payload = if n_objects < 0 {
        LeafPayload::Overflow(r.read_u32())
    } else {
        let mut oids = Vec::with_capacity(n_objects as usize);
        for _ in 0..n_objects {
            oids.push(r.read());
        }
        LeafPayload::Inline(oids)
    };
    LeafEntry { key, payload }
}

pub fn leaf_key(page: &[u8], slot_no: usize) -> KeyValue {
    let off = slot_offset(page, slot_no);
    let mut r = StratumReader::new(&page[off..]);
    let klen = r.read_u16() as usize;
    r.skip(2);
    KeyValue::from_bytes(r.read_bytes(klen))
}

/// Overwrite the entry at `slot_no` in place. The caller has already
/// resized the entry to `bytes.len()`.
pub fn write_leaf_entry(page: &mut [u8], slot_no: usize, bytes: &[u8]) {
    let off = slot_offset(page, slot_no);
    page[off..off + bytes.len()].copy_from_slice(bytes);
}

/// Binary search the leaf for `kval`. Returns `(found, slot)`; `slot`
/// is where the key sits or would be inserted.
pub fn search_leaf(
    page: &[u8],
    kdesc: &KeyDesc,
    kval: &KeyValue,
) -> Result<(bool, usize), StratumError> {
    let n = read_header(page).n_slots as usize;
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match compare_keys(kdesc, &leaf_key(page, mid), kval)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Equal => return Ok((true, mid)),
            Ordering::Greater => hi = mid,
        }
    }
    Ok((false, lo))
}

// ---- internal entries ----

/// Stored length of an internal entry: child pointer, key length, key
/// bytes.
pub fn internal_entry_len(bytes: &[u8]) -> usize {
    let mut r = StratumReader::new(bytes);
    r.skip(4);
    let klen = r.read_u16() as usize;
    6 + klen
}

pub fn build_internal_entry(child: u32, key: &KeyValue) -> Vec<u8> {
    let mut w = StratumWriter::new();
    w.write_u32(child);
    w.write_u16(key.len() as u16);
    w.write_bytes(&key.bytes);
    w.to_bytes()
}

pub fn read_internal_entry(page: &[u8], slot_no: usize) -> (u32, KeyValue) {
    let off = slot_offset(page, slot_no);
    let mut r = StratumReader::new(&page[off..]);
    let child = r.read_u32();
    let klen = r.read_u16() as usize;
    (child, KeyValue::from_bytes(r.read_bytes(klen)))
}

pub fn internal_p0(page: &[u8]) -> u32 {
    u32::from_le_bytes([
        page[PAGE_HEADER_SIZE],
        page[PAGE_HEADER_SIZE + 1],
        page[PAGE_HEADER_SIZE + 2],
        page[PAGE_HEADER_SIZE + 3],
    ])
}

pub fn set_internal_p0(page: &mut [u8], p0: u32) {
    page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4].copy_from_slice(&p0.to_le_bytes());
}

/// The child to descend into for `kval`: the last entry whose key is
/// `<= kval`, or the leftmost child when every key is greater.
/// Returns the child page number and the slot it came from (`None`
/// for the leftmost child).
pub fn internal_child_for(
    page: &[u8],
    kdesc: &KeyDesc,
    kval: &KeyValue,
) -> Result<(u32, Option<usize>), StratumError> {
    let n = read_header(page).n_slots as usize;
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let (_, key) = read_internal_entry(page, mid);
        match compare_keys(kdesc, &key, kval)? {
            Ordering::Less | Ordering::Equal => lo = mid + 1,
            Ordering::Greater => hi = mid,
        }
    }
    if lo == 0 {
        Ok((internal_p0(page), None))
    } else {
        let (child, _) = read_internal_entry(page, lo - 1);
        Ok((child, Some(lo - 1)))
    }
}

// ---- overflow pages ----

/// ObjectIds per overflow page.
pub fn overflow_capacity(page_len: usize) -> usize {
    (page_len - PAGE_HEADER_SIZE) / OBJECT_ID_SIZE
}

pub fn read_overflow_oids(page: &[u8]) -> Vec<ObjectId> {
    let count = read_header(page).n_slots as usize;
    let mut r = StratumReader::new(&page[PAGE_HEADER_SIZE..]);
    (0..count).map(|_| r.read()).collect()
}

pub fn write_overflow_oids(page: &mut [u8], oids: &[ObjectId]) {
    let mut w = StratumWriter::new();
    for oid in oids {
        w.write(oid);
    }
    let bytes = w.to_bytes();
    page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + bytes.len()].copy_from_slice(&bytes);

    let mut hdr = read_header(page);
    hdr.n_slots = oids.len() as u16;
    hdr.free = (PAGE_HEADER_SIZE + bytes.len()) as u16;
    write_header(page, &hdr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{init_page, insert_entry, PAGE_TYPE_LEAF};

    #[test]
    fn test_leaf_entry_round_trip() {
        let key = KeyValue::from_i32(77);
        let oids = vec![ObjectId::new(1, 2, 3, 4), ObjectId::new(1, 5, 0, 9)];
        let bytes = build_leaf_entry(&key, &LeafPayload::Inline(oids.clone()));
        assert_eq!(leaf_entry_len(&bytes), bytes.len());

        let mut page = vec![0u8; 512];
        init_page(&mut page, PAGE_TYPE_LEAF, PageId::new(0, 0), LEAF_DATA_START);
        insert_entry(&mut page, LEAF_DATA_START, 0, &bytes, &leaf_entry_len).unwrap();

        let entry = read_leaf_entry(&page, 0);
        assert_eq!(entry.key, key);
        assert_eq!(entry.payload, LeafPayload::Inline(oids));
    }

    #[test]
    fn test_overflow_mode_entry() {
        let key = KeyValue::from_i32(5);
        let bytes = build_leaf_entry(&key, &LeafPayload::Overflow(42));
        assert_eq!(leaf_entry_len(&bytes), bytes.len());

        let mut page = vec![0u8; 512];
        init_page(&mut page, PAGE_TYPE_LEAF, PageId::new(0, 0), LEAF_DATA_START);
        insert_entry(&mut page, LEAF_DATA_START, 0, &bytes, &leaf_entry_len).unwrap();

        match read_leaf_entry(&page, 0).payload {
            LeafPayload::Overflow(head) => assert_eq!(head, 42),
            _ => panic!("expected overflow mode"),
        }
    }

    #[test]
    fn test_internal_search() {
        use crate::page::PAGE_TYPE_INTERNAL;

        let kd = KeyDesc::i32();
        let mut page = vec![0u8; 512];
        init_page(
            &mut page,
            PAGE_TYPE_INTERNAL,
            PageId::new(0, 9),
            INTERNAL_DATA_START,
        );
        set_internal_p0(&mut page, 100);
        for (i, k) in [10, 20, 30].iter().enumerate() {
            let e = build_internal_entry(101 + i as u32, &KeyValue::from_i32(*k));
            insert_entry(&mut page, INTERNAL_DATA_START, i, &e, &internal_entry_len).unwrap();
        }

        let (c, s) = internal_child_for(&page, &kd, &KeyValue::from_i32(5)).unwrap();
        assert_eq!((c, s), (100, None));
        let (c, s) = internal_child_for(&page, &kd, &KeyValue::from_i32(10)).unwrap();
        assert_eq!((c, s), (101, Some(0)));
        let (c, _) = internal_child_for(&page, &kd, &KeyValue::from_i32(25)).unwrap();
        assert_eq!(c, 102);
        let (c, _) = internal_child_for(&page, &kd, &KeyValue::from_i32(99)).unwrap();
        assert_eq!(c, 103);
    }
}
