//! Catalog gateway: counter-backed id allocation and catalog lookups.
//!
//! Every data volume carries a small catalog: a counter page with
//! named serial counters, a heap of catalog tuples on chained slotted
//! pages, and two B+ trees keyed by `(vol_no, serial)` - SYSFILES for
//! object files and SYSINDEXES for indexes. The trees' cursor oids
//! point back at the heap tuples.

use log::debug;

use crate::{
    btree::{
        self,
        key::{KeyCol, KeyDesc, KeyKind, KeyValue},
        CompOp,
    },
    buffer::BufferClass,
    disk::AllocScope,
    error::{ErrorKind, StratumError},
    ids::{FileId, IndexId, ObjectId, PageId, PhysicalIndexId},
    io::{StratumReader, StratumWriter},
    page::{self, read_header, write_header, PAGE_HEADER_SIZE},
    process::Thread,
    types::StratumResult,
    utils::HandyRwLock,
};

pub const SYS_SERIAL_FOR_FILE_COUNTER: &str = "smSysSerialForFileCounter";
pub const SYS_SERIAL_FOR_INDEX_COUNTER: &str = "smSysSerialForIndexCounter";

/// Catalog pages are plain slotted pages.
pub const PAGE_TYPE_CATALOG: u16 = 0x40;

/// Where a data volume's catalog structures live; read from the
/// volume header at open time.
#[derive(Debug, Clone, Copy)]
pub struct CatalogAnchors {
    pub sys_files_root: PageId,
    pub sys_indexes_root: PageId,
    pub counter_page: PageId,
    pub heap_first: PageId,
}

#[derive(Debug, Clone, Copy)]
pub struct TempIndexEntry {
    pub iid: IndexId,
    pub root_page: u32,
}

/// Key shape of both system trees: `(vol_no, serial)`.
pub fn sys_key_desc() -> KeyDesc {
    KeyDesc {
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
    }
}

pub fn sys_key(vol_no: u16, serial: u32) -> KeyValue {
    let mut w = StratumWriter::new();
    w.write_i16(vol_no as i16);
    w.write_i32(serial as i32);
    KeyValue::from_bytes(w.to_bytes())
}

fn sys_scope(vol_no: u16) -> AllocScope {
    AllocScope::new(vol_no, 0, 100)
}

/// Create the catalog structures on a freshly formatted, mounted data
/// volume and anchor them in the volume header.
pub fn create_catalog(td: &Thread, vol_no: u16) -> StratumResult {
    let scope = sys_scope(vol_no);

    let sys_files_root = btree::create_index(td, &scope)?;
    let sys_indexes_root = btree::create_index(td, &scope)?;
    let counter_page = alloc_catalog_page(td, &scope, None)?;
    let heap_first = alloc_catalog_page(td, &scope, None)?;

    let vol = td.disk().volume(vol_no)?;
    let mut hdr = vol.read_header()?;
    hdr.sys_files_root = sys_files_root.page_no;
    hdr.sys_indexes_root = sys_indexes_root.page_no;
    hdr.counter_page = counter_page.page_no;
    hdr.catalog_heap_first = heap_first.page_no;
    vol.write_header(&hdr)?;

    let anchors = CatalogAnchors {
        sys_files_root,
        sys_indexes_root,
        counter_page,
        heap_first,
    };
    td.process().catalogs().wl().insert(vol_no, anchors);

    create_counter(td, vol_no, SYS_SERIAL_FOR_FILE_COUNTER, u32::MAX)?;
    create_counter(td, vol_no, SYS_SERIAL_FOR_INDEX_COUNTER, u32::MAX)?;
    debug!("catalog created on volume {}", vol_no);
    Ok(())
}

/// Load the catalog anchors of a mounted data volume.
pub fn open_catalog(td: &Thread, vol_no: u16) -> StratumResult {
    let vol = td.disk().volume(vol_no)?;
    let hdr = vol.read_header()?;
    if hdr.sys_files_root == u32::MAX {
        return Err(StratumError::new(
            ErrorKind::BadVolumeHeader,
            &format!("volume {} carries no catalog", vol_no),
        ));
    }
    let anchors = CatalogAnchors {
        sys_files_root: PageId::new(vol_no, hdr.sys_files_root),
        sys_indexes_root: PageId::new(vol_no, hdr.sys_indexes_root),
        counter_page: PageId::new(vol_no, hdr.counter_page),
        heap_first: PageId::new(vol_no, hdr.catalog_heap_first),
    };
    td.process().catalogs().wl().insert(vol_no, anchors);
    Ok(())
}

fn anchors(td: &Thread, vol_no: u16) -> Result<CatalogAnchors, StratumError> {
    td.process()
        .catalogs()
        .rl()
        .get(&vol_no)
        .copied()
        .ok_or_else(|| {
            StratumError::new(
                ErrorKind::BadParameter,
                &format!("no catalog open for volume {}", vol_no),
            )
        })
}

fn alloc_catalog_page(
    td: &Thread,
    scope: &AllocScope,
    near: Option<PageId>,
) -> Result<PageId, StratumError> {
    let pid = td
        .disk()
        .alloc_trains(scope.vol_no, scope.first_ext, near, scope.fill_factor, 1, 1)?[0];
    let guard = td.buffer().get_new_train(&pid, BufferClass::Page)?;
    {
        let mut data = guard.write();
        page::init_page(&mut data, PAGE_TYPE_CATALOG, pid, HEAP_DATA_START);
    }
    guard.mark_dirty();
    Ok(pid)
}

// ---- counters ----

const COUNTER_NAME_LEN: usize = 32;
const COUNTER_ENTRY_LEN: usize = COUNTER_NAME_LEN + 8;

fn counter_entry_len(_bytes: &[u8]) -> usize {
    COUNTER_ENTRY_LEN
}

/// Register a named counter starting at zero.
pub fn create_counter(td: &Thread, vol_no: u16, name: &str, limit: u32) -> StratumResult {
    if name.len() > COUNTER_NAME_LEN || limit == 0 {
        return Err(StratumError::new(ErrorKind::BadParameter, "create_counter"));
    }
    let anchors = anchors(td, vol_no)?;
    let guard = td.buffer().get_train(&anchors.counter_page, BufferClass::Page)?;

    let mut w = StratumWriter::new();
    let mut name_bytes = name.as_bytes().to_vec();
    name_bytes.resize(COUNTER_NAME_LEN, 0);
    w.write_bytes(&name_bytes);
    w.write_u32(0);
    w.write_u32(limit);

    {
        let mut data = guard.write();
        let slot = read_header(&data).n_slots as usize;
        page::insert_entry(&mut data, HEAP_DATA_START, slot, &w.to_bytes(), &counter_entry_len)?;
    }
    guard.mark_dirty();
    Ok(())
}

/// The slot of a named counter on the volume's counter page.
pub fn get_counter_id(td: &Thread, vol_no: u16, name: &str) -> Result<usize, StratumError> {
    let anchors = anchors(td, vol_no)?;
    let guard = td.buffer().get_train(&anchors.counter_page, BufferClass::Page)?;
    let data = guard.read();
    let n = read_header(&data).n_slots as usize;
    for slot in 0..n {
        let off = page::slot_offset(&data, slot);
        let stored = &data[off..off + COUNTER_NAME_LEN];
        if stored
            .iter()
            .zip(name.as_bytes().iter().chain(std::iter::repeat(&0)))
            .all(|(a, b)| a == b)
        {
            return Ok(slot);
        }
    }
    Err(StratumError::new(
        ErrorKind::NotFound,
        &format!("counter {} not found", name),
    ))
}

/// Read `n` consecutive serials from a counter; returns the first.
/// The counter wraps at its limit.
pub fn get_counter_values(
    td: &Thread,
    vol_no: u16,
    counter_id: usize,
    n: u32,
) -> Result<u32, StratumError> {
    let anchors = anchors(td, vol_no)?;
    let guard = td.buffer().get_train(&anchors.counter_page, BufferClass::Page)?;

    let value = {
        let mut data = guard.write();
        let off = page::slot_offset(&data, counter_id);
        let mut r = StratumReader::new(&data[off + COUNTER_NAME_LEN..]);
        let value = r.read_u32();
        let limit = r.read_u32();
        let next = (value as u64 + n as u64) % limit as u64;
        data[off + COUNTER_NAME_LEN..off + COUNTER_NAME_LEN + 4]
            .copy_from_slice(&(next as u32).to_le_bytes());
        value
    };
    guard.mark_dirty();
    Ok(value)
}

/// Cap a counter's serial space. Wraparound behavior testing hook.
pub fn set_counter_limit(td: &Thread, vol_no: u16, counter_id: usize, limit: u32) -> StratumResult {
    let anchors = anchors(td, vol_no)?;
    let guard = td.buffer().get_train(&anchors.counter_page, BufferClass::Page)?;
    {
        let mut data = guard.write();
        let off = page::slot_offset(&data, counter_id);
        data[off + COUNTER_NAME_LEN + 4..off + COUNTER_NAME_LEN + 8]
            .copy_from_slice(&limit.to_le_bytes());
        data[off + COUNTER_NAME_LEN..off + COUNTER_NAME_LEN + 4].copy_from_slice(&0u32.to_le_bytes());
    }
    guard.mark_dirty();
    Ok(())
}

// ---- catalog heap ----

const HEAP_DATA_START: usize = PAGE_HEADER_SIZE + 4;

fn heap_entry_len(bytes: &[u8]) -> usize {
    let mut r = StratumReader::new(bytes);
    r.skip(4);
    let len = r.read_u16() as usize;
    6 + len
}

fn heap_page_unique(data: &[u8]) -> u32 {
    u32::from_le_bytes([
        data[PAGE_HEADER_SIZE],
        data[PAGE_HEADER_SIZE + 1],
        data[PAGE_HEADER_SIZE + 2],
        data[PAGE_HEADER_SIZE + 3],
    ])
}

fn set_heap_page_unique(data: &mut [u8], v: u32) {
    data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4].copy_from_slice(&v.to_le_bytes());
}

/// Store a catalog tuple, returning its ObjectId.
fn heap_insert(td: &Thread, vol_no: u16, bytes: &[u8]) -> Result<ObjectId, StratumError> {
    let anchors = anchors(td, vol_no)?;
    let scope = sys_scope(vol_no);
    let mut pid = anchors.heap_first;

    loop {
        let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
        let entry_size = crate::utils::aligned_length(6 + bytes.len());

        let fits = page::total_free(&guard.read(), 1) >= entry_size;
        if fits {
            let (slot, unique) = {
                let mut data = guard.write();
                let unique = heap_page_unique(&data);
                set_heap_page_unique(&mut data, unique + 1);

                let mut w = StratumWriter::new();
                w.write_u32(unique);
                w.write_u16(bytes.len() as u16);
                w.write_bytes(bytes);

                let slot = read_header(&data).n_slots as usize;
                page::insert_entry(&mut data, HEAP_DATA_START, slot, &w.to_bytes(), &heap_entry_len)?;
                (slot, unique)
            };
            guard.mark_dirty();
            return Ok(ObjectId::new(vol_no, pid.page_no, slot as u16, unique));
        }

        let next = read_header(&guard.read()).next;
        if !next.is_nil() {
            pid = next;
            continue;
        }

        // extend the heap chain
        let new_pid = alloc_catalog_page(td, &scope, Some(pid))?;
        {
            let mut data = guard.write();
            let mut hdr = read_header(&data);
            hdr.next = new_pid;
            write_header(&mut data, &hdr);
        }
        guard.mark_dirty();
        pid = new_pid;
    }
}

/// Read a catalog tuple back by its ObjectId.
fn heap_read(td: &Thread, oid: &ObjectId) -> Result<Vec<u8>, StratumError> {
    let pid = PageId::new(oid.vol_no, oid.page_no);
    let guard = td.buffer().get_train(&pid, BufferClass::Page)?;
    let data = guard.read();
    let hdr = read_header(&data);
    if !hdr.is_type(PAGE_TYPE_CATALOG) || oid.slot_no as u16 >= hdr.n_slots {
        return Err(StratumError::new(
            ErrorKind::BadObjectId,
            &format!("no catalog tuple at {}", oid),
        ));
    }
    let off = page::slot_offset(&data, oid.slot_no as usize);
    let mut r = StratumReader::new(&data[off..]);
    let unique = r.read_u32();
    if unique != oid.unique {
        return Err(StratumError::new(
            ErrorKind::BadObjectId,
            &format!("stale unique tag at {}", oid),
        ));
    }
    let len = r.read_u16() as usize;
    Ok(r.read_bytes(len))
}

// ---- files ----

/// Find the next unused file serial.
///
/// Probes the file counter and checks each candidate against SYSFILES.
/// One full counter cycle is tolerated: the first repeated serial arms
/// a flag, the second repeat fails with `FileIdFull`.
pub fn get_new_file_id(td: &Thread, vol_no: u16) -> Result<FileId, StratumError> {
    let anchors = anchors(td, vol_no)?;
    let kdesc = sys_key_desc();
    let cid = get_counter_id(td, vol_no, SYS_SERIAL_FOR_FILE_COUNTER)?;

    let mut tmp_serial: Option<u32> = None;
    let mut break_flag = false;

    loop {
        let serial = get_counter_values(td, vol_no, cid, 1)?;
        let kval = sys_key(vol_no, serial);

        let cursor = btree::fetch(
            td,
            &anchors.sys_files_root,
            &kdesc,
            Some(&kval),
            CompOp::Eq,
            Some(&kval),
            CompOp::Eq,
        )?;

        if !cursor.is_on() {
            return Ok(FileId::new(vol_no, serial));
        } else if tmp_serial.is_none() {
            tmp_serial = Some(serial);
        } else if tmp_serial == Some(serial) {
            if break_flag {
                return Err(StratumError::new(
                    ErrorKind::FileIdFull,
                    &format!("file serial space of volume {} exhausted", vol_no),
                ));
            }
            break_flag = true;
        }
    }
}

/// Record a new object file in the catalog.
pub fn register_file(
    td: &Thread,
    fid: &FileId,
    first_ext: u32,
    fill_factor: u16,
) -> StratumResult {
    let anchors = anchors(td, fid.vol_no)?;

    let mut w = StratumWriter::new();
    w.write_u16(fid.vol_no);
    w.write_u32(fid.serial);
    w.write_u32(first_ext);
    w.write_u16(fill_factor);
    let oid = heap_insert(td, fid.vol_no, &w.to_bytes())?;

    btree::insert(
        td,
        &sys_scope(fid.vol_no),
        &anchors.sys_files_root,
        &sys_key_desc(),
        &sys_key(fid.vol_no, fid.serial),
        &oid,
    )
}

/// The allocation scope recorded for a file at registration.
pub fn file_scope(td: &Thread, fid: &FileId) -> Result<AllocScope, StratumError> {
    let anchors = anchors(td, fid.vol_no)?;
    let cursor = btree::fetch(
        td,
        &anchors.sys_files_root,
        &sys_key_desc(),
        Some(&sys_key(fid.vol_no, fid.serial)),
        CompOp::Eq,
        Some(&sys_key(fid.vol_no, fid.serial)),
        CompOp::Eq,
    )?;
    if !cursor.is_on() {
        return Err(StratumError::new(
            ErrorKind::NotFound,
            &format!("file ({}, {}) not cataloged", fid.vol_no, fid.serial),
        ));
    }
    let tuple = heap_read(td, &cursor.oid)?;
    let mut r = StratumReader::new(&tuple);
    r.skip(6);
    let first_ext = r.read_u32();
    let fill_factor = r.read_u16();
    Ok(AllocScope::new(fid.vol_no, first_ext, fill_factor))
}

// ---- indexes ----

/// Record an index and its root page in the catalog.
pub fn register_index(td: &Thread, iid: &IndexId, root: &PageId) -> StratumResult {
    let anchors = anchors(td, iid.vol_no)?;

    let mut w = StratumWriter::new();
    w.write_u16(iid.vol_no);
    w.write_u32(iid.serial);
    w.write_u32(root.page_no);
    let oid = heap_insert(td, iid.vol_no, &w.to_bytes())?;

    btree::insert(
        td,
        &sys_scope(iid.vol_no),
        &anchors.sys_indexes_root,
        &sys_key_desc(),
        &sys_key(iid.vol_no, iid.serial),
        &oid,
    )
}

/// Allocate an unused index serial from the index counter.
pub fn get_new_index_id(td: &Thread, vol_no: u16) -> Result<IndexId, StratumError> {
    let anchors = anchors(td, vol_no)?;
    let kdesc = sys_key_desc();
    let cid = get_counter_id(td, vol_no, SYS_SERIAL_FOR_INDEX_COUNTER)?;

    let mut tmp_serial: Option<u32> = None;
    let mut break_flag = false;

    loop {
        let serial = get_counter_values(td, vol_no, cid, 1)?;
        let kval = sys_key(vol_no, serial);
        let cursor = btree::fetch(
            td,
            &anchors.sys_indexes_root,
            &kdesc,
            Some(&kval),
            CompOp::Eq,
            Some(&kval),
            CompOp::Eq,
        )?;
        if !cursor.is_on() {
            return Ok(IndexId::new(vol_no, serial));
        } else if tmp_serial.is_none() {
            tmp_serial = Some(serial);
        } else if tmp_serial == Some(serial) {
            if break_flag {
                return Err(StratumError::new(
                    ErrorKind::FileIdFull,
                    &format!("index serial space of volume {} exhausted", vol_no),
                ));
            }
            break_flag = true;
        }
    }
}

/// Resolve an IndexId to its catalog entry, and optionally to the
/// physical index id derived from the stored root page. Temporary
/// indexes bypass the catalog through the in-memory table.
pub fn get_catalog_entry_from_index_id(
    td: &Thread,
    iid: &IndexId,
    want_physical: bool,
) -> Result<(ObjectId, Option<PhysicalIndexId>), StratumError> {
    let anchors = anchors(td, iid.vol_no)?;
    let kval = sys_key(iid.vol_no, iid.serial);

    let cursor = btree::fetch(
        td,
        &anchors.sys_indexes_root,
        &sys_key_desc(),
        Some(&kval),
        CompOp::Eq,
        Some(&kval),
        CompOp::Eq,
    )?;

    if cursor.is_on() {
        let catalog_entry = cursor.oid;
        let physical = if want_physical {
            let tuple = heap_read(td, &catalog_entry)?;
            let mut r = StratumReader::new(&tuple);
            r.skip(6);
            let root_page = r.read_u32();
            Some(PhysicalIndexId::new(iid.vol_no, root_page))
        } else {
            None
        };
        return Ok((catalog_entry, physical));
    }

    // not cataloged: maybe an index on a temporary file
    let temps = td.process().temp_indexes().rl();
    for entry in temps.iter() {
        if entry.iid == *iid {
            let catalog_entry = ObjectId::new(iid.vol_no, u32::MAX, u16::MAX, 0);
            let physical = if want_physical {
                Some(PhysicalIndexId::new(iid.vol_no, entry.root_page))
            } else {
                None
            };
            return Ok((catalog_entry, physical));
        }
    }

    Err(StratumError::new(
        ErrorKind::BadIndexId,
        &format!("index ({}, {}) unknown", iid.vol_no, iid.serial),
    ))
}

/// Register a temporary index, visible only through the in-memory
/// table.
pub fn add_temp_index(td: &Thread, iid: &IndexId, root: &PageId) {
    td.process().temp_indexes().wl().push(TempIndexEntry {
        iid: *iid,
        root_page: root.page_no,
    });
}

pub fn drop_temp_index(td: &Thread, iid: &IndexId) {
    td.process().temp_indexes().wl().retain(|e| e.iid != *iid);
}
