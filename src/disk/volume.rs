use std::sync::{Arc, Mutex, RwLock};

use bit_vec::BitVec;
use log::{debug, info};

use crate::{
    error::{ErrorKind, StratumError},
    ids::PageId,
    io::{DeviceFile, StratumReader, StratumWriter},
    types::StratumResult,
    utils::HandyRwLock,
};

use super::{alloc::AllocMap, page_size, valid_train_size};

pub const MAX_NUM_VOLS: usize = 32;

pub const VOLUME_MAGIC_DATA: u32 = 0x4D52_5453; // "STRM"
pub const VOLUME_MAGIC_LOG: u32 = 0x474C_5453; // "STLG"

pub const VOLUME_TITLE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolumeKind {
    Data,
    Log,
}

/// Decoded device header page. Device 0 additionally carries the
/// catalog anchors (data volumes) or the log allocation cursors (log
/// volumes).
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub magic: u32,
    pub vol_id: u32,
    pub extent_size: u16,
    pub num_devices: u16,
    pub device_index: u16,
    pub num_extents: u32,
    pub pages_in_device: u32,
    pub first_page_no: u32,
    pub title: String,

    // catalog anchors, data volumes only
    pub sys_files_root: u32,
    pub sys_indexes_root: u32,
    pub counter_page: u32,
    pub catalog_heap_first: u32,

    // allocation cursors, log volumes only
    pub page_cursor: u32,
    pub train_cursor: u32,
}

pub const NO_PAGE: u32 = u32::MAX;

impl VolumeHeader {
    pub fn kind(&self) -> Result<VolumeKind, StratumError> {
        match self.magic {
            VOLUME_MAGIC_DATA => Ok(VolumeKind::Data),
            VOLUME_MAGIC_LOG => Ok(VolumeKind::Log),
            _ => Err(StratumError::new(
                ErrorKind::BadVolumeHeader,
                &format!("unknown magic {:#x}", self.magic),
            )),
        }
    }

    pub fn encode(&self, page: &mut [u8]) {
        let mut w = StratumWriter::new();
        w.write_u32(self.magic);

        let mut title = self.title.as_bytes().to_vec();
        title.resize(VOLUME_TITLE_LEN, 0);
        w.write_bytes(&title);

        w.write_u32(self.vol_id);
        w.write_u16(self.extent_size);
        w.write_u32(self.num_extents);
        w.write_u16(self.num_devices);
        w.write_u16(self.device_index);
        w.write_u32(self.pages_in_device);
        w.write_u32(self.first_page_no);

        w.write_u32(self.sys_files_root);
        w.write_u32(self.sys_indexes_root);
        w.write_u32(self.counter_page);
        w.write_u32(self.catalog_heap_first);
        w.write_u32(self.page_cursor);
        w.write_u32(self.train_cursor);

        let bytes = w.to_padded_bytes(page.len());
        page.copy_from_slice(&bytes);
    }

    pub fn decode(page: &[u8]) -> Self {
        let mut r = StratumReader::new(page);
        let magic = r.read_u32();
        let title_bytes = r.read_bytes(VOLUME_TITLE_LEN);
        let title = String::from_utf8_lossy(&title_bytes)
            .trim_end_matches('\0')
            .to_string();
        let vol_id = r.read_u32();
        let extent_size = r.read_u16();
        let num_extents = r.read_u32();
        let num_devices = r.read_u16();
        let device_index = r.read_u16();
        let pages_in_device = r.read_u32();
        let first_page_no = r.read_u32();
        Self {
            magic,
            vol_id,
            extent_size,
            num_devices,
            device_index,
            num_extents,
            pages_in_device,
            first_page_no,
            title,
            sys_files_root: r.read_u32(),
            sys_indexes_root: r.read_u32(),
            counter_page: r.read_u32(),
            catalog_heap_first: r.read_u32(),
            page_cursor: r.read_u32(),
            train_cursor: r.read_u32(),
        }
    }
}

struct Device {
    file: DeviceFile,
    pages_in_device: u32,
    first_page_no: u32,
    bitmap_pages: u32,
}

impl Device {
    /// Byte offset of the local data page `local` inside this device
    /// file: header page, bitmap pages, then the data region.
    fn data_offset(&self, local: u32) -> u64 {
        (1 + self.bitmap_pages as u64 + local as u64) * page_size() as u64
    }
}

pub struct Volume {
    vol_no: u16,
    title: String,
    extent_size: u16,
    num_extents: u32,
    num_pages: u32,
    kind: VolumeKind,
    devices: Vec<Device>,

    /// The page-alloc-dealloc latch: held exclusive across every
    /// allocation and free on this volume.
    alloc: Mutex<AllocMap>,

    n_mounts: Mutex<u32>,
}

impl Volume {
    pub fn vol_no(&self) -> u16 {
        self.vol_no
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn extent_size(&self) -> u16 {
        self.extent_size
    }

    pub fn kind(&self) -> VolumeKind {
        self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    fn device_of(&self, page_no: u32) -> Result<(&Device, u32), StratumError> {
        for dev in &self.devices {
            if page_no >= dev.first_page_no && page_no < dev.first_page_no + dev.pages_in_device {
                return Ok((dev, page_no - dev.first_page_no));
            }
        }
        Err(StratumError::new(
            ErrorKind::BadPageId(PageId::new(self.vol_no, page_no)),
            "page beyond volume",
        ))
    }

    fn check_train(&self, pid: &PageId, train_size: usize) -> StratumResult {
        if !valid_train_size(train_size) {
            return Err(StratumError::new(
                ErrorKind::InvalidTrainSize(train_size),
                "train size must be 1 or TRAIN_PAGES",
            ));
        }
        if pid.page_no as u64 + train_size as u64 > self.num_pages as u64 {
            return Err(StratumError::new(
                ErrorKind::BadPageId(*pid),
                "train beyond volume",
            ));
        }
        Ok(())
    }

    pub fn read_train(&self, pid: &PageId, buf: &mut [u8], train_size: usize) -> StratumResult {
        self.check_train(pid, train_size)?;
        if buf.len() != train_size * page_size() {
            return Err(StratumError::new(ErrorKind::BadParameter, "buffer size"));
        }
        let (dev, local) = self.device_of(pid.page_no)?;
        dev.file.read_at(dev.data_offset(local), buf)
    }

    pub fn write_train(&self, pid: &PageId, buf: &[u8], train_size: usize) -> StratumResult {
        self.check_train(pid, train_size)?;
        if buf.len() != train_size * page_size() {
            return Err(StratumError::new(ErrorKind::BadParameter, "buffer size"));
        }
        let (dev, local) = self.device_of(pid.page_no)?;
        dev.file.write_at(dev.data_offset(local), buf)
    }

    /// Rewrite the on-disk free-page bitmap of every device. Called
    /// under the alloc latch after each allocation or free so the disk
    /// copy stays authoritative.
    fn persist_alloc(&self, map: &AllocMap) -> StratumResult {
        for dev in &self.devices {
            let mut bits = BitVec::from_elem(dev.pages_in_device as usize, false);
            for i in 0..dev.pages_in_device {
                bits.set(i as usize, map.is_free(dev.first_page_no + i));
            }
            let mut region = bits.to_bytes();
            region.resize(dev.bitmap_pages as usize * page_size(), 0);
            dev.file.write_at(page_size() as u64, &region)?;
        }
        Ok(())
    }

    pub fn alloc_trains(
        &self,
        first_ext: u32,
        near: Option<PageId>,
        fill_factor: u16,
        count: usize,
        train_size: usize,
    ) -> Result<Vec<PageId>, StratumError> {
        if !valid_train_size(train_size) {
            return Err(StratumError::new(
                ErrorKind::InvalidTrainSize(train_size),
                "train size must be 1 or TRAIN_PAGES",
            ));
        }
        let near = near.filter(|p| p.vol_no == self.vol_no).map(|p| p.page_no);

        let mut map = self.alloc.lock().unwrap();
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            match map.alloc_one(first_ext, near, fill_factor, train_size) {
                Ok(page_no) => out.push(PageId::new(self.vol_no, page_no)),
                Err(e) => {
                    // roll the partial allocation back before failing
                    for pid in &out {
                        map.free_run(pid.page_no, train_size).ok();
                    }
                    return Err(e);
                }
            }
        }
        self.persist_alloc(&map)?;
        Ok(out)
    }

    pub fn free_trains(&self, pids: &[PageId], train_size: usize) -> StratumResult {
        if !valid_train_size(train_size) {
            return Err(StratumError::new(
                ErrorKind::InvalidTrainSize(train_size),
                "train size must be 1 or TRAIN_PAGES",
            ));
        }
        let mut map = self.alloc.lock().unwrap();
        for pid in pids {
            map.free_run(pid.page_no, train_size)?;
        }
        self.persist_alloc(&map)
    }

    pub fn free_page_count(&self) -> u32 {
        self.alloc.lock().unwrap().free_page_count()
    }

    pub fn page_id_to_ext_no(&self, pid: &PageId) -> Result<u32, StratumError> {
        if pid.page_no >= self.num_pages {
            return Err(StratumError::new(
                ErrorKind::BadPageId(*pid),
                "page beyond volume",
            ));
        }
        Ok(pid.page_no / self.extent_size as u32)
    }

    pub fn read_header(&self) -> Result<VolumeHeader, StratumError> {
        let mut buf = vec![0u8; page_size()];
        self.devices[0].file.read_at(0, &mut buf)?;
        Ok(VolumeHeader::decode(&buf))
    }

    pub fn write_header(&self, hdr: &VolumeHeader) -> StratumResult {
        let mut buf = vec![0u8; page_size()];
        hdr.encode(&mut buf);
        self.devices[0].file.write_at(0, &buf)
    }
}

fn bitmap_pages_for(pages_in_device: u32) -> u32 {
    let bytes = (pages_in_device as usize + 7) / 8;
    ((bytes + page_size() - 1) / page_size()) as u32
}

/// The volume table: MAX_NUM_VOLS slots behind one latch. Read/write
/// paths hold an `Arc` to the volume and run without the table latch.
pub struct DiskManager {
    volumes: RwLock<Vec<Option<Arc<Volume>>>>,
}

impl DiskManager {
    pub fn new() -> Self {
        Self {
            volumes: RwLock::new((0..MAX_NUM_VOLS).map(|_| None).collect()),
        }
    }

    /// Format devices into a volume. Pages per device round down to
    /// whole extents.
    pub fn format(
        &self,
        dev_paths: &[&str],
        title: &str,
        vol_id: u16,
        extent_size: u16,
        pages_per_device: &[u32],
        kind: VolumeKind,
    ) -> StratumResult {
        if dev_paths.is_empty()
            || dev_paths.len() != pages_per_device.len()
            || extent_size == 0
            || title.len() > VOLUME_TITLE_LEN
        {
            return Err(StratumError::new(ErrorKind::BadParameter, "format"));
        }

        info!(
            "format volume {}: {} device(s), extent size {}",
            vol_id,
            dev_paths.len(),
            extent_size
        );

        let magic = match kind {
            VolumeKind::Data => VOLUME_MAGIC_DATA,
            VolumeKind::Log => VOLUME_MAGIC_LOG,
        };

        let rounded: Vec<u32> = pages_per_device
            .iter()
            .map(|&n| n / extent_size as u32 * extent_size as u32)
            .collect();
        let num_extents: u32 = rounded.iter().map(|&n| n / extent_size as u32).sum();
        if num_extents == 0 {
            return Err(StratumError::new(
                ErrorKind::BadParameter,
                "volume smaller than one extent",
            ));
        }

        let mut first_page_no = 0u32;
        for (i, (&path, &pages)) in dev_paths.iter().zip(rounded.iter()).enumerate() {
            let file = DeviceFile::open(path)?;
            let bitmap_pages = bitmap_pages_for(pages);

            let mut hdr_page = vec![0u8; page_size()];
            VolumeHeader {
                magic,
                vol_id: vol_id as u32,
                extent_size,
                num_devices: dev_paths.len() as u16,
                device_index: i as u16,
                num_extents,
                pages_in_device: pages,
                first_page_no,
                title: title.to_string(),
                sys_files_root: NO_PAGE,
                sys_indexes_root: NO_PAGE,
                counter_page: NO_PAGE,
                catalog_heap_first: NO_PAGE,
                page_cursor: 0,
                train_cursor: 0,
            }
            .encode(&mut hdr_page);
            file.write_at(0, &hdr_page)?;

            // all pages free
            let mut region = BitVec::from_elem(pages as usize, true).to_bytes();
            region.resize(bitmap_pages as usize * page_size(), 0);
            file.write_at(page_size() as u64, &region)?;

            file.set_len((1 + bitmap_pages as u64 + pages as u64) * page_size() as u64)?;
            file.sync()?;

            first_page_no += pages;
        }
        Ok(())
    }

    /// Mount a volume from its device paths. Returns the volume id.
    /// Mounting an already-mounted volume bumps its mount count.
    pub fn mount(&self, dev_paths: &[&str]) -> Result<u16, StratumError> {
        if dev_paths.is_empty() {
            return Err(StratumError::new(ErrorKind::BadParameter, "mount"));
        }

        // read and sanity-check every device header
        let mut files = Vec::new();
        let mut headers = Vec::new();
        for path in dev_paths {
            let file = DeviceFile::open(path)?;
            let mut buf = vec![0u8; page_size()];
            file.read_at(0, &mut buf)?;
            let hdr = VolumeHeader::decode(&buf);
            hdr.kind()?;
            files.push(file);
            headers.push(hdr);
        }
        let first = headers[0].clone();
        if headers.len() != first.num_devices as usize {
            return Err(StratumError::new(
                ErrorKind::BadVolumeHeader,
                "device count mismatch",
            ));
        }
        for (i, hdr) in headers.iter().enumerate() {
            if hdr.vol_id != first.vol_id || hdr.device_index != i as u16 {
                return Err(StratumError::new(
                    ErrorKind::BadVolumeHeader,
                    "devices out of order",
                ));
            }
        }

        let vol_no = first.vol_id as u16;
        let mut table = self.volumes.wl();

        // remount: same volume already in the table
        for slot in table.iter() {
            if let Some(vol) = slot {
                if vol.vol_no == vol_no {
                    *vol.n_mounts.lock().unwrap() += 1;
                    return Ok(vol_no);
                }
            }
        }

        let mut devices = Vec::new();
        let num_pages: u32 = headers.iter().map(|h| h.pages_in_device).sum();
        let mut map = AllocMap::new_all_free(num_pages, first.extent_size, first.num_extents);
        for (file, hdr) in files.into_iter().zip(headers.iter()) {
            let bitmap_pages = bitmap_pages_for(hdr.pages_in_device);
            let mut region = vec![0u8; bitmap_pages as usize * page_size()];
            file.read_at(page_size() as u64, &mut region)?;
            let bits = BitVec::from_bytes(&region);
            // the on-disk bitmap is authoritative
            for i in 0..hdr.pages_in_device {
                if !bits.get(i as usize).unwrap_or(false) {
                    map.mark_used(hdr.first_page_no + i);
                }
            }
            devices.push(Device {
                file,
                pages_in_device: hdr.pages_in_device,
                first_page_no: hdr.first_page_no,
                bitmap_pages,
            });
        }

        let volume = Arc::new(Volume {
            vol_no,
            title: first.title.clone(),
            extent_size: first.extent_size,
            num_extents: first.num_extents,
            num_pages,
            kind: first.kind()?,
            devices,
            alloc: Mutex::new(map),
            n_mounts: Mutex::new(1),
        });

        let slot = table
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or_else(|| StratumError::new(ErrorKind::VolumeTableFull, "mount"))?;
        *slot = Some(volume);

        debug!("mounted volume {} ({} pages)", vol_no, num_pages);
        Ok(vol_no)
    }

    pub fn dismount(&self, vol_no: u16) -> StratumResult {
        let mut table = self.volumes.wl();
        for slot in table.iter_mut() {
            let matched = match slot {
                Some(vol) => vol.vol_no == vol_no,
                None => false,
            };
            if matched {
                let vol = slot.as_ref().unwrap();
                let mut n = vol.n_mounts.lock().unwrap();
                *n -= 1;
                if *n == 0 {
                    let map = vol.alloc.lock().unwrap();
                    vol.persist_alloc(&map)?;
                    drop(map);
                    drop(n);
                    *slot = None;
                }
                return Ok(());
            }
        }
        Err(StratumError::new(
            ErrorKind::VolumeNotMounted(vol_no),
            "dismount",
        ))
    }

    pub fn volume(&self, vol_no: u16) -> Result<Arc<Volume>, StratumError> {
        let table = self.volumes.rl();
        for slot in table.iter() {
            if let Some(vol) = slot {
                if vol.vol_no == vol_no {
                    return Ok(vol.clone());
                }
            }
        }
        Err(StratumError::new(
            ErrorKind::VolumeNotMounted(vol_no),
            "volume lookup",
        ))
    }

    pub fn alloc_trains(
        &self,
        vol_no: u16,
        first_ext: u32,
        near: Option<PageId>,
        fill_factor: u16,
        count: usize,
        train_size: usize,
    ) -> Result<Vec<PageId>, StratumError> {
        self.volume(vol_no)?
            .alloc_trains(first_ext, near, fill_factor, count, train_size)
    }

    pub fn free_trains(&self, vol_no: u16, pids: &[PageId], train_size: usize) -> StratumResult {
        self.volume(vol_no)?.free_trains(pids, train_size)
    }

    pub fn read_train(&self, pid: &PageId, buf: &mut [u8], train_size: usize) -> StratumResult {
        self.volume(pid.vol_no)?.read_train(pid, buf, train_size)
    }

    pub fn write_train(&self, pid: &PageId, buf: &[u8], train_size: usize) -> StratumResult {
        let vol = self.volume(pid.vol_no)?;
        if vol.kind() != VolumeKind::Data {
            return Err(StratumError::new(
                ErrorKind::BadParameter,
                "write_train targets a data volume",
            ));
        }
        vol.write_train(pid, buf, train_size)
    }

    /// Identical I/O to `write_train`, against a volume carrying log
    /// semantics.
    pub fn write_train_for_log_volume(
        &self,
        pid: &PageId,
        buf: &[u8],
        train_size: usize,
    ) -> StratumResult {
        let vol = self.volume(pid.vol_no)?;
        if vol.kind() != VolumeKind::Log {
            return Err(StratumError::new(
                ErrorKind::BadParameter,
                "write_train_for_log_volume targets a log volume",
            ));
        }
        vol.write_train(pid, buf, train_size)
    }

    pub fn page_id_to_ext_no(&self, pid: &PageId) -> Result<u32, StratumError> {
        self.volume(pid.vol_no)?.page_id_to_ext_no(pid)
    }

    pub fn free_page_count(&self, vol_no: u16) -> Result<u32, StratumError> {
        Ok(self.volume(vol_no)?.free_page_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_header_round_trip() {
        let hdr = VolumeHeader {
            magic: VOLUME_MAGIC_DATA,
            vol_id: 7,
            extent_size: 16,
            num_devices: 2,
            device_index: 1,
            num_extents: 64,
            pages_in_device: 512,
            first_page_no: 512,
            title: "a data volume".to_string(),
            sys_files_root: 3,
            sys_indexes_root: 4,
            counter_page: 5,
            catalog_heap_first: 6,
            page_cursor: 0,
            train_cursor: 0,
        };

        let mut page = vec![0u8; 4096];
        hdr.encode(&mut page);
        let back = VolumeHeader::decode(&page);

        assert_eq!(back.magic, hdr.magic);
        assert_eq!(back.kind().unwrap(), VolumeKind::Data);
        assert_eq!(back.title, hdr.title);
        assert_eq!(back.vol_id, hdr.vol_id);
        assert_eq!(back.num_extents, hdr.num_extents);
        assert_eq!(back.first_page_no, hdr.first_page_no);
        assert_eq!(back.sys_indexes_root, hdr.sys_indexes_root);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut page = vec![0u8; 4096];
        page[0] = 0x12;
        let hdr = VolumeHeader::decode(&page);
        assert!(hdr.kind().is_err());
    }

    #[test]
    fn test_bitmap_region_size() {
        assert_eq!(bitmap_pages_for(8), 1);
        assert_eq!(bitmap_pages_for(4096 * 8), 1);
        assert_eq!(bitmap_pages_for(4096 * 8 + 1), 2);
    }
}
