//! Redo-only recovery: a log volume mirroring page images, plus the
//! redo handlers that reapply logged operations to pages.

pub mod redo;

use std::collections::HashMap;

use log::{debug, info};

use crate::{
    disk::{page_size, VolumeKind, TRAIN_PAGES},
    error::{ErrorKind, StratumError},
    ids::PageId,
    process::Thread,
    types::StratumResult,
    utils::HandyRwLock,
};

/// Allocation state of an open log volume. Page-sized saves grow from
/// the low end, train-sized saves from the high end; the cursors
/// crossing means the volume is full.
#[derive(Debug, Clone, Copy)]
pub struct LogVolumeInfo {
    pub vol_no: u16,
    pub num_pages: u32,
    pub page_cursor: u32,
    pub train_cursor: u32,
}

impl LogVolumeInfo {
    fn fresh(vol_no: u16, num_pages: u32) -> Self {
        Self {
            vol_no,
            num_pages,
            page_cursor: 0,
            train_cursor: (num_pages - TRAIN_PAGES as u32) / TRAIN_PAGES as u32
                * TRAIN_PAGES as u32,
        }
    }

    pub fn free_pages(&self) -> u32 {
        (self.train_cursor + TRAIN_PAGES as u32).saturating_sub(self.page_cursor)
    }
}

/// The save table: data train id to the log page it mirrors into.
/// Lives only for the duration of a recovery run.
pub struct LogState {
    pub info: LogVolumeInfo,
    table: HashMap<PageId, u32>,
}

/// Format a log volume: the raw-disk format path, then the log
/// allocation cursors, then a clean dismount.
pub fn format_log_volume(
    td: &Thread,
    dev_paths: &[&str],
    title: &str,
    vol_id: u16,
    extent_size: u16,
    pages_per_device: &[u32],
) -> StratumResult {
    if dev_paths.is_empty() || pages_per_device.len() != dev_paths.len() || extent_size == 0 {
        return Err(StratumError::new(ErrorKind::BadParameter, "format_log_volume"));
    }
    for &n in pages_per_device {
        if (n / extent_size as u32 * extent_size as u32) < TRAIN_PAGES as u32 {
            return Err(StratumError::new(
                ErrorKind::BadParameter,
                "log device smaller than one train",
            ));
        }
    }

    info!("format log volume {}", vol_id);
    td.disk()
        .format(dev_paths, title, vol_id, extent_size, pages_per_device, VolumeKind::Log)?;
    let vol_no = td.disk().mount(dev_paths)?;

    let vol = td.disk().volume(vol_no)?;
    let mut hdr = vol.read_header()?;
    let info = LogVolumeInfo::fresh(vol_no, vol.num_pages());
    hdr.page_cursor = info.page_cursor;
    hdr.train_cursor = info.train_cursor;
    vol.write_header(&hdr)?;

    td.buffer().dismount(vol_no)?;
    td.disk().dismount(vol_no)
}

/// Load a mounted log volume's cursors and start a recovery run with
/// an empty save table.
pub fn open_log_volume(td: &Thread, vol_no: u16) -> StratumResult {
    let vol = td.disk().volume(vol_no)?;
    if vol.kind() != VolumeKind::Log {
        return Err(StratumError::new(
            ErrorKind::BadParameter,
            &format!("volume {} is not a log volume", vol_no),
        ));
    }
    let hdr = vol.read_header()?;
    let info = LogVolumeInfo {
        vol_no,
        num_pages: vol.num_pages(),
        page_cursor: hdr.page_cursor,
        train_cursor: hdr.train_cursor,
    };
    debug!(
        "open log volume {}: cursors ({}, {})",
        vol_no, info.page_cursor, info.train_cursor
    );
    *td.process().log_state().wl() = Some(LogState {
        info,
        table: HashMap::new(),
    });
    Ok(())
}

/// Persist the allocation cursors and drop the save table.
pub fn close_log_volume(td: &Thread) -> StratumResult {
    let mut slot = td.process().log_state().wl();
    let state = slot.take().ok_or_else(|| {
        StratumError::new(ErrorKind::BadParameter, "no log volume open")
    })?;

    let vol = td.disk().volume(state.info.vol_no)?;
    let mut hdr = vol.read_header()?;
    hdr.page_cursor = state.info.page_cursor;
    hdr.train_cursor = state.info.train_cursor;
    vol.write_header(&hdr)
}

/// Save a data page/train image into the log volume.
///
/// The first save of a train allocates a log page at the end matching
/// its size and installs the mapping; later saves overwrite in place.
pub fn save_train(
    td: &Thread,
    train_id: &PageId,
    buf: &[u8],
    size_of_train: usize,
) -> StratumResult {
    if size_of_train != 1 && size_of_train != TRAIN_PAGES {
        return Err(StratumError::new(
            ErrorKind::InvalidTrainSize(size_of_train),
            "save_train",
        ));
    }
    if buf.len() != size_of_train * page_size() {
        return Err(StratumError::new(ErrorKind::BadParameter, "save_train buffer"));
    }

    let mut slot = td.process().log_state().wl();
    let state = slot.as_mut().ok_or_else(|| {
        StratumError::new(ErrorKind::BadParameter, "no log volume open")
    })?;

    let log_page_no = match state.table.get(train_id).copied() {
        Some(mapped) => mapped,
        None => {
            if (state.info.free_pages() as usize) < size_of_train {
                return Err(StratumError::new(
                    ErrorKind::LogVolumeFull,
                    &format!("saving {}", train_id),
                ));
            }
            let no = if size_of_train == 1 {
                let no = state.info.page_cursor;
                state.info.page_cursor += size_of_train as u32;
                no
            } else {
                let no = state.info.train_cursor;
                state.info.train_cursor -= size_of_train as u32;
                no
            };
            state.table.insert(*train_id, no);
            no
        }
    };

    let pid = PageId::new(state.info.vol_no, log_page_no);
    debug!("save_train {} -> log page {}", train_id, log_page_no);
    td.disk()
        .write_train_for_log_volume(&pid, buf, size_of_train)
}

/// The log page a train is mapped to, if it was saved this run.
pub fn saved_location(td: &Thread, train_id: &PageId) -> Option<u32> {
    let slot = td.process().log_state().rl();
    slot.as_ref().and_then(|s| s.table.get(train_id).copied())
}

/// Current (page, train) allocation cursors of the open log volume.
pub fn log_cursors(td: &Thread) -> Option<(u32, u32)> {
    let slot = td.process().log_state().rl();
    slot.as_ref()
        .map(|s| (s.info.page_cursor, s.info.train_cursor))
}
