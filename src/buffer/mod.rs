//! Buffer manager: fixed frame pools over the raw disk manager.
//!
//! Two pools, one per train size class, mirror the disk manager's two
//! I/O units. A faulted frame stays resident while pinned; pins are
//! RAII guards so every exit path, error paths included, unpins.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use log::debug;

use crate::{
    disk::{page_size, DiskManager, TRAIN_PAGES},
    error::{ErrorKind, StratumError},
    ids::PageId,
    types::StratumResult,
};

/// Which frame pool a page lives in (the PAGE_BUF / TRAIN_BUF split).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferClass {
    Page,
    Train,
}

impl BufferClass {
    pub fn npages(&self) -> usize {
        match self {
            BufferClass::Page => 1,
            BufferClass::Train => TRAIN_PAGES,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    pub page_frames: usize,
    pub train_frames: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            page_frames: 1024,
            train_frames: 64,
        }
    }
}

#[derive(Debug)]
struct FrameState {
    pid: Option<PageId>,
    pin_count: u32,
    dirty: bool,
    refbit: bool,
}

#[derive(Debug)]
struct Frame {
    state: Mutex<FrameState>,
    data: RwLock<Vec<u8>>,
}

struct PoolTable {
    index: HashMap<PageId, usize>,
    hand: usize,
}

struct FramePool {
    disk: Arc<DiskManager>,
    npages: usize,
    frames: Vec<Arc<Frame>>,
    table: Mutex<PoolTable>,
}

impl FramePool {
    fn new(disk: Arc<DiskManager>, nframes: usize, npages: usize) -> Self {
        let frames = (0..nframes)
            .map(|_| {
                Arc::new(Frame {
                    state: Mutex::new(FrameState {
                        pid: None,
                        pin_count: 0,
                        dirty: false,
                        refbit: false,
                    }),
                    data: RwLock::new(Vec::new()),
                })
            })
            .collect();
        Self {
            disk,
            npages,
            frames,
            table: Mutex::new(PoolTable {
                index: HashMap::new(),
                hand: 0,
            }),
        }
    }

    fn frame_bytes(&self) -> usize {
        self.npages * page_size()
    }

    /// CLOCK sweep over unpinned frames. Runs under the table latch.
    fn pick_victim(&self, table: &mut PoolTable) -> Result<usize, StratumError> {
        let n = self.frames.len();
        for _ in 0..2 * n {
            let slot = table.hand;
            table.hand = (table.hand + 1) % n;

            let mut state = self.frames[slot].state.lock().unwrap();
            if state.pin_count > 0 {
                continue;
            }
            if state.refbit {
                state.refbit = false;
                continue;
            }
            return Ok(slot);
        }
        Err(StratumError::new(
            ErrorKind::Internal,
            "buffer pool exhausted: every frame is pinned",
        ))
    }

    fn get(&self, pid: &PageId, read_from_disk: bool) -> Result<FrameGuard, StratumError> {
        let mut table = self.table.lock().unwrap();

        if let Some(&slot) = table.index.get(pid) {
            let frame = &self.frames[slot];
            let mut state = frame.state.lock().unwrap();
            state.pin_count += 1;
            state.refbit = true;
            return Ok(FrameGuard {
                frame: frame.clone(),
                pid: *pid,
                npages: self.npages,
            });
        }

        let slot = self.pick_victim(&mut table)?;
        let frame = self.frames[slot].clone();
        {
            let mut state = frame.state.lock().unwrap();
            if let Some(old) = state.pid.take() {
                if state.dirty {
                    let data = frame.data.read().unwrap();
                    self.disk.write_train(&old, &data, self.npages)?;
                }
                table.index.remove(&old);
            }

            let mut data = frame.data.write().unwrap();
            data.clear();
            data.resize(self.frame_bytes(), 0);
            if read_from_disk {
                self.disk.read_train(pid, &mut data, self.npages)?;
            }

            state.pid = Some(*pid);
            state.pin_count = 1;
            state.dirty = false;
            state.refbit = true;
        }
        table.index.insert(*pid, slot);

        Ok(FrameGuard {
            frame,
            pid: *pid,
            npages: self.npages,
        })
    }

    fn set_dirty(&self, pid: &PageId) -> StratumResult {
        let table = self.table.lock().unwrap();
        let slot = table.index.get(pid).ok_or_else(|| {
            StratumError::new(ErrorKind::Internal, &format!("set_dirty: {} not resident", pid))
        })?;
        let mut state = self.frames[*slot].state.lock().unwrap();
        if state.pin_count == 0 {
            return Err(StratumError::new(
                ErrorKind::Internal,
                &format!("set_dirty on unpinned frame {}", pid),
            ));
        }
        state.dirty = true;
        Ok(())
    }

    fn flush(&self, pid: &PageId) -> StratumResult {
        let table = self.table.lock().unwrap();
        if let Some(&slot) = table.index.get(pid) {
            let frame = &self.frames[slot];
            let mut state = frame.state.lock().unwrap();
            if state.dirty {
                let data = frame.data.read().unwrap();
                self.disk.write_train(pid, &data, self.npages)?;
                state.dirty = false;
            }
        }
        Ok(())
    }

    fn flush_all(&self) -> StratumResult {
        let table = self.table.lock().unwrap();
        for (&pid, &slot) in table.index.iter() {
            let frame = &self.frames[slot];
            let mut state = frame.state.lock().unwrap();
            if state.dirty {
                let data = frame.data.read().unwrap();
                self.disk.write_train(&pid, &data, self.npages)?;
                state.dirty = false;
            }
        }
        Ok(())
    }

    /// Drop every frame of `vol_no`, flushing dirty ones. A frame
    /// still pinned is a pin leak in the caller.
    fn dismount(&self, vol_no: u16) -> StratumResult {
        let mut table = self.table.lock().unwrap();
        let victims: Vec<(PageId, usize)> = table
            .index
            .iter()
            .filter(|(pid, _)| pid.vol_no == vol_no)
            .map(|(pid, slot)| (*pid, *slot))
            .collect();

        for (pid, slot) in victims {
            let frame = &self.frames[slot];
            let mut state = frame.state.lock().unwrap();
            if state.pin_count > 0 {
                return Err(StratumError::new(
                    ErrorKind::Internal,
                    &format!("pin leak: {} still pinned at dismount", pid),
                ));
            }
            if state.dirty {
                let data = frame.data.read().unwrap();
                self.disk.write_train(&pid, &data, self.npages)?;
            }
            state.pid = None;
            state.dirty = false;
            state.refbit = false;
            table.index.remove(&pid);
        }
        Ok(())
    }

    /// Drop a frame without writing it back. Used when the page is
    /// being freed and its content is dead.
    fn discard(&self, pid: &PageId) -> StratumResult {
        let mut table = self.table.lock().unwrap();
        if let Some(&slot) = table.index.get(pid) {
            let mut state = self.frames[slot].state.lock().unwrap();
            if state.pin_count > 0 {
                return Err(StratumError::new(
                    ErrorKind::Internal,
                    &format!("discard of pinned frame {}", pid),
                ));
            }
            state.pid = None;
            state.dirty = false;
            state.refbit = false;
            table.index.remove(pid);
        }
        Ok(())
    }

    fn pinned_frames(&self) -> usize {
        let _table = self.table.lock().unwrap();
        self.frames
            .iter()
            .filter(|f| f.state.lock().unwrap().pin_count > 0)
            .count()
    }
}

/// A pinned frame. Dropping the guard unpins; the frame stays
/// resident (and dirty, if marked) for later write-back.
#[derive(Debug)]
pub struct FrameGuard {
    frame: Arc<Frame>,
    pid: PageId,
    npages: usize,
}

impl FrameGuard {
    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.frame.data.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.frame.data.write().unwrap()
    }

    pub fn mark_dirty(&self) {
        self.frame.state.lock().unwrap().dirty = true;
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let mut state = self.frame.state.lock().unwrap();
        debug_assert!(state.pin_count > 0);
        state.pin_count -= 1;
    }
}

pub struct BufferPool {
    page_pool: FramePool,
    train_pool: FramePool,
}

impl BufferPool {
    pub fn new(disk: Arc<DiskManager>, config: BufferConfig) -> Self {
        Self {
            page_pool: FramePool::new(disk.clone(), config.page_frames, 1),
            train_pool: FramePool::new(disk, config.train_frames, TRAIN_PAGES),
        }
    }

    fn pool(&self, class: BufferClass) -> &FramePool {
        match class {
            BufferClass::Page => &self.page_pool,
            BufferClass::Train => &self.train_pool,
        }
    }

    /// Fault (if needed) and pin the train at `pid`.
    pub fn get_train(&self, pid: &PageId, class: BufferClass) -> Result<FrameGuard, StratumError> {
        debug!("get_train {} ({:?})", pid, class);
        self.pool(class).get(pid, true)
    }

    /// Pin a freshly allocated train without reading it: the caller
    /// initializes the contents.
    pub fn get_new_train(
        &self,
        pid: &PageId,
        class: BufferClass,
    ) -> Result<FrameGuard, StratumError> {
        debug!("get_new_train {} ({:?})", pid, class);
        self.pool(class).get(pid, false)
    }

    /// Mark a resident, pinned train dirty by page id.
    pub fn set_dirty(&self, pid: &PageId, class: BufferClass) -> StratumResult {
        self.pool(class).set_dirty(pid)
    }

    pub fn flush(&self, pid: &PageId, class: BufferClass) -> StratumResult {
        self.pool(class).flush(pid)
    }

    pub fn flush_all(&self) -> StratumResult {
        self.page_pool.flush_all()?;
        self.train_pool.flush_all()
    }

    /// Remove a page from the cache without write-back. Needed when a
    /// page is freed so a later reuse of its number cannot see stale
    /// content.
    pub fn discard(&self, pid: &PageId, class: BufferClass) -> StratumResult {
        self.pool(class).discard(pid)
    }

    /// Invalidate all frames of a volume, flushing dirty ones first.
    pub fn dismount(&self, vol_no: u16) -> StratumResult {
        self.page_pool.dismount(vol_no)?;
        self.train_pool.dismount(vol_no)
    }

    /// Number of currently pinned frames across both pools.
    pub fn pinned_frames(&self) -> usize {
        self.page_pool.pinned_frames() + self.train_pool.pinned_frames()
    }
}
