use bit_vec::BitVec;

use crate::{
    error::{ErrorKind, StratumError},
    types::StratumResult,
};

use super::TRAIN_PAGES;

/// How the extent fill factor is applied while scanning for a home
/// extent. The strict pass caps extent occupancy at the fill factor; if
/// nothing qualifies, a best-effort pass ignores the cap rather than
/// failing the allocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillFactorPolicy {
    Strict,
    BestEffort,
}

/// In-memory free-page map of one volume. One bit per page, set =
/// free. Guarded by the volume's page-alloc latch; the on-disk copy is
/// rewritten after every mutation so the bitmap stays authoritative.
pub struct AllocMap {
    free: BitVec,
    extent_size: u16,
    num_extents: u32,
}

impl AllocMap {
    pub fn new_all_free(num_pages: u32, extent_size: u16, num_extents: u32) -> Self {
        Self {
            free: BitVec::from_elem(num_pages as usize, true),
            extent_size,
            num_extents,
        }
    }

    pub fn from_bytes(bytes: &[u8], num_pages: u32, extent_size: u16, num_extents: u32) -> Self {
        let mut free = BitVec::from_bytes(bytes);
        free.truncate(num_pages as usize);
        Self {
            free,
            extent_size,
            num_extents,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.free.to_bytes()
    }

    pub fn num_pages(&self) -> u32 {
        self.free.len() as u32
    }

    pub fn free_page_count(&self) -> u32 {
        self.free.iter().filter(|b| *b).count() as u32
    }

    pub fn is_free(&self, page_no: u32) -> bool {
        self.free.get(page_no as usize).unwrap_or(false)
    }

    pub fn mark_used(&mut self, page_no: u32) {
        self.free.set(page_no as usize, false);
    }

    pub fn ext_of(&self, page_no: u32) -> u32 {
        page_no / self.extent_size as u32
    }

    fn ext_range(&self, ext_no: u32) -> (u32, u32) {
        let lo = ext_no * self.extent_size as u32;
        let hi = (lo + self.extent_size as u32).min(self.num_pages());
        (lo, hi)
    }

    fn ext_used_count(&self, ext_no: u32) -> u32 {
        let (lo, hi) = self.ext_range(ext_no);
        (lo..hi).filter(|&p| !self.free[p as usize]).count() as u32
    }

    /// Whether `ext_no` may take `needed` more pages under `fill_factor`
    /// (a percentage of the extent's pages).
    fn extent_admits(&self, ext_no: u32, fill_factor: u16, needed: u32, policy: FillFactorPolicy) -> bool {
        if policy == FillFactorPolicy::BestEffort {
            return true;
        }
        let cap = self.extent_size as u32 * fill_factor as u32 / 100;
        self.ext_used_count(ext_no) + needed <= cap
    }

    /// First free page in the extent, or a train-aligned free run of
    /// TRAIN_PAGES pages when `train_size > 1`.
    fn find_run_in_extent(&self, ext_no: u32, train_size: usize) -> Option<u32> {
        let (lo, hi) = self.ext_range(ext_no);
        if train_size == 1 {
            return (lo..hi).find(|&p| self.free[p as usize]);
        }
        let step = TRAIN_PAGES as u32;
        let mut p = lo + (step - lo % step) % step;
        while p + step <= hi {
            if (p..p + step).all(|q| self.free[q as usize]) {
                return Some(p);
            }
            p += step;
        }
        None
    }

    fn take_run(&mut self, first: u32, n: usize) {
        for p in first..first + n as u32 {
            self.free.set(p as usize, false);
        }
    }

    /// Allocate one page/train, preferring the extent of `near`, then
    /// extents from `first_ext` onward, then the rest of the volume.
    pub fn alloc_one(
        &mut self,
        first_ext: u32,
        near: Option<u32>,
        fill_factor: u16,
        train_size: usize,
    ) -> Result<u32, StratumError> {
        for &policy in &[FillFactorPolicy::Strict, FillFactorPolicy::BestEffort] {
            let mut candidates: Vec<u32> = Vec::new();
            if let Some(near) = near {
                candidates.push(self.ext_of(near));
            }
            candidates.extend(first_ext..self.num_extents);
            candidates.extend(0..first_ext.min(self.num_extents));

            for ext_no in candidates {
                if !self.extent_admits(ext_no, fill_factor, train_size as u32, policy) {
                    continue;
                }
                if let Some(first) = self.find_run_in_extent(ext_no, train_size) {
                    self.take_run(first, train_size);
                    return Ok(first);
                }
            }
        }
        Err(StratumError::new(
            ErrorKind::DeviceFull,
            "no extent can satisfy the allocation",
        ))
    }

    pub fn free_run(&mut self, first: u32, train_size: usize) -> StratumResult {
        if first as u64 + train_size as u64 > self.num_pages() as u64 {
            return Err(StratumError::new(
                ErrorKind::BadParameter,
                &format!("free of page {} beyond volume", first),
            ));
        }
        for p in first..first + train_size as u32 {
            if p >= self.num_pages() || self.free[p as usize] {
                return Err(StratumError::new(
                    ErrorKind::BadParameter,
                    &format!("page {} is not allocated", p),
                ));
            }
        }
        for p in first..first + train_size as u32 {
            self.free.set(p as usize, true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_dense_from_extent_zero() {
        let mut map = AllocMap::new_all_free(64, 16, 4);
        for i in 0..8 {
            let p = map.alloc_one(0, None, 100, 1).unwrap();
            assert_eq!(p, i);
        }
        map.free_run(3, 1).unwrap();
        assert_eq!(map.alloc_one(0, None, 100, 1).unwrap(), 3);
    }

    #[test]
    fn test_alloc_near_prefers_its_extent() {
        let mut map = AllocMap::new_all_free(64, 16, 4);
        let p = map.alloc_one(0, Some(33), 100, 1).unwrap();
        assert_eq!(map.ext_of(p), 2);
    }

    #[test]
    fn test_train_alloc_is_aligned() {
        let mut map = AllocMap::new_all_free(64, 16, 4);
        // knock out page 0 so the first aligned run starts at 4
        let p = map.alloc_one(0, None, 100, 1).unwrap();
        assert_eq!(p, 0);
        let t = map.alloc_one(0, None, 100, TRAIN_PAGES).unwrap();
        assert_eq!(t, 4);
        assert_eq!(t % TRAIN_PAGES as u32, 0);
        map.free_run(t, TRAIN_PAGES).unwrap();
        assert_eq!(map.free_page_count(), 63);
    }

    #[test]
    fn test_fill_factor_strict_then_best_effort() {
        let mut map = AllocMap::new_all_free(32, 16, 2);
        // fill extent 0 to 8 pages (50%)
        for _ in 0..8 {
            map.alloc_one(0, None, 100, 1).unwrap();
        }
        // a 50% cap pushes the next page into extent 1
        let p = map.alloc_one(0, None, 50, 1).unwrap();
        assert_eq!(map.ext_of(p), 1);
        // once every extent is at the cap, best effort kicks in
        for _ in 0..7 {
            map.alloc_one(1, None, 50, 1).unwrap();
        }
        let p = map.alloc_one(0, None, 50, 1).unwrap();
        assert!(map.is_free(p) == false);
    }

    #[test]
    fn test_device_full() {
        let mut map = AllocMap::new_all_free(16, 16, 1);
        for _ in 0..16 {
            map.alloc_one(0, None, 100, 1).unwrap();
        }
        let e = map.alloc_one(0, None, 100, 1).unwrap_err();
        assert_eq!(*e.kind(), ErrorKind::DeviceFull);
    }
}
