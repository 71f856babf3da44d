//! Free-sector allocator seam.
//!
//! The inode engine acquires and returns sectors one at a time through
//! `FreeMap`. The on-disk residency of the map belongs to the layer
//! above; `SectorMap` is the in-memory reference implementation, a
//! lowest-free first-fit bitmap over a contiguous sector range.

use alloc::vec;
use alloc::vec::Vec;

use log::warn;
use spin::Mutex;

/// Single-sector allocation interface consumed by the inode engine.
pub trait FreeMap: Send + Sync {
    /// Returns a free sector, or `None` when the map is exhausted.
    fn allocate(&self) -> Option<u32>;

    /// Returns `sector` to the map. Freeing a free sector is a bug.
    fn release(&self, sector: u32);
}

struct MapInner {
    bits: Vec<u8>,
    // No free bit lies below the cursor.
    hint: usize,
}

/// First-fit bitmap allocator over sectors `base..base + nsectors`.
pub struct SectorMap {
    base: u32,
    nsectors: usize,
    inner: Mutex<MapInner>,
}

impl SectorMap {
    pub fn new(base: u32, nsectors: usize) -> SectorMap {
        SectorMap {
            base,
            nsectors,
            inner: Mutex::new(MapInner {
                bits: vec![0; nsectors.div_ceil(8)],
                hint: 0,
            }),
        }
    }

    /// Sectors currently allocated.
    pub fn used(&self) -> usize {
        let inner = self.inner.lock();
        inner.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}

impl FreeMap for SectorMap {
    fn allocate(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        for k in inner.hint..self.nsectors {
            let m = 1 << (k % 8);
            if inner.bits[k / 8] & m == 0 {
                inner.bits[k / 8] |= m;
                inner.hint = k + 1;
                return Some(self.base + k as u32);
            }
        }
        warn!("freemap: out of sectors");
        None
    }

    fn release(&self, sector: u32) {
        let k = (sector - self.base) as usize;
        assert!(k < self.nsectors, "releasing sector outside the map");
        let m = 1 << (k % 8);
        let mut inner = self.inner.lock();
        assert_eq!(inner.bits[k / 8] & m, m, "freeing free sector");
        inner.bits[k / 8] &= !m;
        inner.hint = inner.hint.min(k);
    }
}

#[cfg(test)]
mod sectormap_tests {
    use super::*;

    #[test]
    fn first_fit_and_reuse() {
        let map = SectorMap::new(10, 3);
        assert_eq!(map.allocate(), Some(10));
        assert_eq!(map.allocate(), Some(11));
        assert_eq!(map.allocate(), Some(12));
        assert_eq!(map.allocate(), None);
        assert_eq!(map.used(), 3);

        map.release(11);
        assert_eq!(map.allocate(), Some(11));
        assert_eq!(map.used(), 3);
    }

    #[test]
    fn frees_lowest_first() {
        let map = SectorMap::new(0, 16);
        for _ in 0..16 {
            map.allocate().unwrap();
        }
        map.release(9);
        map.release(3);
        assert_eq!(map.allocate(), Some(3));
        assert_eq!(map.allocate(), Some(9));
        assert_eq!(map.allocate(), None);
    }

    #[test]
    #[should_panic(expected = "freeing free sector")]
    fn double_free_panics() {
        let map = SectorMap::new(0, 4);
        let s = map.allocate().unwrap();
        map.release(s);
        map.release(s);
    }
}
