//! Buffer cache.
//!
//! The cache holds at most `NSLOT` sector-sized slots between the
//! upper layers and the block device. Caching bounds device traffic
//! and gives concurrent users of a sector a single synchronization
//! point: a sector is resident at most once.
//!
//! Interface:
//! * `pin` returns a pinned handle to a sector's slot, loading it from
//!   the device on a miss; drop the handle to unpin.
//! * A pinned slot is never evicted and never has its payload reused.
//! * `flush_all` writes dirty slots back; a dedicated thread runs
//!   `flushd` to do so periodically.
//!
//! Eviction is second-chance: a linear scan over the resident list
//! that clears each unpinned slot's accessed bit on first encounter
//! and takes the slot on the second, writing it back first if dirty.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use core::time::Duration;

use bitflags::bitflags;
use log::debug;
use spin::Mutex;

use crate::dev::BlockDevice;
use crate::param::{FLUSH_INTERVAL, NSLOT, SECTOR_SIZE};

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct SlotFlags: u32 {
        const DIRTY = 1 << 0; // payload differs from the device
        const ACCESSED = 1 << 1; // touched since the last eviction scan
    }
}

struct SlotInner {
    flags: SlotFlags,
    data: [u8; SECTOR_SIZE],
}

// Pin counts are atomic so unpinning never has to take the cache-wide
// lock; raising a pin count still happens only under it.
struct SlotState {
    pins: AtomicU32,
    inner: Mutex<SlotInner>,
}

struct Slot {
    sector: u32,
    state: Arc<SlotState>,
}

/// Write-back sector cache with a bounded resident set.
pub struct Cache {
    dev: Arc<dyn BlockDevice>,
    slots: Mutex<Vec<Slot>>,
}

impl Cache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Cache {
        Cache {
            dev,
            slots: Mutex::new(Vec::with_capacity(NSLOT)),
        }
    }

    /// Returns a pinned handle to `sector`, reading it from the device
    /// on a miss. `dirty` is ORed into the slot's dirty bit up front,
    /// for callers that are about to overwrite the payload.
    pub fn pin(&self, sector: u32, dirty: bool) -> Block {
        Block {
            sector,
            state: self.install(sector, dirty, true),
        }
    }

    /// Returns a pinned handle to `sector` with an all-zero payload and
    /// no device read. For freshly allocated sectors whose previous
    /// contents are dead.
    pub fn zero(&self, sector: u32) -> Block {
        Block {
            sector,
            state: self.install(sector, true, false),
        }
    }

    fn install(&self, sector: u32, dirty: bool, load: bool) -> Arc<SlotState> {
        let hint = if dirty {
            SlotFlags::DIRTY
        } else {
            SlotFlags::empty()
        };
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.iter().find(|s| s.sector == sector) {
            slot.state.pins.fetch_add(1, Ordering::Relaxed);
            let mut inner = slot.state.inner.lock();
            inner.flags |= hint | SlotFlags::ACCESSED;
            if !load {
                inner.data.fill(0);
            }
            return slot.state.clone();
        }

        // Miss: take a fresh slot while the resident set is under its
        // bound, otherwise retry the eviction scan until a victim turns
        // up. Unpins land without the cache lock, so the retry loop
        // cannot starve pin holders out of releasing.
        let idx = if slots.len() < NSLOT {
            slots.push(Slot {
                sector,
                state: Arc::new(SlotState {
                    pins: AtomicU32::new(0),
                    inner: Mutex::new(SlotInner {
                        flags: SlotFlags::empty(),
                        data: [0; SECTOR_SIZE],
                    }),
                }),
            });
            slots.len() - 1
        } else {
            loop {
                if let Some(idx) = evict(slots.as_slice(), &*self.dev) {
                    break idx;
                }
                core::hint::spin_loop();
            }
        };

        slots[idx].sector = sector;
        let state = slots[idx].state.clone();
        state.pins.store(1, Ordering::Relaxed);
        let mut inner = state.inner.lock();
        inner.flags = hint | SlotFlags::ACCESSED;
        if load {
            self.dev.read_sector(sector, &mut inner.data);
        } else {
            inner.data.fill(0);
        }
        drop(inner);
        state
    }

    /// Writes every dirty slot back to the device and clears the dirty
    /// bits. With `clear`, also empties the resident set; that form is
    /// for shutdown, after the last handle is gone.
    pub fn flush_all(&self, clear: bool) {
        let mut slots = self.slots.lock();
        for slot in slots.iter() {
            let mut inner = slot.state.inner.lock();
            if inner.flags.contains(SlotFlags::DIRTY) {
                self.dev.write_sector(slot.sector, &inner.data);
                inner.flags.remove(SlotFlags::DIRTY);
            }
        }
        if clear {
            assert!(
                slots
                    .iter()
                    .all(|s| s.state.pins.load(Ordering::Relaxed) == 0),
                "clearing cache with pinned slots"
            );
            slots.clear();
        }
    }

    /// Periodic write-back loop. Sleeps on the caller's timer between
    /// passes and returns once `stop` is raised. Run it on a dedicated
    /// thread for the lifetime of the filesystem; dirty data is
    /// volatile between passes.
    pub fn flushd<F: Fn(Duration)>(&self, sleep: F, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            sleep(FLUSH_INTERVAL);
            self.flush_all(false);
        }
    }

    /// Resident slot count.
    pub fn resident(&self) -> usize {
        self.slots.lock().len()
    }

    /// Slots whose payload has not been written back yet.
    pub fn dirty_count(&self) -> usize {
        let slots = self.slots.lock();
        slots
            .iter()
            .filter(|s| s.state.inner.lock().flags.contains(SlotFlags::DIRTY))
            .count()
    }
}

// Second-chance scan, called with the cache lock held. Returns the
// index of a reusable slot, or None when every slot is pinned or was
// granted its second chance this pass.
fn evict(slots: &[Slot], dev: &dyn BlockDevice) -> Option<usize> {
    for (idx, slot) in slots.iter().enumerate() {
        if slot.state.pins.load(Ordering::Relaxed) > 0 {
            continue;
        }
        let mut inner = slot.state.inner.lock();
        if inner.flags.contains(SlotFlags::ACCESSED) {
            inner.flags.remove(SlotFlags::ACCESSED);
        } else {
            if inner.flags.contains(SlotFlags::DIRTY) {
                dev.write_sector(slot.sector, &inner.data);
                inner.flags.remove(SlotFlags::DIRTY);
            }
            debug!("bio: evict sector {}", slot.sector);
            return Some(idx);
        }
    }
    None
}

/// A pinned reference to a cached sector. The slot cannot be evicted
/// while the handle lives; dropping it unpins. Concurrent handles to
/// the same sector share one payload.
pub struct Block {
    sector: u32,
    state: Arc<SlotState>,
}

impl Block {
    pub fn sector(&self) -> u32 {
        self.sector
    }

    /// Copies out of the payload starting at `off`.
    pub fn read_at(&self, dst: &mut [u8], off: usize) {
        assert!(off + dst.len() <= SECTOR_SIZE, "read past sector payload");
        let mut inner = self.state.inner.lock();
        dst.copy_from_slice(&inner.data[off..off + dst.len()]);
        inner.flags |= SlotFlags::ACCESSED;
    }

    /// Copies into the payload starting at `off` and marks the slot
    /// dirty.
    pub fn write_at(&self, src: &[u8], off: usize) {
        assert!(off + src.len() <= SECTOR_SIZE, "write past sector payload");
        let mut inner = self.state.inner.lock();
        inner.data[off..off + src.len()].copy_from_slice(src);
        inner.flags |= SlotFlags::DIRTY | SlotFlags::ACCESSED;
    }

    pub fn mark_dirty(&self) {
        self.state.inner.lock().flags |= SlotFlags::DIRTY;
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.state.pins.fetch_sub(1, Ordering::Release);
    }
}
