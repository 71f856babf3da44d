//! Sector I/O seam.
//!
//! The filesystem core talks to storage through `BlockDevice`:
//! synchronous reads and writes of one 512-byte sector, never
//! reordered. `MemDisk` is a RAM-backed implementation used by the
//! tests and by embedders who want a scratch volume; it counts device
//! operations so write-back behavior can be observed from outside.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::param::SECTOR_SIZE;

/// A synchronous sector-addressed storage device.
pub trait BlockDevice: Send + Sync {
    /// Fills `buf` with the contents of `sector`. Blocks until done.
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);

    /// Writes `buf` to `sector`. Blocks until the sector is durable as
    /// far as the device is concerned.
    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);
}

/// An in-memory sector array standing in for a disk.
pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDisk {
    pub fn new(nsectors: usize) -> MemDisk {
        MemDisk {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; nsectors]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Sectors read from the device so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Sectors written to the device so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for MemDisk {
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock();
        buf.copy_from_slice(&sectors[sector as usize]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock();
        sectors[sector as usize].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}
