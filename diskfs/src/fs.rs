//! Inode engine: indexed file-block maps over the buffer cache.
//!
//! An inode describes a single unnamed file: its length, its parent
//! directory's sector, and an index of the sectors holding its data.
//! The index has three levels: eight direct pointers, one singly-
//! indirect block of 128 sector ids, and one doubly-indirect block of
//! 128 further indirect blocks.
//!
//! Growth is resumable. Three cursors persisted in the inode record
//! how far each index level has been filled, so extending a file that
//! was closed and reopened picks up exactly where allocation stopped.
//! Every data sector is zeroed before the index points at it.
//!
//! The engine keeps a registry of open inodes so that opening a sector
//! twice yields the same instance. Each open inode carries two
//! lengths: the allocated length, and `read_length`, which readers use
//! as their bound. A writer publishes `read_length` only after its
//! extension is fully allocated and zero-filled, so a concurrent
//! reader never walks into a half-built region.
//!
//! A typical sequence is:
//!   let h = fs.open(sector)?;
//!   h.write_at(buf, off);
//!   ...
//!   drop(h);            // last close writes metadata back,
//!                       // or reclaims everything if removed

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::cmp;
use core::mem;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{debug, warn};
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::bio::Cache;
use crate::dev::BlockDevice;
use crate::freemap::FreeMap;
use crate::param::SECTOR_SIZE;
use crate::Result;

/// Direct pointers per inode.
pub const NDIRECT: usize = 8;
/// Sector ids per indirect block.
pub const NPTR: usize = SECTOR_SIZE / mem::size_of::<u32>();

const SECTOR_BYTES: u32 = SECTOR_SIZE as u32;
const DIRECT_BYTES: u32 = (NDIRECT * SECTOR_SIZE) as u32;
const INDIRECT_BYTES: u32 = (NPTR * SECTOR_SIZE) as u32;

/// Largest file length the index can address: 8 direct + 128 indirect
/// + 128 x 128 doubly-indirect data sectors.
pub const MAX_LENGTH: u32 = DIRECT_BYTES + INDIRECT_BYTES + NPTR as u32 * INDIRECT_BYTES;

/// Sector of the root directory's inode.
pub const ROOT_SECTOR: u32 = 1;

const INODE_MAGIC: u32 = 0x494e_4f44;

// On-disk inode. Must be exactly one sector.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes)]
struct DiskInode {
    parent: u32,             // sector of the parent directory's inode
    length: i32,             // file size in bytes
    magic: u32,              // identifies the sector as an inode
    unused: [u32; 111],      // pads the layout out to one sector
    ptr: [u32; NDIRECT + 2], // direct, then singly-, then doubly-indirect
    isdir: u8,
    pad: [u8; 3],
    i_dir: i32,   // growth cursors, see BlockMap
    i_indir: i32,
    i_doubly: i32,
}
const_assert_eq!(mem::size_of::<DiskInode>(), SECTOR_SIZE);

// An indirect block: a sector of sector ids.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes)]
struct IndirBlock {
    ptr: [u32; NPTR],
}
const_assert_eq!(mem::size_of::<IndirBlock>(), SECTOR_SIZE);

/// Data sectors needed to hold `length` bytes.
fn data_sectors(length: u32) -> u32 {
    length.div_ceil(SECTOR_BYTES)
}

/// Indirect blocks (singly-indirect plus the inner blocks of the
/// doubly-indirect tree) needed to index `length` bytes.
fn indirect_sectors(length: u32) -> u32 {
    if length <= DIRECT_BYTES {
        return 0;
    }
    (length - DIRECT_BYTES).div_ceil(INDIRECT_BYTES)
}

fn doubly_sectors(length: u32) -> u32 {
    if length <= DIRECT_BYTES + INDIRECT_BYTES {
        0
    } else {
        1
    }
}

/// The index portion of an inode: the pointer array plus the growth
/// cursors recording where the next allocation lands at each level.
/// `i_dir` counts filled direct slots (8 = filling the singly-indirect
/// block, 9 = filling the doubly-indirect tree); `i_indir` and
/// `i_doubly` count filled slots in the current indirect and inner
/// indirect block.
#[derive(Clone, Copy, Debug)]
struct BlockMap {
    ptr: [u32; NDIRECT + 2],
    i_dir: u32,
    i_indir: u32,
    i_doubly: u32,
}

impl BlockMap {
    const fn empty() -> BlockMap {
        BlockMap {
            ptr: [0; NDIRECT + 2],
            i_dir: 0,
            i_indir: 0,
            i_doubly: 0,
        }
    }

    /// Maps byte offset `pos` to its physical sector. The caller
    /// guarantees `pos` is below the allocated length.
    fn byte_to_sector(&self, cache: &Cache, pos: u32) -> u32 {
        if pos < DIRECT_BYTES {
            self.ptr[(pos / SECTOR_BYTES) as usize]
        } else if pos < DIRECT_BYTES + INDIRECT_BYTES {
            let ind = read_index(cache, self.ptr[NDIRECT]);
            ind.ptr[((pos - DIRECT_BYTES) / SECTOR_BYTES) as usize]
        } else {
            let pos = pos - DIRECT_BYTES - INDIRECT_BYTES;
            let outer = read_index(cache, self.ptr[NDIRECT + 1]);
            let inner = read_index(cache, outer.ptr[(pos / INDIRECT_BYTES) as usize]);
            inner.ptr[((pos % INDIRECT_BYTES) / SECTOR_BYTES) as usize]
        }
    }

    /// Extends the allocation from `old_length` to cover `new_length`
    /// bytes, resuming at the persisted cursors. Returns the length
    /// actually covered, which falls short when the free map runs dry.
    fn expand(&mut self, cache: &Cache, fm: &dyn FreeMap, old_length: u32, new_length: u32) -> u32 {
        let mut want = data_sectors(new_length) - data_sectors(old_length);
        if want == 0 {
            return new_length;
        }
        while self.i_dir < NDIRECT as u32 && want > 0 {
            let Some(s) = fm.allocate() else { break };
            zero_fill(cache, s);
            self.ptr[self.i_dir as usize] = s;
            self.i_dir += 1;
            want -= 1;
        }
        while self.i_dir == NDIRECT as u32 && want > 0 {
            let got = self.expand_indirect(cache, fm, want);
            if got == want {
                break; // no progress: out of space
            }
            want = got;
        }
        if self.i_dir == NDIRECT as u32 + 1 && want > 0 {
            want = self.expand_doubly(cache, fm, want);
        }
        new_length - want * SECTOR_BYTES
    }

    // Fills the singly-indirect block, allocating it first when the
    // cursor shows it untouched. Advances to the doubly level when the
    // block fills.
    fn expand_indirect(&mut self, cache: &Cache, fm: &dyn FreeMap, mut want: u32) -> u32 {
        let mut ind = if self.i_indir == 0 {
            let Some(s) = fm.allocate() else { return want };
            self.ptr[NDIRECT] = s;
            IndirBlock::new_zeroed()
        } else {
            read_index(cache, self.ptr[NDIRECT])
        };
        while self.i_indir < NPTR as u32 && want > 0 {
            let Some(s) = fm.allocate() else { break };
            zero_fill(cache, s);
            ind.ptr[self.i_indir as usize] = s;
            self.i_indir += 1;
            want -= 1;
        }
        write_index(cache, self.ptr[NDIRECT], &ind);
        if self.i_indir == NPTR as u32 {
            self.i_indir = 0;
            self.i_dir += 1;
        }
        want
    }

    fn expand_doubly(&mut self, cache: &Cache, fm: &dyn FreeMap, mut want: u32) -> u32 {
        let mut outer = if self.i_indir == 0 && self.i_doubly == 0 {
            let Some(s) = fm.allocate() else { return want };
            self.ptr[NDIRECT + 1] = s;
            IndirBlock::new_zeroed()
        } else {
            read_index(cache, self.ptr[NDIRECT + 1])
        };
        while self.i_indir < NPTR as u32 && want > 0 {
            let got = self.expand_doubly_inner(cache, fm, want, &mut outer);
            if got == want {
                break;
            }
            want = got;
        }
        write_index(cache, self.ptr[NDIRECT + 1], &outer);
        want
    }

    fn expand_doubly_inner(
        &mut self,
        cache: &Cache,
        fm: &dyn FreeMap,
        mut want: u32,
        outer: &mut IndirBlock,
    ) -> u32 {
        let mut inner = if self.i_doubly == 0 {
            let Some(s) = fm.allocate() else { return want };
            outer.ptr[self.i_indir as usize] = s;
            IndirBlock::new_zeroed()
        } else {
            read_index(cache, outer.ptr[self.i_indir as usize])
        };
        while self.i_doubly < NPTR as u32 && want > 0 {
            let Some(s) = fm.allocate() else { break };
            zero_fill(cache, s);
            inner.ptr[self.i_doubly as usize] = s;
            self.i_doubly += 1;
            want -= 1;
        }
        write_index(cache, outer.ptr[self.i_indir as usize], &inner);
        if self.i_doubly == NPTR as u32 {
            self.i_doubly = 0;
            self.i_indir += 1;
        }
        want
    }

    /// Returns every sector the map references to the free map, index
    /// blocks included. Counts are derived from `length`.
    fn dealloc(&self, cache: &Cache, fm: &dyn FreeMap, length: u32) {
        let mut data = data_sectors(length);
        let mut indirect = indirect_sectors(length);
        let doubly = doubly_sectors(length);

        let mut idx = 0;
        while data > 0 && idx < NDIRECT {
            fm.release(self.ptr[idx]);
            data -= 1;
            idx += 1;
        }
        while indirect > 0 && idx < NDIRECT + 1 {
            let n = cmp::min(data, NPTR as u32);
            dealloc_indirect(cache, fm, self.ptr[idx], n);
            data -= n;
            indirect -= 1;
            idx += 1;
        }
        if doubly > 0 {
            dealloc_doubly(cache, fm, self.ptr[idx], indirect, data);
        }
    }
}

fn dealloc_indirect(cache: &Cache, fm: &dyn FreeMap, sector: u32, nptrs: u32) {
    let ind = read_index(cache, sector);
    for i in 0..nptrs as usize {
        fm.release(ind.ptr[i]);
    }
    fm.release(sector);
}

fn dealloc_doubly(cache: &Cache, fm: &dyn FreeMap, sector: u32, inners: u32, mut data: u32) {
    let outer = read_index(cache, sector);
    for i in 0..inners as usize {
        let n = cmp::min(data, NPTR as u32);
        dealloc_indirect(cache, fm, outer.ptr[i], n);
        data -= n;
    }
    fm.release(sector);
}

fn read_index(cache: &Cache, sector: u32) -> IndirBlock {
    let blk = cache.pin(sector, false);
    let mut raw = [0u8; SECTOR_SIZE];
    blk.read_at(&mut raw, 0);
    IndirBlock::read_from(&raw[..]).expect("indirect block is sector sized")
}

fn write_index(cache: &Cache, sector: u32, ind: &IndirBlock) {
    cache.zero(sector).write_at(ind.as_bytes(), 0);
}

// A fresh data sector becomes visible all-zero; its previous contents
// are dead, so no device read is needed.
fn zero_fill(cache: &Cache, sector: u32) {
    let _blk = cache.zero(sector);
}

// Mutable inode state. Kept behind a short-hold mutex; growth works on
// a copy and commits, so readers translating offsets below the
// published length never contend with allocation I/O.
struct Imeta {
    parent: u32,
    length: u32,
    isdir: bool,
    map: BlockMap,
}

impl Imeta {
    fn to_disk(&self) -> DiskInode {
        DiskInode {
            parent: self.parent,
            length: self.length as i32,
            magic: INODE_MAGIC,
            unused: [0; 111],
            ptr: self.map.ptr,
            isdir: self.isdir as u8,
            pad: [0; 3],
            i_dir: self.map.i_dir as i32,
            i_indir: self.map.i_indir as i32,
            i_doubly: self.map.i_doubly as i32,
        }
    }

    fn from_disk(d: &DiskInode) -> Imeta {
        Imeta {
            parent: d.parent,
            length: d.length as u32,
            isdir: d.isdir != 0,
            map: BlockMap {
                ptr: d.ptr,
                i_dir: d.i_dir as u32,
                i_indir: d.i_indir as u32,
                i_doubly: d.i_doubly as u32,
            },
        }
    }
}

/// An open inode. Obtained through [`Fs::open`]; at most one instance
/// exists per sector, shared by every holder.
pub struct Inode {
    sector: u32,
    open_cnt: AtomicU32,
    deny_write_cnt: AtomicU32,
    removed: AtomicBool,
    meta_dirty: AtomicBool,
    // Length visible to readers. Published after an extension is fully
    // allocated and zero-filled, never before.
    read_length: AtomicU32,
    meta: Mutex<Imeta>,
    // Serializes growth on data files; the directory layer takes it
    // around multi-step operations via `lock`.
    glock: Mutex<()>,
    fs: Arc<FsInner>,
}

impl Inode {
    /// The sector this inode lives in, its identity on the device.
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    /// Allocated length in bytes.
    pub fn length(&self) -> u64 {
        u64::from(self.meta.lock().length)
    }

    pub fn parent(&self) -> u32 {
        self.meta.lock().parent
    }

    pub fn is_dir(&self) -> bool {
        self.meta.lock().isdir
    }

    /// Live handles to this inode.
    pub fn open_count(&self) -> u32 {
        self.open_cnt.load(Ordering::Relaxed)
    }

    /// Marks the inode for deletion: the last close returns its data,
    /// index blocks, and inode sector to the free map.
    pub fn remove(&self) {
        self.removed.store(true, Ordering::Relaxed);
    }

    /// The per-inode mutex. File growth takes it internally; the
    /// directory layer brackets multi-step directory operations with it.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.glock.lock()
    }

    /// Disables writes. May be called at most once per open handle.
    pub fn deny_write(&self) {
        let n = self.deny_write_cnt.fetch_add(1, Ordering::Relaxed) + 1;
        assert!(
            n <= self.open_cnt.load(Ordering::Relaxed),
            "deny_write without an open handle"
        );
    }

    /// Re-enables writes. Must pair with an earlier `deny_write`.
    pub fn allow_write(&self) {
        let n = self.deny_write_cnt.fetch_sub(1, Ordering::Relaxed);
        assert!(n > 0, "allow_write without deny_write");
    }

    /// Reads into `dst` starting at byte `off`, returning the bytes
    /// copied: short at end of file, zero at or past it. Bounded by the
    /// reader-visible length, so a concurrent extension is never
    /// observed half-built.
    pub fn read_at(&self, dst: &mut [u8], off: u64) -> usize {
        let length = u64::from(self.read_length.load(Ordering::Acquire));
        if off >= length {
            return 0;
        }
        let map = self.meta.lock().map;
        let cache = &self.fs.cache;
        let length = length as usize;
        let mut off = off as usize;
        let mut total = 0;
        while total < dst.len() {
            let left = cmp::min(length - off, SECTOR_SIZE - off % SECTOR_SIZE);
            let chunk = cmp::min(dst.len() - total, left);
            if chunk == 0 {
                break;
            }
            let sector = map.byte_to_sector(cache, off as u32);
            let blk = cache.pin(sector, false);
            blk.read_at(&mut dst[total..total + chunk], off % SECTOR_SIZE);
            off += chunk;
            total += chunk;
        }
        total
    }

    /// Writes `src` starting at byte `off`, extending the file when the
    /// range reaches past its length. Returns the bytes written: zero
    /// while writes are denied, short when the free map runs dry or the
    /// range passes the addressable maximum.
    pub fn write_at(&self, src: &[u8], off: u64) -> usize {
        if self.deny_write_cnt.load(Ordering::Relaxed) > 0 {
            return 0;
        }
        let end = off + src.len() as u64;
        if end > self.length() {
            let isdir = self.meta.lock().isdir;
            let _guard = (!isdir).then(|| self.glock.lock());
            self.grow(cmp::min(end, u64::from(MAX_LENGTH)) as u32);
        }

        let (map, length) = {
            let m = self.meta.lock();
            (m.map, m.length)
        };
        let cache = &self.fs.cache;
        let length_bytes = length as usize;
        let mut off = off as usize;
        let mut total = 0;
        while total < src.len() {
            if off >= length_bytes {
                break;
            }
            let left = cmp::min(length_bytes - off, SECTOR_SIZE - off % SECTOR_SIZE);
            let chunk = cmp::min(src.len() - total, left);
            let sector = map.byte_to_sector(cache, off as u32);
            let blk = cache.pin(sector, true);
            blk.write_at(&src[total..total + chunk], off % SECTOR_SIZE);
            off += chunk;
            total += chunk;
        }

        // Publish the extension to readers only now that every sector
        // in it is allocated, zeroed, and written.
        self.read_length.fetch_max(length, Ordering::Release);
        total
    }

    fn grow(&self, new_length: u32) {
        let (mut map, old) = {
            let m = self.meta.lock();
            (m.map, m.length)
        };
        if new_length <= old {
            return;
        }
        let achieved = map.expand(&self.fs.cache, &*self.fs.freemap, old, new_length);
        // A short expansion never shrinks the recorded extent.
        let achieved = cmp::max(achieved, old);
        if achieved < new_length {
            warn!(
                "fs: inode {}: grew to {} of {} bytes",
                self.sector, achieved, new_length
            );
        }
        let mut m = self.meta.lock();
        m.map = map;
        m.length = achieved;
        drop(m);
        self.meta_dirty.store(true, Ordering::Relaxed);
    }
}

/// A live reference to an open inode. Cloning reopens; dropping closes,
/// and the last close either writes changed metadata back or, for a
/// removed inode, reclaims all of its sectors.
pub struct Handle {
    inode: Arc<Inode>,
}

impl Deref for Handle {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.inode
    }
}

impl Clone for Handle {
    fn clone(&self) -> Handle {
        self.inode.open_cnt.fetch_add(1, Ordering::Relaxed);
        Handle {
            inode: self.inode.clone(),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let fs = &self.inode.fs;
        let mut itable = fs.itable.lock();
        if self.inode.open_cnt.fetch_sub(1, Ordering::Relaxed) != 1 {
            return;
        }
        itable.remove(&self.inode.sector);
        drop(itable);

        if self.inode.removed.load(Ordering::Relaxed) {
            let meta = self.inode.meta.lock();
            fs.freemap.release(self.inode.sector);
            meta.map.dealloc(&fs.cache, &*fs.freemap, meta.length);
            debug!("fs: inode {} removed and reclaimed", self.inode.sector);
        } else if self.inode.meta_dirty.load(Ordering::Relaxed) {
            let meta = self.inode.meta.lock();
            fs.cache.zero(self.inode.sector).write_at(meta.to_disk().as_bytes(), 0);
        }
    }
}

struct FsInner {
    cache: Arc<Cache>,
    freemap: Arc<dyn FreeMap>,
    // Open-inode registry. Weak entries: handles own the inode, the
    // registry only finds it while at least one handle is live.
    itable: Mutex<BTreeMap<u32, Weak<Inode>>>,
}

/// The filesystem core: a buffer cache under an inode engine, over one
/// block device and one free-sector map.
pub struct Fs {
    inner: Arc<FsInner>,
}

impl Fs {
    pub fn new(dev: Arc<dyn BlockDevice>, freemap: Arc<dyn FreeMap>) -> Fs {
        Fs {
            inner: Arc::new(FsInner {
                cache: Arc::new(Cache::new(dev)),
                freemap,
                itable: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// The buffer cache, shared so a flush thread can own a handle.
    pub fn cache(&self) -> &Arc<Cache> {
        &self.inner.cache
    }

    /// Writes a fresh inode covering `length` bytes (clamped to the
    /// addressable maximum) to `sector`. Allocation runs through the
    /// normal growth path so the persisted cursors line up with the
    /// layout. Out of space leaves the partial allocation in place and
    /// fails; the written inode still covers what was allocated.
    pub fn create(&self, sector: u32, length: u64, isdir: bool) -> Result<()> {
        let want = cmp::min(length, u64::from(MAX_LENGTH)) as u32;
        let mut map = BlockMap::empty();
        let got = map.expand(&self.inner.cache, &*self.inner.freemap, 0, want);
        let meta = Imeta {
            parent: ROOT_SECTOR,
            length: got,
            isdir,
            map,
        };
        self.inner
            .cache
            .zero(sector)
            .write_at(meta.to_disk().as_bytes(), 0);
        if got < want {
            warn!("fs: create {}: out of space at {} of {} bytes", sector, got, want);
            return Err("create: out of space");
        }
        debug!("fs: created inode {} length {} dir {}", sector, got, isdir);
        Ok(())
    }

    /// Opens the inode stored at `sector`. A sector already open comes
    /// back as the registry's existing instance.
    pub fn open(&self, sector: u32) -> Result<Handle> {
        let mut itable = self.inner.itable.lock();
        if let Some(inode) = itable.get(&sector).and_then(Weak::upgrade) {
            inode.open_cnt.fetch_add(1, Ordering::Relaxed);
            return Ok(Handle { inode });
        }

        let blk = self.inner.cache.pin(sector, false);
        let mut raw = [0u8; SECTOR_SIZE];
        blk.read_at(&mut raw, 0);
        drop(blk);
        let disk = DiskInode::read_from(&raw[..]).expect("inode is sector sized");
        if disk.magic != INODE_MAGIC {
            warn!("fs: open {}: bad magic {:#x}", sector, disk.magic);
            return Err("open: bad inode magic");
        }

        let meta = Imeta::from_disk(&disk);
        let length = meta.length;
        let inode = Arc::new(Inode {
            sector,
            open_cnt: AtomicU32::new(1),
            deny_write_cnt: AtomicU32::new(0),
            removed: AtomicBool::new(false),
            meta_dirty: AtomicBool::new(false),
            read_length: AtomicU32::new(length),
            meta: Mutex::new(meta),
            glock: Mutex::new(()),
            fs: self.inner.clone(),
        });
        itable.insert(sector, Arc::downgrade(&inode));
        Ok(Handle { inode })
    }

    /// Records `parent` as the parent directory of the inode at
    /// `child`. Persists with the child's last close.
    pub fn add_parent(&self, parent: u32, child: u32) -> Result<()> {
        let handle = self.open(child)?;
        handle.inode.meta.lock().parent = parent;
        handle.inode.meta_dirty.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for Fs {
    fn drop(&mut self) {
        self.inner.cache.flush_all(true);
    }
}

#[cfg(test)]
mod inode_tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::dev::MemDisk;
    use crate::freemap::SectorMap;

    // Sectors 0 and 1 are left out of the free map, as a superblock
    // and root directory would claim them.
    fn fixture(nsectors: usize) -> (Fs, Arc<MemDisk>, Arc<SectorMap>) {
        let disk = Arc::new(MemDisk::new(nsectors));
        let fm = Arc::new(SectorMap::new(2, nsectors - 2));
        let fs = Fs::new(disk.clone(), fm.clone());
        (fs, disk, fm)
    }

    #[test]
    fn fills_the_direct_row_at_its_boundary() {
        let (fs, _disk, fm) = fixture(64);
        let isec = fm.allocate().unwrap();
        fs.create(isec, 0, false).unwrap();
        assert_eq!(fm.used(), 1);

        let h = fs.open(isec).unwrap();
        let pat = [0xabu8; 512];
        assert_eq!(h.write_at(&pat, 3584), 512);
        assert_eq!(h.length(), 4096);
        // Eight direct data sectors, no index blocks yet.
        assert_eq!(fm.used(), 1 + 8);

        let mut out = [0u8; 512];
        assert_eq!(h.read_at(&mut out, 3584), 512);
        assert_eq!(out[..], pat[..]);

        // The skipped-over region reads back as zeros.
        assert_eq!(h.read_at(&mut out, 0), 512);
        assert_eq!(out, [0u8; 512]);
    }

    #[test]
    fn crosses_from_direct_into_the_indirect_block() {
        let (fs, _disk, fm) = fixture(64);
        let isec = fm.allocate().unwrap();
        fs.create(isec, 0, false).unwrap();
        let h = fs.open(isec).unwrap();

        let pat = [0x3du8; 1024];
        assert_eq!(h.write_at(&pat, 4096), 1024);
        assert_eq!(h.length(), 5120);
        // Eight direct + the indirect block + two of its data sectors.
        assert_eq!(fm.used(), 1 + 8 + 1 + 2);

        let mut out = [0u8; 1024];
        assert_eq!(h.read_at(&mut out, 4096), 1024);
        assert_eq!(out[..], pat[..]);
    }

    #[test]
    fn crosses_into_the_doubly_indirect_tree() {
        let (fs, _disk, fm) = fixture(256);
        let isec = fm.allocate().unwrap();
        fs.create(isec, 0, false).unwrap();
        let h = fs.open(isec).unwrap();

        // First byte addressed through the doubly-indirect tree.
        let off = u64::from(DIRECT_BYTES + INDIRECT_BYTES);
        let pat = [0x5cu8; 512];
        assert_eq!(h.write_at(&pat, off), 512);
        assert_eq!(h.length(), off + 512);
        // 137 data sectors, the singly-indirect block, the outer block,
        // and one inner block, plus the inode itself.
        assert_eq!(fm.used(), 137 + 3 + 1);

        let mut out = [0u8; 512];
        assert_eq!(h.read_at(&mut out, off), 512);
        assert_eq!(out[..], pat[..]);
        assert_eq!(h.read_at(&mut out, off - 512), 512);
        assert_eq!(out, [0u8; 512]);
    }

    #[test]
    fn grows_to_the_addressable_maximum() {
        let (fs, _disk, fm) = fixture(17_000);
        let isec = fm.allocate().unwrap();
        // Requests past the cap are clamped, not failed.
        fs.create(isec, u64::from(MAX_LENGTH) + 100_000, false).unwrap();
        let h = fs.open(isec).unwrap();
        assert_eq!(h.length(), u64::from(MAX_LENGTH));
        // 16 520 data + 1 singly + 1 outer + 128 inner index sectors,
        // plus the inode.
        assert_eq!(fm.used(), 16_520 + 1 + 1 + 128 + 1);

        let last = u64::from(MAX_LENGTH) - 1;
        assert_eq!(h.write_at(b"z", last), 1);
        let mut out = [0u8; 1];
        assert_eq!(h.read_at(&mut out, last), 1);
        assert_eq!(&out, b"z");

        // Past the cap nothing is written.
        assert_eq!(h.write_at(b"z", u64::from(MAX_LENGTH)), 0);
    }

    #[test]
    fn remove_reclaims_on_last_close() {
        let (fs, _disk, fm) = fixture(512);
        let isec = fm.allocate().unwrap();
        fs.create(isec, 70_000, false).unwrap();
        let used = fm.used();
        assert!(used > 130);

        let h1 = fs.open(isec).unwrap();
        let h2 = h1.clone();
        assert_eq!(h1.open_count(), 2);
        h1.remove();

        drop(h1);
        // Still open once: nothing reclaimed, the registry still
        // serves the same instance.
        assert_eq!(fm.used(), used);
        let again = fs.open(isec).unwrap();
        assert_eq!(again.open_count(), 2);
        drop(again);

        drop(h2);
        assert_eq!(fm.used(), 0);
    }

    #[test]
    fn reader_never_sees_a_half_extension() {
        let (fs, _disk, fm) = fixture(4096);
        let isec = fm.allocate().unwrap();
        fs.create(isec, 0, false).unwrap();
        let h = fs.open(isec).unwrap();

        const OLD: usize = 8192;
        assert_eq!(h.write_at(&[0x11u8; OLD], 0), OLD);

        const GROW: usize = 1 << 20;
        let writer = {
            let h = h.clone();
            thread::spawn(move || {
                let big = vec![0x22u8; GROW];
                h.write_at(&big, OLD as u64)
            })
        };

        // The reader straddles the old end of file. Until the writer
        // publishes, it must see exactly the old tail; afterwards, the
        // full request with the writer's bytes and nothing undefined.
        let mut buf = [0u8; 4096];
        loop {
            let n = h.read_at(&mut buf, (OLD - 100) as u64);
            assert!(n == 100 || n == buf.len(), "half-published length: {}", n);
            for (i, b) in buf[..n].iter().enumerate() {
                let expect = if i < 100 { 0x11 } else { 0x22 };
                assert_eq!(*b, expect, "byte {} of a {}-byte read", i, n);
            }
            if n == buf.len() {
                break;
            }
            thread::yield_now();
        }
        assert_eq!(writer.join().unwrap(), GROW);
    }

    #[test]
    fn roundtrips_across_sector_seams() {
        let (fs, _disk, fm) = fixture(64);
        let isec = fm.allocate().unwrap();
        fs.create(isec, 0, false).unwrap();
        let h = fs.open(isec).unwrap();

        let pat: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(h.write_at(&pat, 200), 1500);
        assert_eq!(h.length(), 1700);

        let mut out = vec![0u8; 1500];
        assert_eq!(h.read_at(&mut out, 200), 1500);
        assert_eq!(out, pat);

        // Reads at and past end of file return nothing.
        assert_eq!(h.read_at(&mut out, 1700), 0);
        assert_eq!(h.read_at(&mut out, 9999), 0);
    }

    #[test]
    fn denied_writers_leave_no_trace() {
        let (fs, _disk, fm) = fixture(64);
        let isec = fm.allocate().unwrap();
        fs.create(isec, 0, false).unwrap();
        let h = fs.open(isec).unwrap();

        h.deny_write();
        assert_eq!(h.write_at(b"x", 0), 0);
        assert_eq!(h.length(), 0);

        h.allow_write();
        assert_eq!(h.write_at(b"x", 0), 1);
        assert_eq!(h.length(), 1);
    }

    #[test]
    fn short_write_when_the_free_map_runs_dry() {
        let disk = Arc::new(MemDisk::new(64));
        let fm = Arc::new(SectorMap::new(2, 12));
        let fs = Fs::new(disk.clone(), fm.clone());

        let isec = fm.allocate().unwrap();
        fs.create(isec, 0, false).unwrap();
        let h = fs.open(isec).unwrap();

        // Eleven free sectors: eight direct, the indirect block, and
        // two of its data sectors. The rest of the request is refused.
        assert_eq!(h.write_at(&[0x77u8; 8192], 0), 5120);
        assert_eq!(h.length(), 5120);

        let mut out = vec![0u8; 8192];
        assert_eq!(h.read_at(&mut out, 0), 5120);
        assert!(out[..5120].iter().all(|b| *b == 0x77));

        // Fully exhausted now: further extension writes nothing.
        assert_eq!(h.write_at(b"more", 5120), 0);
    }

    #[test]
    fn open_returns_the_live_instance() {
        let (fs, _disk, fm) = fixture(64);
        let isec = fm.allocate().unwrap();
        fs.create(isec, 0, false).unwrap();

        let h1 = fs.open(isec).unwrap();
        let h2 = fs.open(isec).unwrap();
        assert!(Arc::ptr_eq(&h1.inode, &h2.inode));
        assert_eq!(h1.open_count(), 2);

        assert_eq!(h1.write_at(b"shared", 0), 6);
        assert_eq!(h2.length(), 6);
    }

    #[test]
    fn rejects_sectors_without_an_inode() {
        let (fs, _disk, fm) = fixture(64);
        let junk = fm.allocate().unwrap();
        assert_eq!(fs.open(junk).err(), Some("open: bad inode magic"));
    }

    #[test]
    fn close_persists_grown_metadata() {
        let (fs, disk, fm) = fixture(64);
        let isec = fm.allocate().unwrap();
        fs.create(isec, 0, false).unwrap();

        let h = fs.open(isec).unwrap();
        assert_eq!(h.write_at(&[9u8; 1000], 0), 1000);
        drop(h);

        // The registry entry is gone; a fresh open must still see the
        // grown length.
        let h = fs.open(isec).unwrap();
        assert_eq!(h.length(), 1000);
        drop(h);

        // And after a flush the device itself carries it.
        fs.cache().flush_all(false);
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(isec, &mut raw);
        let length = i32::from_ne_bytes(raw[4..8].try_into().unwrap());
        assert_eq!(length, 1000);
    }

    #[test]
    fn growth_resumes_across_reopen() {
        let (fs, _disk, fm) = fixture(512);
        let isec = fm.allocate().unwrap();
        fs.create(isec, 300, false).unwrap();

        {
            let h = fs.open(isec).unwrap();
            assert_eq!(h.write_at(&[0xa1u8; 4000], 300), 4000);
            assert_eq!(h.length(), 4300);
        }

        // Reopening picks the growth cursors back up mid-index.
        let h = fs.open(isec).unwrap();
        assert_eq!(h.length(), 4300);
        assert_eq!(h.write_at(&vec![0xa2u8; 66_000], 4300), 66_000);
        assert_eq!(h.length(), 70_300);

        let mut out = [0u8; 200];
        assert_eq!(h.read_at(&mut out, 4200), 200);
        assert!(out[..100].iter().all(|b| *b == 0xa1));
        assert!(out[100..].iter().all(|b| *b == 0xa2));
    }

    #[test]
    fn tracks_directory_flag_and_parent() {
        let (fs, _disk, fm) = fixture(64);
        let isec = fm.allocate().unwrap();
        fs.create(isec, 0, true).unwrap();

        let h = fs.open(isec).unwrap();
        assert!(h.is_dir());
        assert_eq!(h.parent(), ROOT_SECTOR);

        fs.add_parent(42, isec).unwrap();
        assert_eq!(h.parent(), 42);
    }
}
