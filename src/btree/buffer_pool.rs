use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::mem;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicPtr, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};

use super::consts::{
    PageId, LATCH_PAGE, LATCH_TABLE, MAX_PAGE_BITS, MIN_PAGE_BITS, MIN_PAGE_SIZE,
    PAGE_HEADER_SIZE, ROOT_PAGE, STOPPER_KEY,
};
use super::latch::SpinLatch;
use super::latch_manager::{LatchManager, LatchSet, LockMode};
use super::page::Page;
use crate::error::{BlinkError, BlinkResult, ErrorKind};

/// Clock (second chance) bit in a pool entry's pin word.
const CLOCK_BIT: u32 = 0x8000_0000;

/// Allocation page layout: the regular page header at offset 0 carries the
/// high-water next PageId in its `right` field; a second embedded page
/// header at offset 24 carries the free-list head in its `right` field;
/// the latch table geometry follows as three u32 fields.
const ALLOC_NLATCH_OFF: usize = 48;
const ALLOC_TOTAL_OFF: usize = 52;
const ALLOC_HASH_OFF: usize = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Private (copy-on-write) mapping; page writes do not reach the file.
    ReadOnly,
    /// Shared mapping; the file is created if absent.
    ReadWrite,
}

/// One mapped segment of `2^seg_bits` contiguous pages.
struct PoolEntry {
    base: AtomicU64, // mapped base page number
    ptr: AtomicPtr<u8>,
    map: UnsafeCell<Option<MmapMut>>,
    pin: AtomicU32,
    next: AtomicU16,
    prev: AtomicU16,
}

impl PoolEntry {
    fn new() -> Self {
        PoolEntry {
            base: AtomicU64::new(0),
            ptr: AtomicPtr::new(std::ptr::null_mut()),
            map: UnsafeCell::new(None),
            pin: AtomicU32::new(0),
            next: AtomicU16::new(0),
            prev: AtomicU16::new(0),
        }
    }

    fn base(&self) -> PageId {
        self.base.load(Ordering::Relaxed)
    }

    fn set_base(&self, base: PageId) {
        self.base.store(base, Ordering::Relaxed);
    }
}

// `map` is only ever touched while the owning hash bucket's latch is
// write-held.
unsafe impl Sync for PoolEntry {}
unsafe impl Send for PoolEntry {}

struct PoolBucket {
    slot: AtomicU16, // pool entry at head of chain
    latch: SpinLatch,
}

/// The loadpage interface object: a pinned page plus its latch set.
pub struct PageSet {
    pub page_no: PageId,
    pub latch: u16, // latch table entry
    pub pool: u16,  // pool table entry
    pub page: Page,
}

/// Buffer manager over a single index file.
///
/// The file is carved into pages of `2^page_bits` bytes. Pages are mapped
/// in aligned segments of `2^seg_bits` pages; the segment is the mmap and
/// eviction unit. Page 0 is the allocation page, page 1 the root, page 2
/// the initial leaf; the following pages back the latch table, and tree
/// pages come after.
///
/// The pool's own latches protect only the hash chains and the mapping
/// lifecycle; callers must hold the page's latch set (via the latch
/// manager) before touching page bytes.
pub struct BufferPool {
    file: File,
    mode: OpenMode,
    page_size: usize,
    page_bits: u32,
    seg_bits: u32,
    pool_mask: u64, // pages per segment - 1
    pool_max: usize,
    pool_cnt: AtomicU16,  // highest pool entry in use
    evicted: AtomicU32,   // clock hand
    entries: Box<[PoolEntry]>,
    buckets: Box<[PoolBucket]>,
    alloc_lock: SpinLatch,
    alloc_ptr: *mut u8,
    alloc_map: MmapMut,
    latch_mgr: LatchManager,
    nlatch_page: u64,
    zero: Vec<u8>,
}

// alloc_ptr aliases alloc_map and is guarded by alloc_lock.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

impl BufferPool {
    /// Open or create the index file.
    ///
    /// `page_bits` is clamped to the supported range and ignored entirely
    /// when the file already exists (the stored page size wins). `pool_max`
    /// is the number of mappable segments, `seg_bits` the lg of pages per
    /// segment, `hash_size` the pool hash table width.
    pub fn create<P: AsRef<Path>>(
        path: P,
        mode: OpenMode,
        page_bits: u32,
        pool_max: usize,
        seg_bits: u32,
        hash_size: usize,
    ) -> Result<Arc<BufferPool>, BlinkError> {
        let mut bits = page_bits;
        if bits > MAX_PAGE_BITS {
            warn!("page_bits {} too large, defaulting to {}", bits, MAX_PAGE_BITS);
            bits = MAX_PAGE_BITS;
        } else if bits < MIN_PAGE_BITS {
            warn!("page_bits {} too small, defaulting to {}", bits, MIN_PAGE_BITS);
            bits = MIN_PAGE_BITS;
        }

        if pool_max == 0 {
            return Err(BlinkError::new(
                ErrorKind::Map,
                "must specify a buffer pool size",
            ));
        }

        let file = match mode {
            OpenMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path.as_ref()),
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(path.as_ref()),
        }
        .map_err(|e| {
            BlinkError::new(
                ErrorKind::Read,
                &format!("open {}: {}", path.as_ref().display(), e),
            )
        })?;

        let file_size = file
            .metadata()
            .map_err(|e| BlinkError::new(ErrorKind::Read, &e.to_string()))?
            .len();

        // an existing file dictates the page size and latch geometry
        let mut nlatch_page = 0u64;
        let mut latch_total = 0usize;
        let mut latch_hash = 0usize;
        if file_size != 0 {
            let mut head = vec![0u8; MIN_PAGE_SIZE];
            file.read_exact_at(&mut head, 0)
                .map_err(|e| BlinkError::new(ErrorKind::Read, &e.to_string()))?;
            bits = Page::from_buf(&mut head).bits();
            nlatch_page = get_u32(&head, ALLOC_NLATCH_OFF) as u64;
            latch_total = get_u32(&head, ALLOC_TOTAL_OFF) as usize;
            latch_hash = get_u32(&head, ALLOC_HASH_OFF) as usize;
            if bits < MIN_PAGE_BITS || bits > MAX_PAGE_BITS || latch_total == 0 {
                return Err(BlinkError::new(
                    ErrorKind::Struct,
                    "allocation page is corrupt",
                ));
            }
        }

        let page_size = 1usize << bits;

        // segments are at least the mmap alignment unit
        let cache_block = MIN_PAGE_SIZE.max(page_size);
        let mut pool_mask = (cache_block >> bits) as u64;
        pool_mask = pool_mask.saturating_sub(1);
        if (1u64 << seg_bits) > pool_mask {
            pool_mask = (1u64 << seg_bits) - 1;
        }
        let mut seg_bits_eff = 0u32;
        let mut n = pool_mask;
        while n != 0 {
            seg_bits_eff += 1;
            n >>= 1;
        }

        let zero = vec![0u8; page_size];

        if file_size == 0 {
            // initialize an empty tree: allocation page, root, a page of
            // leaves, and the latch backing pages
            let sets_per_page = page_size / mem::size_of::<LatchSet>();
            nlatch_page = (LATCH_TABLE / sets_per_page + 1) as u64;
            latch_total = nlatch_page as usize * sets_per_page;
            latch_hash = latch_total;

            let mut buf = vec![0u8; page_size];
            {
                let alloc = Page::from_buf(&mut buf);
                alloc.set_bits(bits);
                alloc.set_right(LATCH_PAGE + nlatch_page); // high water
            }
            put_u32(&mut buf, ALLOC_NLATCH_OFF, nlatch_page as u32);
            put_u32(&mut buf, ALLOC_TOTAL_OFF, latch_total as u32);
            put_u32(&mut buf, ALLOC_HASH_OFF, latch_hash as u32);
            file.write_all_at(&buf, 0)
                .map_err(|e| BlinkError::new(ErrorKind::Write, &e.to_string()))?;

            // the initial root and leaf each hold one stopper slot
            for level in (0..2u32).rev() {
                let mut buf = vec![0u8; page_size];
                let page = Page::from_buf(&mut buf);
                page.set_bits(bits);
                page.set_level(level);
                page.set_cnt(1);
                page.set_act(1);
                page.set_min(page_size as u32 - 3);
                page.write_key(page_size as u32 - 3, &STOPPER_KEY);
                page.set_slot_off(1, page_size as u32 - 3);
                page.set_slot_id(1, if level != 0 { 2 } else { 0 });
                let page_no = if level != 0 { ROOT_PAGE } else { 2 };
                file.write_all_at(&buf, page_no << bits)
                    .map_err(|e| BlinkError::new(ErrorKind::Write, &e.to_string()))?;
            }

            // clear the latch pages and round out the first segment so a
            // later mmap sees a defined region
            let zero_buf = vec![0u8; page_size];
            let mut last = LATCH_PAGE;
            while last <= ((LATCH_PAGE + nlatch_page) | pool_mask) {
                file.write_all_at(&zero_buf, last << bits)
                    .map_err(|e| BlinkError::new(ErrorKind::Write, &e.to_string()))?;
                last += 1;
            }
        }

        // map the allocation page
        let mut alloc_map = unsafe {
            match mode {
                OpenMode::ReadWrite => MmapOptions::new().len(page_size).map_mut(&file),
                OpenMode::ReadOnly => MmapOptions::new().len(page_size).map_copy(&file),
            }
        }
        .map_err(|e| BlinkError::new(ErrorKind::Map, &format!("mmap alloc page: {}", e)))?;
        let alloc_ptr = alloc_map.as_mut_ptr();

        let mut entries = Vec::with_capacity(pool_max);
        for _ in 0..pool_max {
            entries.push(PoolEntry::new());
        }
        let mut buckets = Vec::with_capacity(hash_size);
        for _ in 0..hash_size {
            buckets.push(PoolBucket {
                slot: AtomicU16::new(0),
                latch: SpinLatch::new(),
            });
        }

        debug!(
            "buffer pool up: page_size {}, {} pages per segment, {} segments",
            page_size,
            pool_mask + 1,
            pool_max,
        );

        Ok(Arc::new(BufferPool {
            file,
            mode,
            page_size,
            page_bits: bits,
            seg_bits: seg_bits_eff,
            pool_mask,
            pool_max,
            pool_cnt: AtomicU16::new(0),
            evicted: AtomicU32::new(0),
            entries: entries.into_boxed_slice(),
            buckets: buckets.into_boxed_slice(),
            alloc_lock: SpinLatch::new(),
            alloc_ptr,
            alloc_map,
            latch_mgr: LatchManager::new(latch_total, latch_hash),
            nlatch_page,
            zero,
        }))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_bits(&self) -> u32 {
        self.page_bits
    }

    /// First tree page number (everything below is reserved).
    pub fn reserved_pages(&self) -> PageId {
        LATCH_PAGE + self.nlatch_page
    }

    /// Flush every live mapping; the maps unmap when the pool drops.
    pub fn close(&self) {
        for slot in 1..self.pool_max {
            let entry = &self.entries[slot];
            if let Some(map) = unsafe { (*entry.map.get()).as_ref() } {
                let _ = map.flush();
            }
        }
        let _ = self.alloc_map.flush();
    }

    // allocation page views; the allocation latch must be held

    fn alloc_head(&self) -> Page {
        Page::from_ptr(self.alloc_ptr)
    }

    fn alloc_free(&self) -> Page {
        Page::from_ptr(unsafe { self.alloc_ptr.add(PAGE_HEADER_SIZE) })
    }

    /// Next PageId past every allocated page.
    pub fn high_water(&self) -> PageId {
        self.alloc_lock.write_lock();
        let id = self.alloc_head().right();
        self.alloc_lock.release_write();
        id
    }

    /// Head of the free-page list, 0 if empty.
    pub fn free_head(&self) -> PageId {
        self.alloc_lock.write_lock();
        let id = self.alloc_free().right();
        self.alloc_lock.release_write();
        id
    }

    // latch manager plumbing

    pub fn latch_mgr(&self) -> &LatchManager {
        &self.latch_mgr
    }

    pub fn pin_latch(&self, page_no: PageId) -> u16 {
        self.latch_mgr.pin_latch(page_no)
    }

    pub fn unpin_latch(&self, entry: u16) {
        self.latch_mgr.unpin_latch(entry);
    }

    pub fn lock_page(&self, mode: LockMode, entry: u16) {
        self.latch_mgr.set(entry).lock(mode);
    }

    pub fn unlock_page(&self, mode: LockMode, entry: u16) {
        self.latch_mgr.set(entry).unlock(mode);
    }

    // segment pool

    /// Map the entry's segment for the given base page. The owning bucket
    /// latch must be write-held.
    fn map_segment(&self, entry: &PoolEntry, base: PageId) -> BlinkResult {
        let off = base << self.page_bits;
        let len = ((self.pool_mask + 1) as usize) << self.page_bits;
        let mut map = unsafe {
            match self.mode {
                OpenMode::ReadWrite => MmapOptions::new().offset(off).len(len).map_mut(&self.file),
                OpenMode::ReadOnly => MmapOptions::new().offset(off).len(len).map_copy(&self.file),
            }
        }
        .map_err(|e| {
            BlinkError::new(ErrorKind::Map, &format!("mmap segment at page {}: {}", base, e))
        })?;
        entry.ptr.store(map.as_mut_ptr(), Ordering::Relaxed);
        unsafe { *entry.map.get() = Some(map) };
        Ok(())
    }

    /// Walk the bucket chain for the segment containing `page_no`. The
    /// bucket latch must be held.
    fn find_pool(&self, base: PageId, hash_idx: usize) -> u16 {
        let mut slot = self.buckets[hash_idx].slot.load(Ordering::Relaxed);
        while slot != 0 {
            let entry = &self.entries[slot as usize];
            if entry.base() == base {
                break;
            }
            slot = entry.next.load(Ordering::Relaxed);
        }
        slot
    }

    /// Add the entry to the head of the bucket chain with one pin and the
    /// clock bit set. The bucket latch must be write-held.
    fn link_hash(&self, slot: u16, base: PageId, hash_idx: usize) {
        let entry = &self.entries[slot as usize];
        entry.prev.store(0, Ordering::Relaxed);
        entry.set_base(base);
        entry.pin.store(CLOCK_BIT + 1, Ordering::Relaxed);

        let head = self.buckets[hash_idx].slot.load(Ordering::Relaxed);
        entry.next.store(head, Ordering::Relaxed);
        if head != 0 {
            self.entries[head as usize].prev.store(slot, Ordering::Relaxed);
        }
        self.buckets[hash_idx].slot.store(slot, Ordering::Relaxed);
    }

    /// Find or place the segment containing the page in the pool,
    /// incrementing its pin.
    pub fn pin_pool(&self, page_no: PageId) -> Result<u16, BlinkError> {
        let base = page_no & !self.pool_mask;
        let hash_idx = ((page_no >> self.seg_bits) % self.buckets.len() as u64) as usize;

        self.buckets[hash_idx].latch.write_lock();

        let slot = self.find_pool(base, hash_idx);
        if slot != 0 {
            let entry = &self.entries[slot as usize];
            entry.pin.fetch_or(CLOCK_BIT, Ordering::Relaxed);
            entry.pin.fetch_add(1, Ordering::Relaxed);
            self.buckets[hash_idx].latch.release_write();
            return Ok(slot);
        }

        // claim a fresh pool entry while any remain
        let slot = self.pool_cnt.fetch_add(1, Ordering::Relaxed) + 1;
        if (slot as usize) < self.pool_max {
            let entry = &self.entries[slot as usize];
            if let Err(e) = self.map_segment(entry, base) {
                self.buckets[hash_idx].latch.release_write();
                return Err(e);
            }
            self.link_hash(slot, base, hash_idx);
            self.buckets[hash_idx].latch.release_write();
            return Ok(slot);
        }
        self.pool_cnt.fetch_sub(1, Ordering::Relaxed);

        // pool table is full: advance the clock over the entries
        loop {
            let victim = (self.evicted.fetch_add(1, Ordering::Relaxed) as usize) % self.pool_max;
            if victim == 0 {
                continue;
            }
            let entry = &self.entries[victim];
            let old_idx = ((entry.base() >> self.seg_bits) % self.buckets.len() as u64) as usize;

            // take the owning bucket without waiting; skip the entry if held
            if !self.buckets[old_idx].latch.try_write() {
                continue;
            }

            // skip pinned or recently-referenced entries
            if entry.pin.load(Ordering::Relaxed) != 0 {
                entry.pin.fetch_and(!CLOCK_BIT, Ordering::Relaxed);
                self.buckets[old_idx].latch.release_write();
                continue;
            }

            // unlink the victim from its chain
            let prev = entry.prev.load(Ordering::Relaxed);
            let next = entry.next.load(Ordering::Relaxed);
            if prev != 0 {
                self.entries[prev as usize].next.store(next, Ordering::Relaxed);
            } else {
                self.buckets[old_idx].slot.store(next, Ordering::Relaxed);
            }
            if next != 0 {
                self.entries[next as usize].prev.store(prev, Ordering::Relaxed);
            }
            self.buckets[old_idx].latch.release_write();

            // drop the old mapping, remap for the requested base
            unsafe { *entry.map.get() = None };
            if let Err(e) = self.map_segment(entry, base) {
                self.buckets[hash_idx].latch.release_write();
                return Err(e);
            }
            self.link_hash(victim as u16, base, hash_idx);
            self.buckets[hash_idx].latch.release_write();
            return Ok(victim as u16);
        }
    }

    /// Drop one pin on the pool entry.
    pub fn unpin_pool(&self, slot: u16) {
        self.entries[slot as usize].pin.fetch_sub(1, Ordering::Relaxed);
    }

    /// Pointer to the page inside its mapped segment.
    pub fn page(&self, slot: u16, page_no: PageId) -> Page {
        let base = self.entries[slot as usize].ptr.load(Ordering::Relaxed);
        let sub = (page_no & self.pool_mask) as usize;
        Page::from_ptr(unsafe { base.add(sub << self.page_bits) })
    }

    // page file I/O

    /// Read a page image from its permanent location.
    pub fn read_page(&self, buf: &mut [u8], page_no: PageId) -> BlinkResult {
        self.file
            .read_exact_at(buf, page_no << self.page_bits)
            .map_err(|e| {
                BlinkError::new(ErrorKind::Read, &format!("read page {}: {}", page_no, e))
            })
    }

    /// Write a page image to its permanent location.
    pub fn write_page(&self, buf: &[u8], page_no: PageId) -> BlinkResult {
        self.file
            .write_all_at(buf, page_no << self.page_bits)
            .map_err(|e| {
                BlinkError::new(ErrorKind::Write, &format!("write page {}: {}", page_no, e))
            })
    }

    // allocation

    /// Allocate a page number and write the template page into it. The
    /// free list is reused first; otherwise the high water mark is bumped.
    pub fn new_page(&self, template: Page) -> Result<PageId, BlinkError> {
        self.alloc_lock.write_lock();
        let result = self.new_page_locked(template);
        self.alloc_lock.release_write();
        result
    }

    fn new_page_locked(&self, template: Page) -> Result<PageId, BlinkError> {
        let mut reuse = false;
        let free_head = self.alloc_free().right();

        let page_no = if free_head != 0 {
            // pop the free list; a free page's right field holds the next
            let slot = self.pin_pool(free_head)?;
            let free_page = self.page(slot, free_head);
            self.alloc_free().set_right(free_page.right());
            self.unpin_pool(slot);
            reuse = true;
            free_head
        } else {
            let next = self.alloc_head().right();
            self.alloc_head().set_right(next + 1);
            next
        };

        self.write_page(template.as_slice(self.page_size), page_no)?;

        // writing the first page of a fresh segment: zero the segment's
        // last page so a later mmap sees a defined region
        if !reuse && self.pool_mask > 0 && page_no & self.pool_mask == 0 {
            self.write_page(&self.zero, page_no | self.pool_mask)?;
        }

        Ok(page_no)
    }

    /// Return the page to the free list. The caller must hold the page
    /// write-locked and delete-locked; every lock and pin is released.
    pub fn free_page(&self, set: &PageSet) {
        self.alloc_lock.write_lock();

        // splice at the head of the free chain
        set.page.set_right(self.alloc_free().right());
        self.alloc_free().set_right(set.page_no);
        set.page.set_free(true);

        self.unlock_page(LockMode::Delete, set.latch);
        self.unlock_page(LockMode::Write, set.latch);
        self.unpin_latch(set.latch);
        self.unpin_pool(set.pool);

        self.alloc_lock.release_write();
    }

    fn release_set(&self, mode: LockMode, latch: u16, pool: u16) {
        self.unlock_page(mode, latch);
        self.unpin_latch(latch);
        self.unpin_pool(pool);
    }

    /// Find and load the page holding `key` at `level`, hand-over-hand from
    /// the root, leaving it locked in `lock_mode`. Returns the pinned page
    /// and the slot for the key within it.
    ///
    /// The `access` latch of each page is acquired before the parent's
    /// locks are released, serializing the descent against page delete.
    pub fn load_page(
        &self,
        key: &[u8],
        level: u32,
        lock_mode: LockMode,
    ) -> Result<(PageSet, u32), BlinkError> {
        let mut page_no = ROOT_PAGE;
        let mut drill: u32 = 0xff;
        let mut prev: Option<(u16, u16, LockMode)> = None;

        while page_no != 0 {
            // lock mode of the drill level; read until we reach our level
            let mode = if drill == level { lock_mode } else { LockMode::Read };

            let latch = self.pin_latch(page_no);
            let pool = match self.pin_pool(page_no) {
                Ok(pool) => pool,
                Err(e) => {
                    self.unpin_latch(latch);
                    if let Some((platch, ppool, pmode)) = prev.take() {
                        self.release_set(pmode, platch, ppool);
                    }
                    return Err(e);
                }
            };
            let page = self.page(pool, page_no);

            // obtain the access lock using lock chaining
            if page_no > ROOT_PAGE {
                self.lock_page(LockMode::Access, latch);
            }

            // release and unpin the parent page
            if let Some((platch, ppool, pmode)) = prev.take() {
                self.unlock_page(pmode, platch);
                self.unpin_latch(platch);
                self.unpin_pool(ppool);
            }

            self.lock_page(mode, latch);

            if page.is_free() {
                if page_no > ROOT_PAGE {
                    self.unlock_page(LockMode::Access, latch);
                }
                self.release_set(mode, latch, pool);
                return Err(BlinkError::new(
                    ErrorKind::Struct,
                    &format!("descent reached free page {}", page_no),
                ));
            }

            if page_no > ROOT_PAGE {
                self.unlock_page(LockMode::Access, latch);
            }

            // re-read and re-lock the root after finding the root level
            if page.level() != drill {
                if page_no != ROOT_PAGE {
                    self.release_set(mode, latch, pool);
                    return Err(BlinkError::new(
                        ErrorKind::Struct,
                        &format!("level != drill below root on page {}", page_no),
                    ));
                }
                drill = page.level();
                if lock_mode != LockMode::Read && drill == level {
                    self.release_set(mode, latch, pool);
                    continue;
                }
            }

            prev = Some((latch, pool, mode));

            if !page.is_kill() {
                let mut slot = page.find_slot(key);
                if slot != 0 {
                    if drill == level {
                        let set = PageSet {
                            page_no,
                            latch,
                            pool,
                            page,
                        };
                        return Ok((set, slot));
                    }

                    // skip dead separators on the way down
                    loop {
                        if !page.slot_dead(slot) {
                            page_no = page.slot_id(slot);
                            drill -= 1;
                            break;
                        }
                        if slot < page.cnt() {
                            slot += 1;
                        } else {
                            slot = 0; // the tail is dead, slide right
                            break;
                        }
                    }
                    if slot != 0 {
                        continue;
                    }
                }
            }

            // the key is past this page, slide right into the next page
            page_no = page.right();
        }

        // broken right chain
        if let Some((platch, ppool, pmode)) = prev.take() {
            self.release_set(pmode, platch, ppool);
        }
        Err(BlinkError::new(
            ErrorKind::Struct,
            "right sibling chain ended during descent",
        ))
    }

    /// Post-quiescence sweep: no latch set or pool entry may remain pinned
    /// or locked once every operation has completed.
    pub fn latch_audit(&self) -> BlinkResult {
        for entry in 1..=self.latch_mgr.deployed() {
            let set = self.latch_mgr.set(entry);
            if set.pin_count() != 0 {
                return Err(BlinkError::new(
                    ErrorKind::Lock,
                    &format!("latchset {} pinned for page {}", entry, set.page_no()),
                ));
            }
            if set.any_locked() {
                return Err(BlinkError::new(
                    ErrorKind::Lock,
                    &format!("latchset {} locked for page {}", entry, set.page_no()),
                ));
            }
        }

        let in_use = (self.pool_cnt.load(Ordering::Relaxed) as usize).min(self.pool_max - 1);
        for slot in 1..=in_use {
            let pin = self.entries[slot].pin.load(Ordering::Relaxed) & !CLOCK_BIT;
            if pin != 0 {
                return Err(BlinkError::new(
                    ErrorKind::Lock,
                    &format!("pool entry {} pinned ({})", slot, pin),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(name: &str) -> Arc<BufferPool> {
        let path = std::env::temp_dir().join(name);
        let _ = std::fs::remove_file(&path);
        BufferPool::create(&path, OpenMode::ReadWrite, 12, 16, 3, 8).unwrap()
    }

    #[test]
    fn test_create_initializes_reserved_pages() {
        let pool = test_pool("bp_create.db");
        assert_eq!(pool.page_size(), 4096);
        assert_eq!(pool.free_head(), 0);
        assert!(pool.high_water() == pool.reserved_pages());

        // the root routes everything to the initial leaf via the stopper
        let mut buf = vec![0u8; 4096];
        pool.read_page(&mut buf, ROOT_PAGE).unwrap();
        let root = Page::from_buf(&mut buf);
        assert_eq!(root.level(), 1);
        assert_eq!(root.cnt(), 1);
        assert_eq!(root.act(), 1);
        assert_eq!(root.right(), 0);
        assert_eq!(root.key(1), &STOPPER_KEY[..]);
        assert_eq!(root.slot_id(1), 2);

        pool.read_page(&mut buf, 2).unwrap();
        let leaf = Page::from_buf(&mut buf);
        assert_eq!(leaf.level(), 0);
        assert_eq!(leaf.cnt(), 1);
        assert_eq!(leaf.key(1), &STOPPER_KEY[..]);
    }

    #[test]
    fn test_pin_pool_shares_segments() {
        let pool = test_pool("bp_pin.db");

        // pages of one segment share a mapping; a far page gets another
        let a = pool.pin_pool(1).unwrap();
        let b = pool.pin_pool(2).unwrap();
        assert_eq!(a, b);
        let c = pool.pin_pool(8).unwrap();
        assert_ne!(a, c);

        pool.unpin_pool(a);
        pool.unpin_pool(b);
        pool.unpin_pool(c);
        pool.latch_audit().unwrap();
    }

    #[test]
    fn test_new_page_reuses_freed_pages() {
        let pool = test_pool("bp_alloc.db");
        let mut template = vec![0u8; 4096];
        let template = Page::from_buf(&mut template);
        template.set_bits(12);
        template.set_cnt(1);
        template.set_act(1);

        let a = pool.new_page(template).unwrap();
        let b = pool.new_page(template).unwrap();
        assert_eq!(a, pool.reserved_pages());
        assert_eq!(b, a + 1);

        // free `a` with the required locks held, then watch it come back
        let latch = pool.pin_latch(a);
        pool.lock_page(LockMode::Delete, latch);
        pool.lock_page(LockMode::Write, latch);
        let slot = pool.pin_pool(a).unwrap();
        let set = PageSet {
            page_no: a,
            latch,
            pool: slot,
            page: pool.page(slot, a),
        };
        pool.free_page(&set);
        assert_eq!(pool.free_head(), a);

        let c = pool.new_page(template).unwrap();
        assert_eq!(c, a);
        assert_eq!(pool.free_head(), 0);
        pool.latch_audit().unwrap();
    }
}
