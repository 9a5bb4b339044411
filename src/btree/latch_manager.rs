use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use super::consts::PageId;
use super::latch::SpinLatch;

/// The lock modes a page can be held in. There are five modes over three
/// independent latches per page:
///
/// - `Access` (shared) / `Delete` (exclusive) on the `access` latch:
///   intent to read the page vs. intent to reclaim it.
/// - `Read` / `Write` on the `readwr` latch: the page bytes themselves.
/// - `Parent` (exclusive) on the `parent` latch: posting of this page's
///   fence key into its parent level.
///
/// The sets are independent; holding one does not restrict another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Access,
    Delete,
    Read,
    Write,
    Parent,
}

/// Latch state for one currently-tracked page. A LatchSet is pinned while
/// any thread works with its page and may be rebound to a different page
/// once every pin is gone.
pub struct LatchSet {
    page_no: AtomicU64,
    readwr: SpinLatch,
    access: SpinLatch,
    parent: SpinLatch,
    busy: SpinLatch, // guards slot reuse
    pin: AtomicU32,
    next: AtomicU16, // hash chain links, slot indices
    prev: AtomicU16,
    hash: AtomicU16, // bucket this set is chained in
}

impl LatchSet {
    fn new() -> Self {
        LatchSet {
            page_no: AtomicU64::new(0),
            readwr: SpinLatch::new(),
            access: SpinLatch::new(),
            parent: SpinLatch::new(),
            busy: SpinLatch::new(),
            pin: AtomicU32::new(0),
            next: AtomicU16::new(0),
            prev: AtomicU16::new(0),
            hash: AtomicU16::new(0),
        }
    }

    pub fn page_no(&self) -> PageId {
        self.page_no.load(Ordering::Relaxed)
    }

    pub fn pin_count(&self) -> u32 {
        self.pin.load(Ordering::Relaxed)
    }

    /// True if any of the three page latches is held; diagnostic only.
    pub fn any_locked(&self) -> bool {
        self.readwr.is_locked() || self.access.is_locked() || self.parent.is_locked()
    }

    pub fn lock(&self, mode: LockMode) {
        match mode {
            LockMode::Read => self.readwr.read_lock(),
            LockMode::Write => self.readwr.write_lock(),
            LockMode::Access => self.access.read_lock(),
            LockMode::Delete => self.access.write_lock(),
            LockMode::Parent => self.parent.write_lock(),
        }
    }

    pub fn unlock(&self, mode: LockMode) {
        match mode {
            LockMode::Read => self.readwr.release_read(),
            LockMode::Write => self.readwr.release_write(),
            LockMode::Access => self.access.release_read(),
            LockMode::Delete => self.access.release_write(),
            LockMode::Parent => self.parent.release_write(),
        }
    }
}

struct Bucket {
    slot: AtomicU16, // latch table entry at head of chain
    latch: SpinLatch,
}

/// Fixed-size pool of LatchSets, hash-indexed by page number. Slots are
/// deployed on first use; once every slot is deployed, a rotating cursor
/// reclaims unpinned slots.
pub struct LatchManager {
    buckets: Box<[Bucket]>,
    sets: Box<[LatchSet]>, // slot 0 is never used
    deployed: AtomicU16,
    victim: AtomicU16,
}

impl LatchManager {
    pub fn new(latch_total: usize, hash_size: usize) -> Self {
        let mut buckets = Vec::with_capacity(hash_size);
        for _ in 0..hash_size {
            buckets.push(Bucket {
                slot: AtomicU16::new(0),
                latch: SpinLatch::new(),
            });
        }
        let mut sets = Vec::with_capacity(latch_total);
        for _ in 0..latch_total {
            sets.push(LatchSet::new());
        }
        LatchManager {
            buckets: buckets.into_boxed_slice(),
            sets: sets.into_boxed_slice(),
            deployed: AtomicU16::new(0),
            victim: AtomicU16::new(0),
        }
    }

    pub fn set(&self, entry: u16) -> &LatchSet {
        &self.sets[entry as usize]
    }

    pub fn deployed(&self) -> u16 {
        self.deployed.load(Ordering::Relaxed)
    }

    /// Add the entry to the head of the hash chain at `hash_idx`. The
    /// bucket's latch must be write-held by the caller.
    fn latch_link(&self, hash_idx: usize, entry: u16, page_no: PageId) {
        let set = &self.sets[entry as usize];
        let head = self.buckets[hash_idx].slot.load(Ordering::Relaxed);
        set.next.store(head, Ordering::Relaxed);
        if head != 0 {
            self.sets[head as usize].prev.store(entry, Ordering::Relaxed);
        }
        self.buckets[hash_idx].slot.store(entry, Ordering::Relaxed);
        set.page_no.store(page_no, Ordering::Relaxed);
        set.hash.store(hash_idx as u16, Ordering::Relaxed);
        set.prev.store(0, Ordering::Relaxed);
    }

    /// Walk the chain of `hash_idx` looking for `page_no`; the bucket latch
    /// must be held in either mode.
    fn scan_chain(&self, hash_idx: usize, page_no: PageId) -> u16 {
        let mut slot = self.buckets[hash_idx].slot.load(Ordering::Relaxed);
        while slot != 0 {
            let set = &self.sets[slot as usize];
            if set.page_no.load(Ordering::Relaxed) == page_no {
                break;
            }
            slot = set.next.load(Ordering::Relaxed);
        }
        slot
    }

    /// Find the existing latch set for the page or claim one, returning the
    /// entry index with its pin count incremented. A set with `pin > 0` is
    /// never rebound to a different page.
    pub fn pin_latch(&self, page_no: PageId) -> u16 {
        let hash_idx = (page_no % self.buckets.len() as u64) as usize;

        // fast path under the bucket read latch
        self.buckets[hash_idx].latch.read_lock();
        let slot = self.scan_chain(hash_idx, page_no);
        if slot != 0 {
            self.sets[slot as usize].pin.fetch_add(1, Ordering::Relaxed);
        }
        self.buckets[hash_idx].latch.release_read();
        if slot != 0 {
            return slot;
        }

        // not found: retry under the write latch, we may create an entry
        self.buckets[hash_idx].latch.write_lock();

        let mut avail: u16 = 0;
        let mut slot = self.buckets[hash_idx].slot.load(Ordering::Relaxed);
        while slot != 0 {
            let set = &self.sets[slot as usize];
            if set.page_no.load(Ordering::Relaxed) == page_no {
                break; // might have shown up since we last checked
            }
            if set.pin.load(Ordering::Relaxed) == 0 && avail == 0 {
                avail = slot; // unpinned entry in this chain, reusable
            }
            slot = set.next.load(Ordering::Relaxed);
        }

        // found our entry, or take over an unpinned one from this chain
        if slot != 0 || avail != 0 {
            let slot = if slot != 0 { slot } else { avail };
            let set = &self.sets[slot as usize];
            set.pin.fetch_add(1, Ordering::Relaxed);
            set.page_no.store(page_no, Ordering::Relaxed);
            self.buckets[hash_idx].latch.release_write();
            return slot;
        }

        // deploy a fresh slot if any remain
        let victim = self.deployed.fetch_add(1, Ordering::Relaxed) + 1;
        if (victim as usize) < self.sets.len() {
            let set = &self.sets[victim as usize];
            set.pin.fetch_add(1, Ordering::Relaxed);
            self.latch_link(hash_idx, victim, page_no);
            self.buckets[hash_idx].latch.release_write();
            return victim;
        }
        self.deployed.fetch_sub(1, Ordering::Relaxed);

        // all slots deployed: rotate for an unpinned entry to reuse
        loop {
            let victim =
                (self.victim.fetch_add(1, Ordering::Relaxed) as usize) % self.sets.len();
            if victim == 0 {
                continue;
            }
            let set = &self.sets[victim];

            // take control of the slot away from other threads
            if set.pin.load(Ordering::Relaxed) != 0 || !set.busy.try_write() {
                continue;
            }

            // try the old hash chain; skip the entry if not obtained
            let old_idx = set.hash.load(Ordering::Relaxed) as usize;
            if !self.buckets[old_idx].latch.try_write() {
                set.busy.release_write();
                continue;
            }

            // the set may have been pinned between the two checks above
            if set.pin.load(Ordering::Relaxed) != 0 {
                set.busy.release_write();
                self.buckets[old_idx].latch.release_write();
                continue;
            }

            // unlink the victim from its old chain
            let prev = set.prev.load(Ordering::Relaxed);
            let next = set.next.load(Ordering::Relaxed);
            if prev != 0 {
                self.sets[prev as usize].next.store(next, Ordering::Relaxed);
            } else {
                self.buckets[old_idx].slot.store(next, Ordering::Relaxed);
            }
            if next != 0 {
                self.sets[next as usize].prev.store(prev, Ordering::Relaxed);
            }
            self.buckets[old_idx].latch.release_write();

            set.pin.fetch_add(1, Ordering::Relaxed);
            self.latch_link(hash_idx, victim as u16, page_no);
            self.buckets[hash_idx].latch.release_write();
            set.busy.release_write();
            return victim as u16;
        }
    }

    /// Drop one pin.
    pub fn unpin_latch(&self, entry: u16) {
        self.sets[entry as usize].pin.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pin_reuses_entry() {
        let mgr = LatchManager::new(16, 16);

        let a = mgr.pin_latch(10);
        let b = mgr.pin_latch(10);
        assert_eq!(a, b);
        assert_eq!(mgr.set(a).pin_count(), 2);
        assert_eq!(mgr.set(a).page_no(), 10);

        mgr.unpin_latch(a);
        mgr.unpin_latch(b);
        assert_eq!(mgr.set(a).pin_count(), 0);
    }

    #[test]
    fn test_distinct_pages_distinct_entries() {
        let mgr = LatchManager::new(16, 16);
        let a = mgr.pin_latch(1);
        let b = mgr.pin_latch(2);
        assert_ne!(a, b);
        mgr.unpin_latch(a);
        mgr.unpin_latch(b);
    }

    #[test]
    fn test_eviction_rebinds_unpinned_slot() {
        // 4 sets, slot 0 unused: three usable entries
        let mgr = LatchManager::new(4, 4);

        for page in 1..=3u64 {
            let entry = mgr.pin_latch(page);
            mgr.unpin_latch(entry);
        }

        // all slots deployed and unpinned; a fourth page hashing to an
        // empty bucket must steal a slot from another chain
        let entry = mgr.pin_latch(4);
        assert_eq!(mgr.set(entry).page_no(), 4);
        assert_eq!(mgr.set(entry).pin_count(), 1);
        mgr.unpin_latch(entry);

        // the stolen page can come back through a different slot
        let entry = mgr.pin_latch(1);
        assert_eq!(mgr.set(entry).page_no(), 1);
        mgr.unpin_latch(entry);
    }

    #[test]
    fn test_concurrent_pins() {
        let mgr = Arc::new(LatchManager::new(64, 32));

        let mut threads = vec![];
        for t in 0..8u64 {
            let mgr = mgr.clone();
            threads.push(thread::spawn(move || {
                for i in 0..500u64 {
                    let page = 1 + (t * 7 + i) % 20;
                    let entry = mgr.pin_latch(page);
                    assert_eq!(mgr.set(entry).page_no(), page);
                    mgr.unpin_latch(entry);
                }
            }));
        }
        for handle in threads {
            handle.join().unwrap();
        }

        for entry in 1..=mgr.deployed() {
            assert_eq!(mgr.set(entry).pin_count(), 0);
        }
    }
}
