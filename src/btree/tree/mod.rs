mod delete;
mod insert;
mod scan;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::btree::buffer_pool::{BufferPool, PageSet};
use crate::btree::consts::{PageId, LEAF_PAGE, ROOT_PAGE};
use crate::btree::latch_manager::LockMode;
use crate::btree::page::{key_cmp, Page};
use crate::error::{BlinkError, BlinkResult, ErrorKind};

/// Seconds since the epoch, the `tod` stamp recorded on inserted slots.
pub fn tod_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Per-thread handle over a shared buffer pool.
///
/// This is an implementation of the Lehman-Yao B-link tree. Leaf pages are
/// at level 0 and hold record ids; internal pages hold separator keys and
/// child page numbers. Every page carries a right-sibling link, so a
/// descent that misses a concurrent split recovers by sliding right
/// instead of restarting.
///
/// No ancestor stack is kept during descent. A split posts its two fence
/// keys by re-entering `insert` at `level + 1`, retraversing from the
/// root, with the `parent` latch of the split page held across the
/// recursion.
///
/// Deletion tombstones slots and decrements the active count. A page whose
/// active count reaches zero absorbs its right sibling and the sibling is
/// spliced out and freed; its right link is left behind as a forwarding
/// pointer (kill bit set) for readers that already crossed into it. The
/// rightmost page of a level is instead left in place, reusable for keys
/// above the current maximum.
///
/// The handle owns a spare frame used by splits and compaction, and the
/// cursor frame for scans; share the pool, not the handle, across threads.
pub struct BLinkTree {
    mgr: Arc<BufferPool>,
    frame: Vec<u8>,
    cursor: Vec<u8>,
    cursor_page: PageId,
    found: bool,
}

impl BLinkTree {
    pub fn new(mgr: &Arc<BufferPool>) -> Self {
        let page_size = mgr.page_size();
        BLinkTree {
            mgr: Arc::clone(mgr),
            frame: vec![0u8; page_size],
            cursor: vec![0u8; page_size],
            cursor_page: 0,
            found: false,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.mgr
    }

    /// Whether the most recent insert or delete found its key.
    pub fn found(&self) -> bool {
        self.found
    }

    /// Page number currently cached in the scan cursor.
    pub fn cursor_page(&self) -> PageId {
        self.cursor_page
    }

    pub(crate) fn release(&self, mode: LockMode, set: &PageSet) {
        self.mgr.unlock_page(mode, set.latch);
        self.mgr.unpin_latch(set.latch);
        self.mgr.unpin_pool(set.pool);
    }

    /// Look the key up in the leaf level; returns the stored id, or 0 when
    /// the key is absent.
    pub fn find(&mut self, key: &[u8]) -> Result<u64, BlinkError> {
        let (set, slot) = self.mgr.load_page(key, 0, LockMode::Read)?;

        let mut id = 0;
        if !set.page.slot_dead(slot) && key_cmp(set.page.key(slot), key) == Ordering::Equal {
            id = set.page.slot_id(slot);
        }

        self.release(LockMode::Read, &set);
        Ok(id)
    }

    pub(crate) fn cursor_view(&self) -> Page {
        Page::from_ptr(self.cursor.as_ptr() as *mut u8)
    }

    /// Key bytes at the cursor slot.
    pub fn cursor_key(&self, slot: u32) -> Vec<u8> {
        self.cursor_view().key_vec(slot)
    }

    /// Record id at the cursor slot.
    pub fn cursor_id(&self, slot: u32) -> u64 {
        self.cursor_view().slot_id(slot)
    }

    /// The cursor slot as a key/id pair; None for tombstones and for the
    /// stopper slot on the rightmost page.
    pub fn cursor_entry(&self, slot: u32) -> Option<(Vec<u8>, u64)> {
        let cursor = self.cursor_view();
        if slot == 0 || slot > cursor.cnt() {
            return None;
        }
        if cursor.slot_dead(slot) {
            return None;
        }
        if cursor.right() == 0 && slot == cursor.cnt() {
            return None;
        }
        Some((cursor.key_vec(slot), cursor.slot_id(slot)))
    }

    /// Post-quiescence check that every latch set and pool entry is
    /// unpinned and unlocked.
    pub fn latch_audit(&self) -> BlinkResult {
        self.mgr.latch_audit()
    }

    fn struct_err(&self, msg: String) -> BlinkError {
        BlinkError::new(ErrorKind::Struct, &msg)
    }

    /// Verify the structural invariants of the whole tree. Meant for a
    /// quiescent tree; pages are read from their permanent locations, no
    /// latches are taken.
    ///
    /// Checked per page: slot keys strictly ascend, the level matches the
    /// parent's expectation, and the fence equals the separator key the
    /// parent routes through. Checked per level: the right chain visits
    /// exactly the children posted in the level above, in ascending fence
    /// order, ending with a zero right link. Checked globally: the free
    /// list and the reachable set are disjoint and together cover every
    /// allocated page.
    pub fn check_integrity(&mut self) -> BlinkResult {
        let page_size = self.mgr.page_size();
        let high_water = self.mgr.high_water();
        let reserved = self.mgr.reserved_pages();
        let mut buf = vec![0u8; page_size];

        // collect the free list
        let mut free: HashSet<PageId> = HashSet::new();
        let mut page_no = self.mgr.free_head();
        while page_no != 0 {
            if page_no >= high_water {
                return Err(self.struct_err(format!("free page {} above high water", page_no)));
            }
            if !free.insert(page_no) {
                return Err(self.struct_err(format!("free list cycle at page {}", page_no)));
            }
            self.mgr.read_page(&mut buf, page_no)?;
            let page = Page::from_buf(&mut buf);
            if !page.is_free() {
                return Err(self.struct_err(format!("page {} on free list without free bit", page_no)));
            }
            page_no = page.right();
        }

        // walk the levels top down; every level must contain exactly the
        // children its parent level routes to
        let mut reachable: HashSet<PageId> = HashSet::new();
        let mut expected: HashMap<PageId, Vec<u8>> = HashMap::new();
        let mut level_head = ROOT_PAGE;
        let mut parent_level: Option<u32> = None;

        loop {
            let mut next_head: PageId = 0;
            let mut next_expected: HashMap<PageId, Vec<u8>> = HashMap::new();
            let mut page_no = level_head;
            let mut level = 0;
            let mut prev_fence: Option<Vec<u8>> = None;
            let mut first = true;

            while page_no != 0 {
                self.mgr.read_page(&mut buf, page_no)?;
                let page = Page::from_buf(&mut buf);

                if page.is_free() {
                    return Err(self.struct_err(format!("reachable page {} is free", page_no)));
                }
                if page.is_kill() {
                    return Err(self.struct_err(format!("reachable page {} is killed", page_no)));
                }
                if !reachable.insert(page_no) {
                    return Err(self.struct_err(format!("page {} reached twice", page_no)));
                }

                if first {
                    level = page.level();
                    if let Some(parent_level) = parent_level {
                        if level + 1 != parent_level {
                            return Err(self.struct_err(format!(
                                "page {} at level {} under level {}",
                                page_no, level, parent_level
                            )));
                        }
                    }
                    first = false;
                } else if page.level() != level {
                    return Err(self.struct_err(format!(
                        "page {} at level {} in level {} chain",
                        page_no,
                        page.level(),
                        level
                    )));
                }

                if page.cnt() == 0 || page.act() == 0 && page_no != ROOT_PAGE && page.right() != 0 {
                    return Err(self.struct_err(format!("page {} is empty but linked", page_no)));
                }

                // slot keys strictly ascend, tombstones included
                for slot in 1..page.cnt() {
                    if key_cmp(page.key(slot), page.key(slot + 1)) != Ordering::Less {
                        return Err(self.struct_err(format!(
                            "page {} slot {} out of order",
                            page_no, slot
                        )));
                    }
                }

                // the fence must equal the separator the parent routes here
                let fence = page.key_vec(page.cnt());
                if page_no != ROOT_PAGE {
                    match expected.remove(&page_no) {
                        Some(separator) => {
                            if separator != fence {
                                return Err(self.struct_err(format!(
                                    "page {} fence differs from parent separator",
                                    page_no
                                )));
                            }
                        }
                        None => {
                            return Err(self.struct_err(format!(
                                "page {} not posted in its parent level",
                                page_no
                            )));
                        }
                    }
                }

                // right links ascend by fence key
                if let Some(prev) = prev_fence.take() {
                    if key_cmp(&prev, &fence) != Ordering::Less {
                        return Err(self.struct_err(format!(
                            "page {} fence not above left sibling",
                            page_no
                        )));
                    }
                }
                prev_fence = Some(fence);

                // collect the children this page routes to
                if level > 0 {
                    for slot in 1..=page.cnt() {
                        if page.slot_dead(slot) {
                            continue;
                        }
                        let child = page.slot_id(slot);
                        if next_head == 0 {
                            next_head = child;
                        }
                        if next_expected.insert(child, page.key_vec(slot)).is_some() {
                            return Err(self.struct_err(format!(
                                "child page {} posted twice",
                                child
                            )));
                        }
                    }
                }

                page_no = page.right();
            }

            if !expected.is_empty() {
                return Err(self.struct_err(format!(
                    "{} posted children missing from level walk",
                    expected.len()
                )));
            }

            if level == 0 {
                break;
            }
            parent_level = Some(level);
            expected = next_expected;
            level_head = next_head;
        }

        // the free list and the reachable set partition the allocated pages
        for page_no in (ROOT_PAGE..LEAF_PAGE + 1).chain(reserved..high_water) {
            let in_free = free.contains(&page_no);
            let in_tree = reachable.contains(&page_no);
            if in_free && in_tree {
                return Err(self.struct_err(format!("page {} both free and reachable", page_no)));
            }
            if !in_free && !in_tree {
                return Err(self.struct_err(format!("page {} leaked", page_no)));
            }
        }

        debug!(
            "integrity ok: {} reachable pages, {} free, high water {}",
            reachable.len(),
            free.len(),
            high_water
        );
        Ok(())
    }

    /// Dump the tree structure to stdout, one line per page. Debugging
    /// helper for tests; keys print hex-encoded and truncated.
    pub fn draw_tree(&mut self) {
        let page_size = self.mgr.page_size();
        let mut buf = vec![0u8; page_size];
        let mut level_head = ROOT_PAGE;

        loop {
            let mut page_no = level_head;
            let mut next_head: PageId = 0;
            let mut level = 0;

            while page_no != 0 {
                if self.mgr.read_page(&mut buf, page_no).is_err() {
                    println!("page {}: unreadable", page_no);
                    return;
                }
                let page = Page::from_buf(&mut buf);
                level = page.level();

                let mut keys = Vec::new();
                for slot in 1..=page.cnt() {
                    let mut depiction = hex::encode(page.key(slot));
                    depiction.truncate(16);
                    if page.slot_dead(slot) {
                        depiction.push('*');
                    }
                    keys.push(depiction);
                }
                println!(
                    "level {} page {} right {} cnt {} act {}: [{}]",
                    page.level(),
                    page_no,
                    page.right(),
                    page.cnt(),
                    page.act(),
                    keys.join(", ")
                );

                if level > 0 && next_head == 0 {
                    for slot in 1..=page.cnt() {
                        if !page.slot_dead(slot) {
                            next_head = page.slot_id(slot);
                            break;
                        }
                    }
                }
                page_no = page.right();
            }

            if level == 0 || next_head == 0 {
                return;
            }
            level_head = next_head;
        }
    }
}
