use std::cmp::Ordering;

use super::{tod_now, BLinkTree};
use crate::btree::buffer_pool::PageSet;
use crate::btree::latch_manager::LockMode;
use crate::btree::consts::ROOT_PAGE;
use crate::btree::page::key_cmp;
use crate::error::{BlinkError, BlinkResult, ErrorKind};

/// delete-related methods
impl BLinkTree {
    /// Find and delete the key at the given level by tombstoning its slot.
    /// Deleting a missing key is not an error; `found()` reports whether
    /// the key was present.
    ///
    /// A page whose last active key disappears absorbs its right sibling
    /// and the sibling is freed. The rightmost page of a level is instead
    /// retained, empty, for keys above the current maximum.
    pub fn delete(&mut self, key: &[u8], level: u32) -> BlinkResult {
        let (set, slot) = self.mgr.load_page(key, level, LockMode::Write)?;
        let page = set.page;

        // are we deleting a fence slot?
        let fence = slot == page.cnt();

        // tombstone the key if it is present and alive
        let mut dirty = false;
        let mut found = key_cmp(page.key(slot), key) == Ordering::Equal;
        if found {
            found = !page.slot_dead(slot);
            if found {
                dirty = true;
                page.set_slot_dead(slot, true);
                page.set_dirty(true);
                page.set_act(page.act() - 1);

                // collapse dead slots sitting under the fence
                loop {
                    let idx = page.cnt() - 1;
                    if idx == 0 || !page.slot_dead(idx) {
                        break;
                    }
                    page.copy_slot(idx + 1, idx);
                    page.clear_slot(page.cnt());
                    page.set_cnt(page.cnt() - 1);
                }
            }
        }

        // a deleted fence on an internal page changes the separator the
        // parent must route through
        if dirty && level > 0 && page.act() > 0 && fence {
            self.fix_fence(set, level)?;
            self.found = found;
            return Ok(());
        }

        // a root with a single child loses a level
        if level > 1 && set.page_no == ROOT_PAGE && page.act() == 1 {
            self.collapse_root(set)?;
            self.found = found;
            return Ok(());
        }

        // the page still carries active keys, done
        if page.act() > 0 {
            self.release(LockMode::Write, &set);
            self.found = found;
            return Ok(());
        }

        // an empty rightmost page stays in place, reusable for keys above
        // the current maximum; it is never merged or freed
        if page.right() == 0 {
            self.release(LockMode::Write, &set);
            self.found = found;
            return Ok(());
        }

        self.merge_right(set, level)?;
        self.found = found;
        Ok(())
    }

    /// A fence key was deleted from an internal page: pull the fence slot
    /// out and push the new (smaller) fence value upstairs, then delete the
    /// old separator upstairs. The page's `parent` latch is held across
    /// both postings.
    fn fix_fence(&mut self, set: PageSet, level: u32) -> BlinkResult {
        let page = set.page;

        // remove the dead fence slot, remembering both fence values
        let right_key = page.key_vec(page.cnt());
        page.clear_slot(page.cnt());
        page.set_cnt(page.cnt() - 1);
        page.set_dirty(true);
        let left_key = page.key_vec(page.cnt());
        let page_no = set.page_no;

        self.mgr.lock_page(LockMode::Parent, set.latch);
        self.mgr.unlock_page(LockMode::Write, set.latch);

        let tod = tod_now();

        // insert the new fence upstairs
        self.insert(&left_key, level + 1, page_no, tod)?;

        // delete the old fence upstairs
        self.delete(&right_key, level + 1)?;

        self.mgr.unlock_page(LockMode::Parent, set.latch);
        self.mgr.unpin_latch(set.latch);
        self.mgr.unpin_pool(set.pool);
        Ok(())
    }

    /// The root holds a single child: copy the child over the root and
    /// free it, repeatedly, until the root branches again or the tree is
    /// two levels deep. The root's page number never changes.
    fn collapse_root(&mut self, root: PageSet) -> BlinkResult {
        let page_size = self.mgr.page_size();

        loop {
            // find the only live child entry
            let mut idx = 1;
            while root.page.slot_dead(idx) {
                idx += 1;
            }
            let child_no = root.page.slot_id(idx);

            // the delete lock waits out readers holding access intent
            let child_latch = self.mgr.pin_latch(child_no);
            self.mgr.lock_page(LockMode::Delete, child_latch);
            self.mgr.lock_page(LockMode::Write, child_latch);

            let child_pool = match self.mgr.pin_pool(child_no) {
                Ok(pool) => pool,
                Err(e) => {
                    self.mgr.unlock_page(LockMode::Delete, child_latch);
                    self.mgr.unlock_page(LockMode::Write, child_latch);
                    self.mgr.unpin_latch(child_latch);
                    self.release(LockMode::Write, &root);
                    return Err(e);
                }
            };
            let child_page = self.mgr.page(child_pool, child_no);

            // promote the child contents and free the child
            root.page.copy_from(child_page, page_size);
            let child = PageSet {
                page_no: child_no,
                latch: child_latch,
                pool: child_pool,
                page: child_page,
            };
            self.mgr.free_page(&child);

            if !(root.page.level() > 1 && root.page.act() == 1) {
                break;
            }
        }

        self.release(LockMode::Write, &root);
        Ok(())
    }

    /// The page is empty: absorb the right sibling. The sibling's contents
    /// move into this page, the sibling is marked killed with its right
    /// link pointing back here as a forwarding pointer, the parent level
    /// swaps its separators, and the sibling goes to the free list.
    fn merge_right(&mut self, set: PageSet, level: u32) -> BlinkResult {
        let page_size = self.mgr.page_size();
        let page = set.page;

        // cache a copy of our fence key to delete in the parent
        let lower_fence = page.key_vec(page.cnt());

        // obtain a write lock on the right sibling
        let right_no = page.right();
        let right_latch = self.mgr.pin_latch(right_no);
        self.mgr.lock_page(LockMode::Write, right_latch);

        let right_pool = match self.mgr.pin_pool(right_no) {
            Ok(pool) => pool,
            Err(e) => {
                self.mgr.unlock_page(LockMode::Write, right_latch);
                self.mgr.unpin_latch(right_latch);
                self.release(LockMode::Write, &set);
                return Err(e);
            }
        };
        let right_page = self.mgr.page(right_pool, right_no);

        if right_page.is_kill() {
            self.mgr.unlock_page(LockMode::Write, right_latch);
            self.mgr.unpin_latch(right_latch);
            self.mgr.unpin_pool(right_pool);
            self.release(LockMode::Write, &set);
            return Err(BlinkError::new(
                ErrorKind::Struct,
                &format!("right sibling {} already killed", right_no),
            ));
        }

        // pull the contents of the right peer into our empty page
        page.copy_from(right_page, page_size);

        // cache a copy of the sibling's fence to rebind in the parent
        let higher_fence = right_page.key_vec(right_page.cnt());

        // mark the sibling deleted and point it back at us until the
        // parent updates are posted
        right_page.set_right(set.page_no);
        right_page.set_kill(true);

        self.mgr.lock_page(LockMode::Parent, right_latch);
        self.mgr.unlock_page(LockMode::Write, right_latch);
        self.mgr.lock_page(LockMode::Parent, set.latch);
        self.mgr.unlock_page(LockMode::Write, set.latch);

        let tod = tod_now();

        // redirect the higher separator to our page, which now holds the
        // sibling's keys
        self.insert(&higher_fence, level + 1, set.page_no, tod)?;

        // delete the old lower separator bound to our page
        self.delete(&lower_fence, level + 1)?;

        // wait out readers crossing the sibling, then reclaim it
        self.mgr.unlock_page(LockMode::Parent, right_latch);
        self.mgr.lock_page(LockMode::Delete, right_latch);
        self.mgr.lock_page(LockMode::Write, right_latch);
        let right = PageSet {
            page_no: right_no,
            latch: right_latch,
            pool: right_pool,
            page: right_page,
        };
        self.mgr.free_page(&right);

        self.mgr.unlock_page(LockMode::Parent, set.latch);
        self.mgr.unpin_latch(set.latch);
        self.mgr.unpin_pool(set.pool);
        Ok(())
    }
}
