use std::cmp::Ordering;

use super::{tod_now, BLinkTree};
use crate::btree::buffer_pool::PageSet;
use crate::btree::consts::{PageId, MAX_KEY_LEN, PAGE_HEADER_SIZE, ROOT_PAGE, SLOT_SIZE, STOPPER_KEY};
use crate::btree::latch_manager::LockMode;
use crate::btree::page::{key_cmp, Page};
use crate::error::{BlinkError, BlinkResult, ErrorKind};

/// insert-related methods
impl BLinkTree {
    /// Insert a key at the given level, binding it to `id`. Level 0 is the
    /// leaf level; splits re-enter at `level + 1` to post separator keys.
    ///
    /// Inserting a key that already exists overwrites the stored id in
    /// place and revives a tombstoned slot.
    pub fn insert(&mut self, key: &[u8], level: u32, id: u64, tod: u32) -> BlinkResult {
        if key.len() > MAX_KEY_LEN {
            return Err(BlinkError::new(
                ErrorKind::Ovflw,
                &format!("key of {} bytes exceeds the maximum", key.len()),
            ));
        }

        loop {
            let (set, found_slot) = self.mgr.load_page(key, level, LockMode::Write)?;
            let page = set.page;

            // an existing key updates its slot in place
            if key_cmp(page.key(found_slot), key) == Ordering::Equal {
                if page.slot_dead(found_slot) {
                    page.set_act(page.act() + 1);
                }
                page.set_slot_dead(found_slot, false);
                page.set_slot_tod(found_slot, tod);
                page.set_slot_id(found_slot, id);
                self.release(LockMode::Write, &set);
                return Ok(());
            }

            // make room on the page, splitting as long as it stays full
            let slot = self.clean_page(page, key.len(), found_slot);
            if slot == 0 {
                self.split_page(set)?;
                continue;
            }

            // copy the key into the heap, which grows downward
            let min = page.min() - (key.len() as u32 + 1);
            page.write_key(min, key);
            page.set_min(min);

            // look for a dead slot at or above the insert point to reuse
            let cnt = page.cnt();
            let mut idx = slot;
            while idx < cnt {
                if page.slot_dead(idx) {
                    break;
                }
                idx += 1;
            }

            // no dead slot downstream: append to the slot array
            if idx == cnt {
                idx += 1;
                page.set_cnt(cnt + 1);
            }
            page.set_act(page.act() + 1);

            // shift the slots down one until the vacancy reaches our slot
            while idx > slot {
                page.copy_slot(idx - 1, idx);
                idx -= 1;
            }

            page.set_slot_id(slot, id);
            page.set_slot_off(slot, min);
            page.set_slot_tod(slot, tod);
            page.set_slot_dead(slot, false);

            self.release(LockMode::Write, &set);
            return Ok(());
        }
    }

    /// Check the page for room for one more slot plus the pending key,
    /// compacting tombstones when possible. Returns the slot's position
    /// after compaction, or 0 when the page has to split.
    pub(crate) fn clean_page(&mut self, page: Page, keylen: usize, slot: u32) -> u32 {
        let page_size = self.mgr.page_size();
        let max = page.cnt();

        let room =
            |cnt: u32| (PAGE_HEADER_SIZE + (cnt as usize + 1) * SLOT_SIZE + keylen + 1) as u32;

        if page.min() >= room(max) {
            return slot;
        }

        // nothing to reclaim without tombstones
        if !page.is_dirty() {
            return 0;
        }

        let frame = Page::from_buf(&mut self.frame);
        frame.copy_from(page, page_size);

        // keep the page info, zero the rest and repack
        page.zero_body(page_size);
        page.set_dirty(false);
        page.set_act(0);

        let mut newslot = max;
        let mut nxt = page_size as u32;
        let mut idx = 0u32;
        let mut cnt = 0u32;

        while cnt < max {
            cnt += 1;
            if cnt == slot {
                newslot = idx + 1;
            }
            // drop dead slots, except a dead fence which must survive
            if cnt < max && frame.slot_dead(cnt) {
                continue;
            }

            let key = frame.key(cnt);
            nxt -= key.len() as u32 + 1;
            page.write_key(nxt, key);

            idx += 1;
            page.set_slot_id(idx, frame.slot_id(cnt));
            if frame.slot_dead(cnt) {
                page.set_slot_dead(idx, true);
            } else {
                page.set_act(page.act() + 1);
            }
            page.set_slot_tod(idx, frame.slot_tod(cnt));
            page.set_slot_off(idx, nxt);
        }

        page.set_min(nxt);
        page.set_cnt(idx);

        // enough space now, or does the page need to split?
        if page.min() >= room(idx) {
            return newslot;
        }
        0
    }

    /// Split the write-locked full page, posting both fence keys at the
    /// parent level. The page set is fully released on return.
    pub(crate) fn split_page(&mut self, set: PageSet) -> BlinkResult {
        let page_size = self.mgr.page_size();
        let page = set.page;
        let level = page.level();
        let max = page.cnt();

        // move the higher half of the keys into a spare frame
        for byte in self.frame.iter_mut() {
            *byte = 0;
        }
        let frame = Page::from_buf(&mut self.frame);
        let mut cnt = max / 2;
        let mut idx = 0u32;
        let mut nxt = page_size as u32;

        while cnt < max {
            cnt += 1;
            let key = page.key(cnt);
            nxt -= key.len() as u32 + 1;
            frame.write_key(nxt, key);

            idx += 1;
            frame.set_slot_id(idx, page.slot_id(cnt));
            if page.slot_dead(cnt) {
                frame.set_slot_dead(idx, true);
            } else {
                frame.set_act(frame.act() + 1);
            }
            frame.set_slot_tod(idx, page.slot_tod(cnt));
            frame.set_slot_off(idx, nxt);
        }

        // the existing fence moves to the new page on the right
        let right_key = page.key_vec(max);

        frame.set_bits(self.mgr.page_bits());
        frame.set_min(nxt);
        frame.set_cnt(idx);
        frame.set_level(level);

        // link the right sibling; the root has none
        if set.page_no > ROOT_PAGE {
            frame.set_right(page.right());
        }

        // get a new free page and write the higher keys into it
        let right_no = match self.mgr.new_page(frame) {
            Ok(page_no) => page_no,
            Err(e) => {
                self.release(LockMode::Write, &set);
                return Err(e);
            }
        };

        // update the lower keys to continue in the old page
        frame.copy_from(page, page_size);
        page.zero_body(page_size);
        page.set_dirty(false);
        page.set_act(0);

        let mut nxt = page_size as u32;
        let mut idx = 0u32;
        let mut cnt = 0u32;

        // assemble a page of smaller keys
        while cnt < max / 2 {
            cnt += 1;
            let key = frame.key(cnt);
            nxt -= key.len() as u32 + 1;
            page.write_key(nxt, key);

            idx += 1;
            page.set_slot_id(idx, frame.slot_id(cnt));
            page.set_slot_tod(idx, frame.slot_tod(cnt));
            page.set_slot_off(idx, nxt);
            page.set_act(page.act() + 1);
        }

        // remember the fence key for the smaller page
        let fence_key = page.key_vec(idx);
        page.set_right(right_no);
        page.set_min(nxt);
        page.set_cnt(idx);

        // a split root raises the height of the tree instead
        if set.page_no == ROOT_PAGE {
            return self.split_root(set, &fence_key, right_no);
        }

        // hold both parent latches across the fence posting; readwr on the
        // split page is released first, the recursion relocks at level + 1
        let right_latch = self.mgr.pin_latch(right_no);
        self.mgr.lock_page(LockMode::Parent, right_latch);
        self.mgr.lock_page(LockMode::Parent, set.latch);
        self.mgr.unlock_page(LockMode::Write, set.latch);

        let tod = tod_now();

        // insert a new fence for the reformulated left block of smaller keys
        self.insert(&fence_key, level + 1, set.page_no, tod)?;

        // switch the old fence over to the new right block of larger keys
        self.insert(&right_key, level + 1, right_no, tod)?;

        self.mgr.unlock_page(LockMode::Parent, set.latch);
        self.mgr.unpin_latch(set.latch);
        self.mgr.unpin_pool(set.pool);
        self.mgr.unlock_page(LockMode::Parent, right_latch);
        self.mgr.unpin_latch(right_latch);
        Ok(())
    }

    /// Split the root and raise the height of the tree. The root keeps its
    /// page number; its lower half moves to a fresh page and the new root
    /// routes to the two halves.
    fn split_root(
        &mut self,
        root: PageSet,
        left_key: &[u8],
        right_no: PageId,
    ) -> BlinkResult {
        let page_size = self.mgr.page_size();
        let page = root.page;
        let mut nxt = page_size as u32;

        // obtain a fresh page and copy the lower keys into it
        let left_no = match self.mgr.new_page(page) {
            Ok(page_no) => page_no,
            Err(e) => {
                self.release(LockMode::Write, &root);
                return Err(e);
            }
        };

        // keep the page info, zero the rest
        page.zero_body(page_size);

        // the lower block's fence routes to the copied page
        nxt -= left_key.len() as u32 + 1;
        page.write_key(nxt, left_key);
        page.set_slot_id(1, left_no);
        page.set_slot_off(1, nxt);

        // the stopper routes to the block of larger keys
        nxt -= STOPPER_KEY.len() as u32 + 1;
        page.write_key(nxt, &STOPPER_KEY);
        page.set_slot_id(2, right_no);
        page.set_slot_off(2, nxt);

        page.set_right(0);
        page.set_min(nxt);
        page.set_cnt(2);
        page.set_act(2);
        page.set_level(page.level() + 1);

        self.release(LockMode::Write, &root);
        Ok(())
    }
}
