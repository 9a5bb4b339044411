use super::BLinkTree;
use crate::btree::latch_manager::LockMode;
use crate::btree::page::Page;
use crate::error::BlinkError;

/// scan cursor methods
///
/// The cursor is a point-in-time copy of one leaf page in the handle's
/// cursor frame. Updates that land on the page after the copy are not
/// observed until the cursor slides into the next page.
impl BLinkTree {
    /// Cache the leaf page containing `key` into the cursor and return the
    /// slot of the least key at or above it. Use `cursor_entry` to read
    /// the slot; it filters tombstones and the stopper.
    pub fn start_scan(&mut self, key: &[u8]) -> Result<u32, BlinkError> {
        let (set, slot) = self.mgr.load_page(key, 0, LockMode::Read)?;

        let page_size = self.mgr.page_size();
        Page::from_buf(&mut self.cursor).copy_from(set.page, page_size);
        self.cursor_page = set.page_no;

        self.release(LockMode::Read, &set);
        Ok(slot)
    }

    /// Advance past `slot` to the next live key, sliding right into the
    /// next leaf when the cursor page is exhausted. Returns 0 at the end
    /// of the index.
    pub fn next_scan(&mut self, slot: u32) -> Result<u32, BlinkError> {
        let page_size = self.mgr.page_size();
        let mut slot = slot;

        loop {
            let cursor = self.cursor_view();
            let right = cursor.right();
            let cnt = cursor.cnt();

            while slot < cnt {
                slot += 1;
                if cursor.slot_dead(slot) {
                    continue;
                }
                // the stopper on the rightmost page ends the scan
                if right != 0 || slot < cnt {
                    return Ok(slot);
                }
                break;
            }

            if right == 0 {
                return Ok(0);
            }

            // slide the cursor into the right sibling
            self.cursor_page = right;
            let pool = self.mgr.pin_pool(right)?;
            let page = self.mgr.page(pool, right);
            let latch = self.mgr.pin_latch(right);
            self.mgr.lock_page(LockMode::Read, latch);

            Page::from_buf(&mut self.cursor).copy_from(page, page_size);

            self.mgr.unlock_page(LockMode::Read, latch);
            self.mgr.unpin_latch(latch);
            self.mgr.unpin_pool(pool);
            slot = 0;
        }
    }
}
