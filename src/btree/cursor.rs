use std::sync::Arc;

use log::error;

use super::{
    latch::LockMode,
    page::{Page, SlotType, BT_ID, STOPPER},
    table::BTreeHandle,
};
use crate::error::SmallError;

/// Bi-directional cursors: a per-thread snapshot of one leaf page plus the
/// id of that page. Reads latch a leaf only long enough to copy it into the
/// cursor frame, so scans never hold tree latches between calls.
impl BTreeHandle {
    fn cursor_view(&self) -> &Page {
        Page::from_bytes(&self.cursor)
    }

    /// Cache the leaf page that would contain `key` into the cursor and
    /// return the first slot whose key is >= `key`.
    pub fn scan_start(&mut self, key: &[u8]) -> Result<u32, SmallError> {
        let pool = Arc::clone(&self.pool);

        let (slot, entry) = self.load_page(key, 0, LockMode::Read)?;
        let latch = pool.latch_entry(entry);

        self.cursor.copy_from_slice(pool.map_page(latch).data());
        self.cursor_page = latch.page_no();

        latch.unlock(LockMode::Read);
        pool.unpin_latch(latch);
        Ok(slot)
    }

    /// Return the next live slot on the cursor page, or slide the cursor
    /// right into the next page. Returns 0 once the stopper is reached.
    pub fn scan_next(&mut self, mut slot: u32) -> Result<u32, SmallError> {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;

        loop {
            let right = self.cursor_view().right();
            let cnt = self.cursor_view().cnt();

            while slot < cnt {
                slot += 1;
                if self.cursor_view().slot_dead(slot) {
                    continue;
                }
                // skip the infinite stopper on the rightmost page
                if right != 0 || slot < cnt {
                    return Ok(slot);
                }
                break;
            }

            if right == 0 {
                return Ok(0);
            }

            self.cursor_page = right;

            let latch = pool.pin_latch(right, true)?;
            latch.lock(LockMode::Read, tid);
            self.cursor.copy_from_slice(pool.map_page(latch).data());
            latch.unlock(LockMode::Read);
            pool.unpin_latch(latch);

            slot = 0;
        }
    }

    /// Position the cursor on the rightmost leaf and return its highest
    /// live slot, or 0 when the tree is empty.
    pub fn scan_last(&mut self) -> Result<u32, SmallError> {
        let slot = self.scan_start(&STOPPER)?;
        self.scan_prev(slot)
    }

    /// Return the previous live slot on the cursor page, or slide the
    /// cursor left. After sliding, the walk re-reads right links until it
    /// sees the page it came from, guarding against a concurrent page
    /// delete substituting a kill-page into the chain.
    pub fn scan_prev(&mut self, mut slot: u32) -> Result<u32, SmallError> {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;

        loop {
            while slot > 1 {
                slot -= 1;
                if !self.cursor_view().slot_dead(slot) {
                    return Ok(slot);
                }
            }

            let us = self.cursor_page;
            let ourright = self.cursor_view().right();

            let mut next = self.cursor_view().left();
            if next == 0 {
                return Ok(0);
            }

            // find ourselves from the left neighbor
            loop {
                self.cursor_page = next;

                let latch = pool.pin_latch(next, true)?;
                latch.lock(LockMode::Read, tid);
                self.cursor.copy_from_slice(pool.map_page(latch).data());
                latch.unlock(LockMode::Read);
                pool.unpin_latch(latch);

                next = self.cursor_view().right();

                if self.cursor_view().kill() {
                    continue;
                }
                if next == us {
                    break;
                }
                if next == ourright {
                    // slid too far; follow this page's own left link
                    next = self.cursor_view().left();
                    if next == 0 {
                        return Ok(0);
                    }
                }
            }

            slot = self.cursor_view().cnt() + 1;
        }
    }

    /// Page number of the leaf currently cached in the cursor.
    pub fn cursor_page_no(&self) -> u64 {
        self.cursor_page
    }

    /// Key bytes at a cursor slot, with any duplicate sequence stripped.
    pub fn cursor_key(&self, slot: u32) -> &[u8] {
        let page = self.cursor_view();
        let key = page.key(slot);
        if page.slot_type(slot) == SlotType::Duplicate {
            &key[..key.len() - BT_ID]
        } else {
            key
        }
    }

    /// Value bytes at a cursor slot.
    pub fn cursor_val(&self, slot: u32) -> &[u8] {
        self.cursor_view().val(slot)
    }

    /// Whether a cursor slot holds a live, non-stopper record.
    fn cursor_live(&self, slot: u32) -> bool {
        let page = self.cursor_view();
        if slot == 0 || slot > page.cnt() || page.slot_dead(slot) {
            return false;
        }
        // the stopper terminates the rightmost page
        !(page.right() == 0 && slot == page.cnt())
    }

    /// Ordered forward iteration starting at the first key >= `key`.
    pub fn iter_from(&mut self, key: &[u8]) -> Result<BTreeKeyIterator<'_>, SmallError> {
        let slot = self.scan_start(key)?;
        Ok(BTreeKeyIterator {
            handle: self,
            slot,
            fresh: true,
        })
    }
}

/// Ordered key/value iteration over the leaf chain through a handle's
/// cursor. Each item is a private copy; the iterator never holds latches
/// between steps.
pub struct BTreeKeyIterator<'h> {
    handle: &'h mut BTreeHandle,
    slot: u32,
    fresh: bool,
}

impl<'h> Iterator for BTreeKeyIterator<'h> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.fresh {
            self.fresh = false;
            if self.handle.cursor_live(self.slot) {
                let key = self.handle.cursor_key(self.slot).to_vec();
                let val = self.handle.cursor_val(self.slot).to_vec();
                return Some((key, val));
            }
            if self.slot == 0 {
                return None;
            }
        }

        match self.handle.scan_next(self.slot) {
            Ok(0) => None,
            Ok(slot) => {
                self.slot = slot;
                let key = self.handle.cursor_key(slot).to_vec();
                let val = self.handle.cursor_val(slot).to_vec();
                Some((key, val))
            }
            Err(e) => {
                error!("scan aborted: {}", e);
                None
            }
        }
    }
}
