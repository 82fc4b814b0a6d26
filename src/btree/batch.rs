use std::{cmp::Ordering, collections::VecDeque, sync::Arc};

use log::debug;

use super::{
    latch::LockMode,
    page::{self, Page, SlotType, BT_ID, MAX_KEY},
    table::BTreeHandle,
};
use crate::error::{ErrorKind, SmallError, SmallResult};

/// Caller-assembled source page of queued mutations for a batched commit.
///
/// Each slot is one pending insert or delete; records live in the same
/// slot-array/heap layout as a tree page so the commit can sort and walk
/// them in place.
pub struct BatchPage {
    data: Vec<u8>,
}

impl BatchPage {
    pub fn new(page_size: usize) -> BatchPage {
        let mut data = vec![0u8; page_size];
        let page = Page::from_bytes_mut(&mut data);
        page.set_min(page_size as u32);
        BatchPage { data }
    }

    pub(crate) fn page(&self) -> &Page {
        Page::from_bytes(&self.data)
    }

    pub(crate) fn page_mut(&mut self) -> &mut Page {
        Page::from_bytes_mut(&mut self.data)
    }

    pub fn cnt(&self) -> u32 {
        self.page().cnt()
    }

    fn add(&mut self, key: &[u8], value: &[u8], typ: SlotType) -> SmallResult {
        if key.is_empty() || key.len() > MAX_KEY || value.len() > 255 {
            return Err(SmallError::new(
                ErrorKind::Overflow,
                "batch key/value size out of range",
            ));
        }

        let page = self.page_mut();
        if !page.fits(key.len(), value.len()) {
            return Err(SmallError::new(ErrorKind::Overflow, "batch page is full"));
        }

        let off = page.push_record(key, value);
        let slot = page.cnt() + 1;
        page.set_slot(slot, off, typ, false);
        page.set_cnt(slot);
        page.set_act(page.act() + 1);
        Ok(())
    }

    pub fn add_insert(&mut self, key: &[u8], value: &[u8]) -> SmallResult {
        self.add(key, value, SlotType::Unique)
    }

    pub fn add_delete(&mut self, key: &[u8]) -> SmallResult {
        self.add(key, b"", SlotType::Delete)
    }
}

// per-mutation lock record
#[derive(Clone, Copy, Default)]
struct BatchLock {
    entry: u32,
    slot: u32,
    reuse: bool,
}

enum FenceOp {
    // post the leaf's fence key into the parent level
    Post,
    // free an emptied master once its parent updates finish
    Free,
}

// pending parent fence-key update, drained in FIFO order
struct FenceUpdate {
    page_no: u64,
    entry: u32,
    op: FenceOp,
    nounlock: bool,
    leafkey: Vec<u8>,
}

impl BTreeHandle {
    /// Atomically apply a batch of keyed mutations.
    ///
    /// Returns 0 on success or the 1-based slot index (into the sorted
    /// source) of a key that violated uniqueness, in which case nothing was
    /// applied. Concurrent readers observe either none or all of the
    /// batch's effects on the leaves it touches.
    pub fn atomic_batch(&mut self, source: &mut BatchPage, unique: bool) -> Result<u32, SmallError> {
        let pool = Arc::clone(&self.pool);
        let schema = Arc::clone(&self.schema);
        let tid = self.thread_no;

        // non-unique batches get their insert keys extended by a fresh
        // duplicate sequence so in-batch duplicates store and scan in
        // allocation order
        let mut rewritten;
        let src: &mut Page = if unique {
            source.page_mut()
        } else {
            rewritten = self.uniquify_source(source)?;
            Page::from_bytes_mut(&mut rewritten)
        };

        let cnt = src.cnt();
        if cnt == 0 {
            return Ok(0);
        }

        // sort the source stably by key so the multi-page lock acquisition
        // order is monotonic and thus deadlock-free
        for i in 2..=cnt {
            let moving = src.slot_word(i);
            let key_i = src.key(i).to_vec();
            let mut idx = i;
            while idx > 1 {
                idx -= 1;
                if schema.compare(&key_i, src.key(idx)) == Ordering::Less {
                    src.copy_slot(idx, idx + 1);
                    src.set_slot_word(idx, moving);
                } else {
                    break;
                }
            }
        }

        // a unique batch may not insert the same key twice
        if unique {
            for i in 2..=cnt {
                if src.slot_type(i) == SlotType::Delete || src.slot_type(i - 1) == SlotType::Delete
                {
                    continue;
                }
                if schema.compare(src.key(i), src.key(i - 1)) == Ordering::Equal {
                    return Ok(i);
                }
            }
        }

        let mut locks = vec![BatchLock::default(); cnt as usize + 1];

        // load the leaf page for each key, group same-page references with
        // the reuse bit, and determine any constraint violations
        let mut cur_entry = 0u32;
        for i in 1..=cnt {
            let key = src.key(i).to_vec();
            let mut slot = 0u32;
            let mut samepage = false;

            if i > 1 {
                // the far right leaf page is a special case
                let latch = pool.latch_entry(cur_entry);
                let pg = pool.map_page(latch);
                samepage = pg.right() == 0
                    || schema.compare(pg.key(pg.cnt()), &key) != Ordering::Less;
                if samepage {
                    slot = page::find_slot(pg, &key, schema.as_ref());
                } else {
                    latch.unlock(LockMode::Read);
                }
            }

            if slot == 0 {
                match self.load_page(&key, 0, LockMode::AtomicRead) {
                    Ok((s, e)) => {
                        slot = s;
                        cur_entry = e;
                        // clear any stale split chain on this leaf
                        pool.latch_entry(e)
                            .split
                            .store(0, std::sync::atomic::Ordering::SeqCst);
                    }
                    Err(e) => {
                        self.release_discovery(&locks, i - 1);
                        return Err(e);
                    }
                }
            }

            let latch = pool.latch_entry(cur_entry);
            let pg = pool.map_page(latch);
            if pg.slot_type(slot) == SlotType::Librarian {
                slot += 1;
            }

            if samepage {
                locks[i as usize] = BatchLock {
                    entry: 0,
                    slot: 0,
                    reuse: true,
                };
            } else {
                locks[i as usize] = BatchLock {
                    entry: cur_entry,
                    slot,
                    reuse: false,
                };
            }

            // an insert whose key is already live is a constraint violation
            match src.slot_type(i) {
                SlotType::Unique | SlotType::Duplicate => {
                    if !pg.slot_dead(slot)
                        && (slot < pg.cnt() || pg.right() != 0)
                        && schema.compare(pg.key(slot), &key) == Ordering::Equal
                    {
                        latch.unlock(LockMode::Read);
                        self.release_discovery(&locks, i);
                        return Ok(i);
                    }
                }
                _ => {}
            }
        }

        // unlock the last discovery read lock
        pool.latch_entry(cur_entry).unlock(LockMode::Read);

        // obtain the write lock for each master page
        for i in 1..=cnt as usize {
            if !locks[i].reuse {
                pool.latch_entry(locks[i].entry).lock(LockMode::Write, tid);
            }
        }

        // apply the mutations page by page from highest key to lowest,
        // processing each page's ops smallest-first, then handle the page's
        // split chain and queue fence-key updates for the parent level
        let mut fences: VecDeque<FenceUpdate> = VecDeque::new();
        let mut samepage_hi = cnt + 1;

        let mut i = cnt;
        while i >= 1 {
            if locks[i as usize].reuse {
                i -= 1;
                continue;
            }

            for idx in i..samepage_hi {
                let r = match src.slot_type(idx) {
                    SlotType::Delete => self.atomic_delete(src, &mut locks, idx),
                    SlotType::Unique | SlotType::Duplicate => {
                        self.atomic_insert(src, &mut locks, idx)
                    }
                    _ => Ok(()),
                };
                if let Err(e) = r {
                    e.show_backtrace();
                    self.release_apply(&locks, i);
                    return Err(e);
                }
            }

            let master_entry = locks[i as usize].entry;
            let master = pool.latch_entry(master_entry);
            samepage_hi = i;

            // pick up all splits from the master page, each one already
            // write-locked by the insert that created it
            let mut prev_entry = master_entry;
            let mut entry = master.split.load(std::sync::atomic::Ordering::SeqCst);

            while entry != 0 {
                let set = pool.latch_entry(entry);
                let next_entry = set.split.load(std::sync::atomic::Ordering::SeqCst);

                let prev_latch = pool.latch_entry(prev_entry);
                let prev_pg = pool.map_page_mut(prev_latch);
                let set_pg = pool.map_page_mut(set);

                // an emptied master deletes itself by undoing its split;
                // note that there are no new left pointers yet
                if prev_pg.act() == 0 {
                    set_pg.set_left(prev_pg.left());
                    prev_pg.copy_from(set_pg);
                    set.lock(LockMode::Delete, tid);
                    pool.free_page(set);
                    prev_latch.set_dirty();
                    entry = next_entry;
                    continue;
                }

                // an emptied split page is unlinked from the chain
                if set_pg.act() == 0 {
                    prev_pg.set_right(set_pg.right());
                    prev_latch
                        .split
                        .store(next_entry, std::sync::atomic::Ordering::SeqCst);
                    set.lock(LockMode::Delete, tid);
                    pool.free_page(set);
                    entry = next_entry;
                    continue;
                }

                // schedule the fence-key update for the settled page
                fences.push_back(FenceUpdate {
                    page_no: prev_latch.page_no(),
                    entry: prev_latch.entry,
                    op: FenceOp::Post,
                    nounlock: false,
                    leafkey: prev_pg.key(prev_pg.cnt()).to_vec(),
                });

                // splice the left link into the split page
                set_pg.set_left(prev_latch.page_no());
                prev_latch.lock(LockMode::Parent, tid);
                prev_latch.unlock(LockMode::Write);

                prev_entry = entry;
                entry = next_entry;
            }

            if master.split.load(std::sync::atomic::Ordering::SeqCst) != 0 {
                // the chain survived: hook the left pointer of the next
                // right sibling onto the last split page
                let prev_latch = pool.latch_entry(prev_entry);
                let right_no = pool.map_page(prev_latch).right();

                if right_no != 0 {
                    let set = match pool.pin_latch(right_no, true) {
                        Ok(set) => set,
                        Err(e) => {
                            master.unlock(LockMode::Atomic);
                            pool.unpin_latch(master);
                            self.release_apply(&locks, i - 1);
                            return Err(e);
                        }
                    };
                    set.lock(LockMode::Write, tid);
                    pool.map_page_mut(set).set_left(prev_latch.page_no());
                    set.set_dirty();
                    set.unlock(LockMode::Write);
                    pool.unpin_latch(set);
                } else {
                    pool.with_page_zero(|zero| zero.left = prev_latch.page_no());
                }

                // process the last page split in the chain
                fences.push_back(FenceUpdate {
                    page_no: prev_latch.page_no(),
                    entry: prev_latch.entry,
                    op: FenceOp::Post,
                    nounlock: false,
                    leafkey: {
                        let pg = pool.map_page(prev_latch);
                        pg.key(pg.cnt()).to_vec()
                    },
                });

                prev_latch.lock(LockMode::Parent, tid);
                prev_latch.unlock(LockMode::Write);

                master.unlock(LockMode::Atomic);
                i -= 1;
                continue;
            }

            // finished if the master page is occupied
            if pool.map_page(master).act() != 0 {
                master.unlock(LockMode::Write);
                master.unlock(LockMode::Atomic);
                pool.unpin_latch(master);
                i -= 1;
                continue;
            }

            // all splits were reversed and the master is empty: remove its
            // fence key now and schedule the page free, which keeps the
            // atomic lock until the deletion completes in the next phase
            let fence_key = {
                let pg = pool.map_page(master);
                pg.key(pg.cnt()).to_vec()
            };

            if let Err(e) = self.delete_key(&fence_key, 1, true) {
                self.release_apply(&locks, i);
                return Err(e);
            }

            fences.push_back(FenceUpdate {
                page_no: master.page_no(),
                entry: master_entry,
                op: FenceOp::Free,
                nounlock: true,
                leafkey: fence_key,
            });

            master.unlock(LockMode::Write);
            i -= 1;
        }

        // drain the fence-key queue against the parent level
        while let Some(update) = fences.pop_front() {
            let latch = pool.latch_entry(update.entry);

            let r = match update.op {
                FenceOp::Post => {
                    let mut value = [0u8; BT_ID];
                    page::put_id(&mut value, update.page_no);
                    self.insert_key(&update.leafkey, &value, 1, true)
                }
                FenceOp::Free => self.atomic_free(update.entry),
            };

            if let Err(e) = r {
                self.release_fences(&fences);
                return Err(e);
            }

            if !update.nounlock {
                latch.unlock(LockMode::Parent);
            }
            pool.unpin_latch(latch);
        }

        debug!("atomic batch of {} keys applied", cnt);
        Ok(0)
    }

    /// Rewrite a non-unique batch source, appending a duplicate sequence to
    /// every insert slot.
    fn uniquify_source(&self, source: &BatchPage) -> Result<Vec<u8>, SmallError> {
        let pool = Arc::clone(&self.pool);
        let src = source.page();
        let cnt = src.cnt();

        // leave headroom for the 6-byte suffixes
        let data_len = source.data.len() + cnt as usize * (BT_ID + 2);
        let mut data = vec![0u8; data_len];
        let out = Page::from_bytes_mut(&mut data);
        out.set_min(data_len as u32);

        for i in 1..=cnt {
            let typ = src.slot_type(i);
            let mut key = src.key(i).to_vec();
            let val = src.val(i);

            let typ = if typ == SlotType::Delete {
                SlotType::Delete
            } else {
                if key.len() + BT_ID > MAX_KEY {
                    return Err(SmallError::new(
                        ErrorKind::Overflow,
                        "batch key too long for a duplicate suffix",
                    ));
                }
                let mut id = [0u8; BT_ID];
                page::put_id(&mut id, pool.next_dup());
                key.extend_from_slice(&id);
                SlotType::Duplicate
            };

            let off = out.push_record(&key, val);
            out.set_slot(i, off, typ, false);
        }
        out.set_cnt(cnt);
        out.set_act(cnt);

        Ok(data)
    }

    /// Determine the actual page holding a batch key, chasing the leaf's
    /// split chain, and return its slot.
    fn atomic_page(
        &mut self,
        src: &Page,
        locks: &mut [BatchLock],
        i: u32,
    ) -> Result<(u32, u32), SmallError> {
        let pool = Arc::clone(&self.pool);
        let schema = Arc::clone(&self.schema);

        let key = src.key(i);
        let mut slot = locks[i as usize].slot;
        let mut entry;

        if i > 1 && locks[i as usize].reuse {
            entry = locks[i as usize - 1].entry;
            slot = 0;
        } else {
            entry = locks[i as usize].entry;
        }

        if slot != 0 {
            return Ok((slot, entry));
        }

        // the slot was zeroed or the lock is reused: find where the key is
        // located on the page or its same-page split chain
        loop {
            let latch = pool.latch_entry(entry);
            let pg = pool.map_page(latch);

            let mut slot = page::find_slot(pg, key, schema.as_ref());
            if slot != 0 {
                if pg.slot_type(slot) == SlotType::Librarian {
                    slot += 1;
                }
                if locks[i as usize].reuse {
                    locks[i as usize].entry = entry;
                }
                return Ok((slot, entry));
            }

            entry = latch.split.load(std::sync::atomic::Ordering::SeqCst);
            if entry == 0 {
                return Err(SmallError::new(
                    ErrorKind::Atomic,
                    "batch key lost from its split chain",
                ));
            }
        }
    }

    /// Apply one queued insert, splitting the target into a chain anchored
    /// in the leaf's latch set when the page fills.
    fn atomic_insert(&mut self, src: &Page, locks: &mut [BatchLock], i: u32) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;

        let key = src.key(i).to_vec();
        let val = src.val(i).to_vec();
        let typ = src.slot_type(i);

        loop {
            let (slot, entry) = self.atomic_page(src, locks, i)?;
            let latch = pool.latch_entry(entry);
            let pg = pool.map_page_mut(latch);

            let room = {
                let frame = Page::from_bytes_mut(&mut self.frame);
                page::clean_page(pg, frame, key.len(), slot, val.len())
            };
            if room != 0 {
                page::insert_slot(pg, room, &key, &val, typ);
                latch.set_dirty();
                return Ok(());
            }

            // splice the new right page into the split chain and
            // write-lock it
            let right_entry = self.split_page(entry)?;
            let right = pool.latch_entry(right_entry);
            right.lock(LockMode::Write, tid);
            right
                .split
                .store(latch.split.load(std::sync::atomic::Ordering::SeqCst),
                       std::sync::atomic::Ordering::SeqCst);
            latch
                .split
                .store(right_entry, std::sync::atomic::Ordering::SeqCst);
            locks[i as usize].slot = 0;
        }
    }

    /// Apply one queued delete by marking the slot dead.
    fn atomic_delete(&mut self, src: &Page, locks: &mut [BatchLock], i: u32) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let schema = Arc::clone(&self.schema);

        let key = src.key(i).to_vec();
        let (slot, entry) = self.atomic_page(src, locks, i)?;

        let latch = pool.latch_entry(entry);
        let pg = pool.map_page_mut(latch);

        if schema.compare(pg.key(slot), &key) != Ordering::Equal || pg.slot_dead(slot) {
            return Ok(());
        }

        let bytes = pg.record_bytes(slot);
        pg.set_slot_dead(slot, true);
        pg.set_garbage(pg.garbage() + bytes);
        pg.set_act(pg.act() - 1);
        latch.set_dirty();
        Ok(())
    }

    /// Delete an emptied master page by pulling its right sibling over it.
    /// The far right page never empties because it always contains the
    /// stopper, and the master still holds its Atomic lock here.
    fn atomic_free(&mut self, entry: u32) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;

        let prev = pool.latch_entry(entry);
        prev.lock(LockMode::Write, tid);
        let prev_pg = pool.map_page_mut(prev);

        // grab the right sibling
        let right_no = prev_pg.right();
        let right = pool.pin_latch(right_no, true)?;
        right.lock(LockMode::Atomic, tid);
        right.lock(LockMode::Write, tid);
        let rpg = pool.map_page_mut(right);

        // pull its contents over the empty page, preserving the master's
        // left link
        rpg.set_left(prev_pg.left());
        prev_pg.copy_from(rpg);

        // forward seekers of the old right sibling to the master
        rpg.set_right(prev.page_no());
        rpg.set_kill(true);
        right.set_dirty();
        prev.set_dirty();

        // remove the searchers' pointer to the right page by switching its
        // fence key to the master page
        let fence = rpg.key(rpg.cnt()).to_vec();
        let mut value = [0u8; BT_ID];
        page::put_id(&mut value, prev.page_no());
        self.insert_key(&fence, &value, 1, true)?;

        // the master page is in good shape, remove its locks
        prev.unlock(LockMode::Atomic);
        prev.unlock(LockMode::Write);

        // fix the new right sibling's left pointer
        let new_right = pool.map_page(prev).right();
        if new_right != 0 {
            let temp = pool.pin_latch(new_right, true)?;
            temp.lock(LockMode::Write, tid);
            pool.map_page_mut(temp).set_left(prev.page_no());
            temp.set_dirty();
            temp.unlock(LockMode::Write);
            pool.unpin_latch(temp);
        } else {
            pool.with_page_zero(|zero| zero.left = prev.page_no());
        }

        // no pointers into the right page remain; free it after the last
        // read access drains
        right.unlock(LockMode::Write);
        right.unlock(LockMode::Atomic);
        right.lock(LockMode::Delete, tid);
        right.lock(LockMode::Write, tid);
        pool.free_page(right);
        Ok(())
    }

    /// Abort during leaf discovery: drop the Atomic locks and pins taken so
    /// far, newest first.
    fn release_discovery(&self, locks: &[BatchLock], upto: u32) {
        let pool = Arc::clone(&self.pool);
        for i in (1..=upto as usize).rev() {
            if locks[i].entry != 0 {
                let latch = pool.latch_entry(locks[i].entry);
                latch.unlock(LockMode::Atomic);
                pool.unpin_latch(latch);
            }
        }
    }

    /// Abort mid-apply: release the Write and Atomic locks still held on
    /// the masters not yet processed.
    fn release_apply(&self, locks: &[BatchLock], upto: u32) {
        let pool = Arc::clone(&self.pool);
        for i in (1..=upto as usize).rev() {
            if !locks[i].reuse && locks[i].entry != 0 {
                let latch = pool.latch_entry(locks[i].entry);
                latch.unlock(LockMode::Write);
                latch.unlock(LockMode::Atomic);
                pool.unpin_latch(latch);
            }
        }
    }

    /// Abort mid-drain: release the Parent locks of the fence updates not
    /// yet applied.
    fn release_fences(&self, fences: &VecDeque<FenceUpdate>) {
        let pool = Arc::clone(&self.pool);
        for update in fences {
            let latch = pool.latch_entry(update.entry);
            if !update.nounlock {
                latch.unlock(LockMode::Parent);
            }
            pool.unpin_latch(latch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page::{PAGE_HDR, SLOT_SIZE};

    #[test]
    fn test_batch_page_builder() {
        let mut batch = BatchPage::new(1024);
        batch.add_insert(b"a", b"1").unwrap();
        batch.add_delete(b"b").unwrap();

        assert_eq!(batch.cnt(), 2);
        let page = batch.page();
        assert_eq!(page.key(1), b"a");
        assert_eq!(page.val(1), b"1");
        assert_eq!(page.slot_type(1), SlotType::Unique);
        assert_eq!(page.key(2), b"b");
        assert_eq!(page.slot_type(2), SlotType::Delete);
    }

    #[test]
    fn test_batch_page_overflow() {
        let mut batch = BatchPage::new(page_floor());
        let mut n = 0;
        loop {
            n += 1;
            let key = format!("key{:06}", n);
            if batch.add_insert(key.as_bytes(), b"v").is_err() {
                break;
            }
        }
        assert!(n > 1);
    }

    fn page_floor() -> usize {
        PAGE_HDR + 16 * SLOT_SIZE + 256
    }
}
