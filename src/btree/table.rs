use std::{cmp::Ordering, path::Path, sync::Arc};

use log::debug;

use super::{
    buffer_pool::BufferPool,
    latch::LockMode,
    page::{
        self, Page, SlotType, BT_ID, KEY_HDR, MAX_KEY, ROOT_PAGE, SLOT_SIZE, STOPPER, VAL_HDR,
    },
};
use crate::{
    error::{ErrorKind, SmallError, SmallResult},
    schema::{BytesSchema, KeySchema},
};

/// B+ tree index over one backing file.
///
/// The index is a thin shared handle; all operations run through a
/// per-thread [`BTreeHandle`] which carries the scratch and cursor frames.
pub struct BTreeIndex {
    pool: Arc<BufferPool>,
    schema: Arc<dyn KeySchema>,
}

impl Clone for BTreeIndex {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            schema: Arc::clone(&self.schema),
        }
    }
}

impl BTreeIndex {
    /// Open or create an index file with the given key schema.
    pub fn open<P: AsRef<Path>>(
        path: P,
        page_bits: u8,
        pool_frames: usize,
        schema: Arc<dyn KeySchema>,
    ) -> Result<BTreeIndex, SmallError> {
        let pool = BufferPool::open(path, page_bits, pool_frames)?;
        Ok(BTreeIndex {
            pool: Arc::new(pool),
            schema,
        })
    }

    /// Open with plain byte-ordered keys.
    pub fn open_bytes<P: AsRef<Path>>(
        path: P,
        page_bits: u8,
        pool_frames: usize,
    ) -> Result<BTreeIndex, SmallError> {
        Self::open(path, page_bits, pool_frames, Arc::new(BytesSchema))
    }

    /// Per-thread access handle.
    pub fn handle(&self) -> BTreeHandle {
        let page_size = self.pool.page_size();
        BTreeHandle {
            pool: Arc::clone(&self.pool),
            schema: Arc::clone(&self.schema),
            frame: vec![0u8; page_size],
            cursor: vec![0u8; page_size],
            cursor_page: 0,
            thread_no: self.pool.next_thread_no(),
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Flush dirty pool pages and sync the file.
    pub fn close(&self) -> SmallResult {
        self.pool.close()
    }
}

/// Per-thread session over a [`BTreeIndex`].
///
/// Holds the spare frame used by page cleanup and splits, and the cursor
/// frame scans copy leaf pages into.
pub struct BTreeHandle {
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) schema: Arc<dyn KeySchema>,

    // spare frame for page cleanup and splits, never mapped
    pub(crate) frame: Vec<u8>,

    // cached leaf frame for scans, never mapped
    pub(crate) cursor: Vec<u8>,
    pub(crate) cursor_page: u64,

    pub(crate) thread_no: u16,
}

impl BTreeHandle {
    /// Find and pin the page holding `key` at `lvl`, leaving it locked in
    /// the requested mode. Returns the slot whose key is >= `key`.
    ///
    /// Descends with Access/content lock chaining so a page learned from a
    /// parent cannot be deleted before we latch it, and slides right through
    /// sibling links when a concurrent split moved our key. Falling off a
    /// right chain restarts from the root a bounded number of times before
    /// surfacing a structural error.
    pub(crate) fn load_page(
        &mut self,
        key: &[u8],
        lvl: u8,
        lock: LockMode,
    ) -> Result<(u32, u32), SmallError> {
        let pool = Arc::clone(&self.pool);
        let schema = Arc::clone(&self.schema);
        let tid = self.thread_no;

        let mut restarts = 0;

        'restart: loop {
            let mut page_no = ROOT_PAGE;
            let mut drill: u8 = 0xff;
            let mut prev: Option<(u32, LockMode)> = None;

            loop {
                // determine lock mode of drill level
                let mode = if drill == lvl { lock } else { LockMode::Read };

                let latch = match pool.pin_latch(page_no, true) {
                    Ok(latch) => latch,
                    Err(e) => {
                        if let Some((pentry, pmode)) = prev.take() {
                            let p = pool.latch_entry(pentry);
                            p.unlock(pmode);
                            pool.unpin_latch(p);
                        }
                        return Err(e);
                    }
                };
                let entry = latch.entry;

                // obtain access lock using lock chaining
                if page_no > ROOT_PAGE {
                    latch.lock(LockMode::Access, tid);
                }

                // release & unpin parent or left sibling page
                if let Some((pentry, pmode)) = prev.take() {
                    let p = pool.latch_entry(pentry);
                    p.unlock(pmode);
                    pool.unpin_latch(p);
                }

                latch.lock(mode, tid);
                let page = pool.map_page(latch);

                if page.free() {
                    if page_no > ROOT_PAGE {
                        latch.unlock(LockMode::Access);
                    }
                    latch.unlock(mode);
                    pool.unpin_latch(latch);
                    return Err(SmallError::structure("descended into a free page"));
                }

                if page_no > ROOT_PAGE {
                    latch.unlock(LockMode::Access);
                }

                // re-read and re-lock root after determining the actual
                // level of the root
                if page.lvl() != drill {
                    if latch.page_no() != ROOT_PAGE {
                        latch.unlock(mode);
                        pool.unpin_latch(latch);
                        return Err(SmallError::structure("level mismatch below the root"));
                    }

                    drill = page.lvl();

                    if drill < lvl {
                        latch.unlock(mode);
                        pool.unpin_latch(latch);
                        return Err(SmallError::structure("tree shorter than requested level"));
                    }

                    if lock != LockMode::Read && drill == lvl {
                        latch.unlock(mode);
                        pool.unpin_latch(latch);
                        continue;
                    }
                }

                prev = Some((entry, mode));

                // find key on page at this level and descend to the
                // requested level
                if !page.kill() {
                    let mut slot = page::find_slot(page, key, schema.as_ref());
                    if slot != 0 {
                        if drill == lvl {
                            return Ok((slot, entry));
                        }

                        // find the next non-dead slot, the fence key if
                        // nothing else
                        while page.slot_dead(slot) {
                            if slot < page.cnt() {
                                slot += 1;
                            } else {
                                let (pentry, pmode) = prev.take().unwrap();
                                let p = pool.latch_entry(pentry);
                                p.unlock(pmode);
                                pool.unpin_latch(p);
                                return Err(SmallError::structure("no live slot on page"));
                            }
                        }

                        page_no = page::get_id(page.val(slot));
                        drill -= 1;
                        continue;
                    }
                }

                // or slide right into the next page
                page_no = page.right();

                if page_no == 0 {
                    let (pentry, pmode) = prev.take().unwrap();
                    let p = pool.latch_entry(pentry);
                    p.unlock(pmode);
                    pool.unpin_latch(p);

                    restarts += 1;
                    if restarts > 3 {
                        return Err(SmallError::structure("fell off the right end of a level"));
                    }
                    continue 'restart;
                }
            }
        }
    }

    fn overflow_check(&self, key_len: usize, val_len: usize) -> SmallResult {
        if key_len == 0 || key_len > MAX_KEY || val_len > 255 {
            return Err(SmallError::new(
                ErrorKind::Overflow,
                &format!("key/value size out of range: {}/{}", key_len, val_len),
            ));
        }

        // a record must leave room for a second record plus the stopper
        // after any split
        let record = key_len + KEY_HDR + val_len + VAL_HDR;
        let floor = page::PAGE_HDR + 8 * SLOT_SIZE + 2 * (record + STOPPER.len() + KEY_HDR + VAL_HDR);
        if floor > self.pool.page_size() {
            return Err(SmallError::new(
                ErrorKind::Overflow,
                "record does not fit a page half",
            ));
        }
        Ok(())
    }

    /// Insert a key into the tree at the given level, either adding a new
    /// slot or updating an existing one.
    ///
    /// With `unique` a byte-identical live key becomes an in-place value
    /// update; without it the key is extended by the 6-byte duplicate
    /// sequence, making every entry distinct and scan-ordered by insertion.
    /// External callers pass `lvl == 0`; fence propagation re-enters here at
    /// `lvl + 1`.
    pub fn insert_key(
        &mut self,
        key: &[u8],
        value: &[u8],
        lvl: u8,
        unique: bool,
    ) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let schema = Arc::clone(&self.schema);

        // set up the key we're working on
        let mut ins = key.to_vec();
        let typ = if unique {
            SlotType::Unique
        } else {
            let sequence = pool.next_dup();
            let mut id = [0u8; BT_ID];
            page::put_id(&mut id, sequence);
            ins.extend_from_slice(&id);
            SlotType::Duplicate
        };

        self.overflow_check(ins.len(), value.len())?;

        loop {
            // find the page and slot for the current key
            let (mut slot, entry) = self.load_page(&ins, lvl, LockMode::Write)?;
            let latch = pool.latch_entry(entry);
            let pg = pool.map_page_mut(latch);

            // if the librarian slot matches, advance to the real slot
            if pg.slot_type(slot) == SlotType::Librarian
                && schema.compare(pg.key(slot), key) == Ordering::Equal
            {
                slot += 1;
            }

            let mut stored_len = pg.key(slot).len();
            if pg.slot_type(slot) == SlotType::Duplicate {
                stored_len -= BT_ID;
            }

            let update = unique
                && stored_len == ins.len()
                && pg.key(slot)[..stored_len] == ins[..];

            if !update {
                // inserting a new key before `slot`; make sure the page
                // has space or split it
                let room = {
                    let frame = Page::from_bytes_mut(&mut self.frame);
                    page::clean_page(pg, frame, ins.len(), slot, value.len())
                };
                if room == 0 {
                    let right_entry = self.split_page(entry)?;
                    self.split_keys(entry, right_entry)?;
                    continue;
                }

                page::insert_slot(pg, room, &ins, value, typ);
                latch.set_dirty();
                latch.unlock(LockMode::Write);
                pool.unpin_latch(latch);
                return Ok(());
            }

            // the key already exists: update the value in place when the
            // old record has room
            let old_len = pg.val(slot).len();
            if old_len >= value.len() {
                if pg.slot_dead(slot) {
                    pg.set_act(pg.act() + 1);
                }
                pg.set_garbage(pg.garbage() + (old_len - value.len()) as u32);
                latch.set_dirty();
                pg.set_slot_dead(slot, false);
                pg.set_val(slot, value);
                latch.unlock(LockMode::Write);
                pool.unpin_latch(latch);
                return Ok(());
            }

            // the replacement value doesn't fit in the existing area:
            // retire the old record and write a fresh one
            if !pg.slot_dead(slot) {
                pg.set_garbage(pg.garbage() + pg.record_bytes(slot));
            } else {
                pg.set_slot_dead(slot, false);
                pg.set_act(pg.act() + 1);
            }

            let room = {
                let frame = Page::from_bytes_mut(&mut self.frame);
                page::clean_page(pg, frame, ins.len(), slot, value.len())
            };
            if room == 0 {
                let right_entry = self.split_page(entry)?;
                self.split_keys(entry, right_entry)?;
                continue;
            }

            let off = pg.push_record(&ins, value);
            pg.set_slot_off(room, off);
            latch.set_dirty();
            latch.unlock(LockMode::Write);
            pool.unpin_latch(latch);
            return Ok(());
        }
    }

    /// Split an already write-locked full page, leaving it locked. Returns
    /// the pool entry of the new right page, latched but unlocked.
    pub(crate) fn split_page(&mut self, entry: u32) -> Result<u32, SmallError> {
        let pool = Arc::clone(&self.pool);
        let latch = pool.latch_entry(entry);
        let pg = pool.map_page_mut(latch);
        let frame = Page::from_bytes_mut(&mut self.frame);

        // move the upper half of the slots into the spare frame
        page::split_upper(pg, frame, latch.page_no(), latch.page_no() == ROOT_PAGE);

        // get a new free page and write the higher keys to it
        let right = pool.new_page(frame)?;

        // assemble the page of smaller keys in place
        page::split_lower(pg, frame, right.page_no());
        latch.set_dirty();

        Ok(right.entry)
    }

    /// Post the fence keys of a freshly split page pair into the parent
    /// level. Called with the master page write-locked; returns with both
    /// pages unlocked and unpinned.
    pub(crate) fn split_keys(&mut self, entry: u32, right_entry: u32) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;
        let latch = pool.latch_entry(entry);

        // if the current page is the root page, split it instead
        if latch.page_no() == ROOT_PAGE {
            return self.split_root(entry, right_entry);
        }

        let pg = pool.map_page(latch);
        let lvl = pg.lvl();
        let leftkey = pg.key(pg.cnt()).to_vec();

        let right = pool.latch_entry(right_entry);
        let rpage = pool.map_page(right);
        let rightkey = rpage.key(rpage.cnt()).to_vec();

        // insert the new fences in their parent page(s), serializing with
        // other writers posting for the same children
        right.lock(LockMode::Parent, tid);
        latch.lock(LockMode::Parent, tid);
        latch.unlock(LockMode::Write);

        let mut value = [0u8; BT_ID];

        // new fence for the reformulated block of smaller keys
        page::put_id(&mut value, latch.page_no());
        self.insert_key(&leftkey, &value, lvl + 1, true)?;

        // switch the fence for the larger keys to the new right page
        page::put_id(&mut value, right.page_no());
        self.insert_key(&rightkey, &value, lvl + 1, true)?;

        latch.unlock(LockMode::Parent);
        pool.unpin_latch(latch);

        right.unlock(LockMode::Parent);
        pool.unpin_latch(right);
        Ok(())
    }

    /// Split the root and raise the height of the tree. The root's page
    /// number never changes; its old contents move to a fresh page.
    fn split_root(&mut self, root_entry: u32, right_entry: u32) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let root_latch = pool.latch_entry(root_entry);
        let root = pool.map_page_mut(root_latch);

        // save the left page fence key for the new root
        let leftkey = root.key(root.cnt()).to_vec();

        // obtain an empty page, and copy the lower keys into it
        let left = pool.new_page(root)?;
        let left_page_no = left.page_no();

        // the relocated lower half is now the left sibling of the split-off
        // right page
        let right_latch = pool.latch_entry(right_entry);
        pool.map_page_mut(right_latch).set_left(left_page_no);

        pool.unpin_latch(left);

        // rewrite the root with two slots: (left's fence, left) and
        // (stopper, right)
        root.clear_body();
        root.set_garbage(0);
        root.set_min(root.size() as u32);
        root.set_right(0);

        let mut value = [0u8; BT_ID];

        page::put_id(&mut value, right_latch.page_no());
        let off = root.push_record(&STOPPER, &value);
        root.set_slot(2, off, SlotType::Unique, false);

        page::put_id(&mut value, left_page_no);
        let off = root.push_record(&leftkey, &value);
        root.set_slot(1, off, SlotType::Unique, false);

        root.set_cnt(2);
        root.set_act(2);
        root.set_lvl(root.lvl() + 1);
        root_latch.set_dirty();

        debug!(
            "root split, height is now {}, left: {}, right: {}",
            root.lvl(),
            left_page_no,
            right_latch.page_no()
        );

        // release and unpin the root and the new right page
        root_latch.unlock(LockMode::Write);
        pool.unpin_latch(root_latch);
        pool.unpin_latch(right_latch);
        Ok(())
    }

    /// Find and delete a key at the given level by marking its slot dead.
    /// An emptied page is removed from the tree; a deleted fence is pushed
    /// upwards; a single-child root collapses a level.
    pub fn delete_key(&mut self, key: &[u8], lvl: u8, unique: bool) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let schema = Arc::clone(&self.schema);

        let (mut slot, entry) = self.load_page(key, lvl, LockMode::Write)?;
        let latch = pool.latch_entry(entry);
        let pg = pool.map_page_mut(latch);

        if pg.slot_type(slot) == SlotType::Librarian {
            slot += 1;
        }

        let fence = slot == pg.cnt();

        // if the key is found delete it, otherwise ignore the request
        let mut found = false;
        loop {
            if schema.compare(pg.key(slot), key) != Ordering::Equal {
                break;
            }

            found = !pg.slot_dead(slot);
            if found {
                let bytes = pg.record_bytes(slot);
                pg.set_slot_dead(slot, true);
                pg.set_garbage(pg.garbage() + bytes);
                pg.set_act(pg.act() - 1);

                // collapse empty slots beneath the fence
                loop {
                    let idx = pg.cnt() - 1;
                    if idx == 0 || !pg.slot_dead(idx) {
                        break;
                    }
                    pg.copy_slot(idx + 1, idx);
                    pg.clear_slot(pg.cnt());
                    pg.set_cnt(pg.cnt() - 1);
                }
            }

            if unique || slot >= pg.cnt() {
                break;
            }
            slot += 1;
        }

        // did we delete a fence key in an upper level?
        if found && lvl != 0 && pg.act() != 0 && fence {
            return self.fix_fence(entry, lvl);
        }

        // do we need to collapse the root?
        if lvl > 1 && latch.page_no() == ROOT_PAGE && pg.act() == 1 {
            return self.collapse_root(entry);
        }

        // delete an emptied page
        if pg.act() == 0 {
            return self.delete_page(entry);
        }

        latch.set_dirty();
        latch.unlock(LockMode::Write);
        pool.unpin_latch(latch);
        Ok(())
    }

    /// A fence key was deleted from an upper-level page; push the new
    /// (smaller) fence value into the parent. Called with the page
    /// write-locked, returns with it unpinned.
    fn fix_fence(&mut self, entry: u32, lvl: u8) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;
        let latch = pool.latch_entry(entry);
        let pg = pool.map_page_mut(latch);

        // remove the old fence value
        let rightkey = pg.key(pg.cnt()).to_vec();
        pg.clear_slot(pg.cnt());
        pg.set_cnt(pg.cnt() - 1);
        latch.set_dirty();

        // cache the new fence value
        let leftkey = pg.key(pg.cnt()).to_vec();

        latch.lock(LockMode::Parent, tid);
        latch.unlock(LockMode::Write);

        let mut value = [0u8; BT_ID];
        page::put_id(&mut value, latch.page_no());

        // insert the new (now smaller) fence key, then delete the old one
        self.insert_key(&leftkey, &value, lvl + 1, true)?;
        self.delete_key(&rightkey, lvl + 1, true)?;

        latch.unlock(LockMode::Parent);
        pool.unpin_latch(latch);
        Ok(())
    }

    /// The root has a single child; pull children up until the root holds
    /// more than one live slot or becomes a leaf.
    fn collapse_root(&mut self, root_entry: u32) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;
        let root_latch = pool.latch_entry(root_entry);

        loop {
            let root = pool.map_page_mut(root_latch);

            // find the child entry and promote it as the new root contents
            let mut idx = 1;
            while idx < root.cnt() && root.slot_dead(idx) {
                idx += 1;
            }
            let page_no = page::get_id(root.val(idx));

            let child = pool.pin_latch(page_no, true)?;
            child.lock(LockMode::Delete, tid);
            child.lock(LockMode::Write, tid);

            root.copy_from(pool.map_page(child));
            root_latch.set_dirty();

            pool.free_page(child);

            if !(root.lvl() > 1 && root.act() == 1) {
                break;
            }
        }

        root_latch.unlock(LockMode::Write);
        pool.unpin_latch(root_latch);
        Ok(())
    }

    /// Remove an emptied page from the tree by pulling its right sibling's
    /// contents over it, then repairing the parent separators. Called with
    /// the page write-locked, returns with it unpinned.
    fn delete_page(&mut self, entry: u32) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;
        let latch = pool.latch_entry(entry);
        let pg = pool.map_page_mut(latch);
        let lvl = pg.lvl();

        // cache a copy of our fence key to remove from the parent
        let lowerfence = pg.key(pg.cnt()).to_vec();
        let our_left = pg.left();

        // obtain a lock on the right page
        let page_no = pg.right();
        let right = pool.pin_latch(page_no, true)?;
        right.lock(LockMode::Write, tid);
        let rpage = pool.map_page_mut(right);

        // cache a copy of the key to update
        let higherfence = rpage.key(rpage.cnt()).to_vec();

        if rpage.kill() {
            right.unlock(LockMode::Write);
            pool.unpin_latch(right);
            latch.unlock(LockMode::Write);
            pool.unpin_latch(latch);
            return Err(SmallError::structure("right sibling already being deleted"));
        }

        // pull the contents of the right peer into our empty page, keeping
        // our own left link
        pg.copy_from(rpage);
        pg.set_left(our_left);
        latch.set_dirty();

        // mark the right page deleted and point it at this page until the
        // parent updates remove all access paths to it
        rpage.set_right(latch.page_no());
        rpage.set_kill(true);
        right.set_dirty();

        right.lock(LockMode::Parent, tid);
        right.unlock(LockMode::Write);

        latch.lock(LockMode::Parent, tid);
        latch.unlock(LockMode::Write);

        let mut value = [0u8; BT_ID];
        page::put_id(&mut value, latch.page_no());

        // redirect the higher key directly to our new node contents, then
        // delete the old lower key to our node
        self.insert_key(&higherfence, &value, lvl + 1, true)?;
        self.delete_key(&lowerfence, lvl + 1, true)?;

        // fix the new right sibling's left pointer to skip the dead page
        let new_right = pool.map_page(latch).right();
        if new_right != 0 {
            let temp = pool.pin_latch(new_right, true)?;
            temp.lock(LockMode::Write, tid);
            pool.map_page_mut(temp).set_left(latch.page_no());
            temp.set_dirty();
            temp.unlock(LockMode::Write);
            pool.unpin_latch(temp);
        } else if lvl == 0 {
            pool.with_page_zero(|zero| zero.left = latch.page_no());
        }

        // obtain delete and write locks to free the right node
        right.unlock(LockMode::Parent);
        right.lock(LockMode::Delete, tid);
        right.lock(LockMode::Write, tid);
        pool.free_page(right);

        latch.unlock(LockMode::Parent);
        pool.unpin_latch(latch);
        Ok(())
    }

    /// Advance to the next slot, sliding right into the next page when the
    /// current one is exhausted. Content locks chain across the boundary.
    pub(crate) fn find_next(&mut self, entry: u32, slot: u32) -> Result<(u32, u32), SmallError> {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;
        let latch = pool.latch_entry(entry);
        let pg = pool.map_page(latch);

        if slot < pg.cnt() {
            return Ok((slot + 1, entry));
        }

        let page_no = pg.right();
        if page_no == 0 {
            latch.unlock(LockMode::Read);
            pool.unpin_latch(latch);
            return Err(SmallError::structure("walked off the rightmost page"));
        }

        let next = match pool.pin_latch(page_no, true) {
            Ok(next) => next,
            Err(e) => {
                latch.unlock(LockMode::Read);
                pool.unpin_latch(latch);
                return Err(e);
            }
        };
        next.lock(LockMode::Access, tid);

        latch.unlock(LockMode::Read);
        pool.unpin_latch(latch);

        next.lock(LockMode::Read, tid);
        next.unlock(LockMode::Access);

        Ok((1, next.entry))
    }

    /// Find a unique key (or the first duplicate) at the leaf level and
    /// copy its value into `out`, returning the copied byte count, or
    /// `None` when the key is absent.
    pub fn find_key(&mut self, key: &[u8], out: &mut [u8]) -> Result<Option<usize>, SmallError> {
        let pool = Arc::clone(&self.pool);

        let (mut slot, mut entry) = self.load_page(key, 0, LockMode::Read)?;
        let mut ret = None;

        loop {
            let latch = pool.latch_entry(entry);
            let pg = pool.map_page(latch);

            // skip the librarian slot place holder
            if pg.slot_type(slot) == SlotType::Librarian {
                slot += 1;
            }

            let mut len = pg.key(slot).len();
            if pg.slot_type(slot) == SlotType::Duplicate {
                len -= BT_ID;
            }

            // not there if we reach the stopper key
            if slot == pg.cnt() && pg.right() == 0 {
                break;
            }

            if pg.slot_dead(slot) {
                let (s, e) = self.find_next(entry, slot)?;
                slot = s;
                entry = e;
                continue;
            }

            if key.len() == len && &pg.key(slot)[..len] == key {
                let val = pg.val(slot);
                let n = val.len().min(out.len());
                out[..n].copy_from_slice(&val[..n]);
                ret = Some(n);
            }
            break;
        }

        let latch = pool.latch_entry(entry);
        latch.unlock(LockMode::Read);
        pool.unpin_latch(latch);
        Ok(ret)
    }

    /// Convenience lookup returning an owned value.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, SmallError> {
        let mut buf = vec![0u8; 256];
        match self.find_key(key, &mut buf)? {
            Some(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    /// Number of levels in the tree; a fresh index has height 2.
    pub fn tree_height(&mut self) -> Result<u8, SmallError> {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;

        let root = pool.pin_latch(ROOT_PAGE, true)?;
        root.lock(LockMode::Read, tid);
        let lvl = pool.map_page(root).lvl();
        root.unlock(LockMode::Read);
        pool.unpin_latch(root);
        Ok(lvl + 1)
    }

    /// Walk the whole tree verifying the structural invariants: strictly
    /// increasing live keys per page, separator bounds between parents and
    /// children, and level consistency. Returns the number of live leaf
    /// keys, stoppers excluded. Meant for quiesced trees in tests.
    pub fn check_integrity(&mut self) -> Result<u64, SmallError> {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;

        let root = pool.pin_latch(ROOT_PAGE, true)?;
        root.lock(LockMode::Read, tid);
        let lvl = pool.map_page(root).lvl();
        root.unlock(LockMode::Read);
        pool.unpin_latch(root);

        self.check_sub(ROOT_PAGE, lvl, None, &STOPPER)
    }

    fn check_sub(
        &mut self,
        page_no: u64,
        lvl: u8,
        lower: Option<Vec<u8>>,
        upper: &[u8],
    ) -> Result<u64, SmallError> {
        let pool = Arc::clone(&self.pool);
        let schema = Arc::clone(&self.schema);
        let tid = self.thread_no;

        let latch = pool.pin_latch(page_no, true)?;
        latch.lock(LockMode::Read, tid);
        let pg = pool.map_page(latch);

        assert_eq!(pg.lvl(), lvl, "page {} at wrong level", page_no);
        assert!(!pg.free(), "page {} is free", page_no);
        assert!(!pg.kill(), "page {} is being deleted", page_no);

        let mut count = 0;
        let mut prev = lower;

        for slot in 1..=pg.cnt() {
            if pg.slot_dead(slot) {
                continue;
            }
            let key = pg.key(slot).to_vec();

            if let Some(ref p) = prev {
                assert_eq!(
                    schema.compare(&key, p),
                    Ordering::Greater,
                    "keys out of order on page {}",
                    page_no
                );
            }
            assert_ne!(
                schema.compare(&key, upper),
                Ordering::Greater,
                "key above parent separator on page {}",
                page_no
            );

            if lvl > 0 {
                let child = page::get_id(pg.val(slot));
                count += self.check_sub(child, lvl - 1, prev.clone(), &key)?;
            } else if key != STOPPER {
                count += 1;
            }

            prev = Some(key);
        }

        let latch = pool.latch_entry(latch.entry);
        latch.unlock(LockMode::Read);
        pool.unpin_latch(latch);
        Ok(count)
    }

    /// Log the tree structure, one line per page. Meant for debugging on a
    /// quiesced tree.
    pub fn draw_tree(&mut self) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;

        let root = pool.pin_latch(ROOT_PAGE, true)?;
        root.lock(LockMode::Read, tid);
        let lvl = pool.map_page(root).lvl();
        root.unlock(LockMode::Read);
        pool.unpin_latch(root);

        self.draw_sub(ROOT_PAGE, lvl, 0)
    }

    fn draw_sub(&mut self, page_no: u64, lvl: u8, depth: usize) -> SmallResult {
        let pool = Arc::clone(&self.pool);
        let tid = self.thread_no;

        let latch = pool.pin_latch(page_no, true)?;
        latch.lock(LockMode::Read, tid);
        let pg = pool.map_page(latch);

        debug!(
            "{}page {} lvl {} cnt {} act {} right {} [{}]",
            "  ".repeat(depth),
            page_no,
            pg.lvl(),
            pg.cnt(),
            pg.act(),
            pg.right(),
            crate::utils::hex_prefix(pg.data(), 16),
        );

        let mut children = vec![];
        if lvl > 0 {
            for slot in 1..=pg.cnt() {
                if !pg.slot_dead(slot) {
                    children.push(page::get_id(pg.val(slot)));
                }
            }
        }

        latch.unlock(LockMode::Read);
        pool.unpin_latch(latch);

        for child in children {
            self.draw_sub(child, lvl - 1, depth + 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("small-index-table-{}-{}.db", name, std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn test_insert_find_roundtrip() {
        let path = temp_path("roundtrip");
        let index = BTreeIndex::open_bytes(&path, 9, 16).unwrap();
        let mut h = index.handle();

        h.insert_key(b"alpha", b"1", 0, true).unwrap();
        h.insert_key(b"beta", b"2", 0, true).unwrap();

        assert_eq!(h.get(b"alpha").unwrap(), Some(b"1".to_vec()));
        assert_eq!(h.get(b"beta").unwrap(), Some(b"2".to_vec()));
        assert_eq!(h.get(b"gamma").unwrap(), None);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unique_insert_updates_in_place() {
        let path = temp_path("update");
        let index = BTreeIndex::open_bytes(&path, 9, 16).unwrap();
        let mut h = index.handle();

        h.insert_key(b"k", b"old", 0, true).unwrap();
        h.insert_key(b"k", b"new", 0, true).unwrap();
        assert_eq!(h.get(b"k").unwrap(), Some(b"new".to_vec()));

        // a longer replacement forces the fresh-record path
        h.insert_key(b"k", b"much longer value", 0, true).unwrap();
        assert_eq!(h.get(b"k").unwrap(), Some(b"much longer value".to_vec()));

        assert_eq!(h.check_integrity().unwrap(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_split_grows_tree() {
        let path = temp_path("split");
        let index = BTreeIndex::open_bytes(&path, 9, 32).unwrap();
        let mut h = index.handle();

        for i in 0..200 {
            let key = format!("key{:05}", i);
            let val = format!("val{:05}", i);
            h.insert_key(key.as_bytes(), val.as_bytes(), 0, true).unwrap();
        }

        for i in 0..200 {
            let key = format!("key{:05}", i);
            let val = format!("val{:05}", i);
            assert_eq!(h.get(key.as_bytes()).unwrap(), Some(val.into_bytes()));
        }

        assert_eq!(h.check_integrity().unwrap(), 200);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_delete_and_empty_page_removal() {
        let path = temp_path("delete");
        let index = BTreeIndex::open_bytes(&path, 9, 32).unwrap();
        let mut h = index.handle();

        for i in 0..200 {
            let key = format!("key{:05}", i);
            h.insert_key(key.as_bytes(), b"v", 0, true).unwrap();
        }
        for i in 0..200 {
            let key = format!("key{:05}", i);
            h.delete_key(key.as_bytes(), 0, true).unwrap();
        }
        for i in 0..200 {
            let key = format!("key{:05}", i);
            assert_eq!(h.get(key.as_bytes()).unwrap(), None);
        }

        assert_eq!(h.check_integrity().unwrap(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_overflow_rejected() {
        let path = temp_path("overflow");
        let index = BTreeIndex::open_bytes(&path, 9, 16).unwrap();
        let mut h = index.handle();

        let big = vec![b'x'; 300];
        let r = h.insert_key(&big, b"v", 0, true);
        assert_eq!(r.err().unwrap().kind(), ErrorKind::Overflow);

        let _ = std::fs::remove_file(&path);
    }
}
