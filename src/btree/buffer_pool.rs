use std::{
    cell::UnsafeCell,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
    slice,
    sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use log::{debug, error};

use super::{
    latch::{LatchSet, LockMode, SpinLatch, CLOCK_BIT},
    page::{self, Page, PageZero, SlotType, BT_ID, LEAF_PAGE, MAX_BITS, MIN_BITS, MIN_LVL, STOPPER},
};
use crate::error::{ErrorKind, SmallError, SmallResult};

pub const DEFAULT_PAGE_BITS: u8 = 12;

/// Smallest pool the engine will accept; anything below cannot hold one
/// root-to-leaf path plus a split chain per concurrent writer.
pub const MIN_POOL_FRAMES: usize = 16;

struct HashBucket {
    latch: SpinLatch,
    slot: AtomicU32,
}

/// The buffer pool: every resident page lives in one of its frames, owned
/// exclusively by that frame and shared across threads strictly under the
/// frame's latch set. The hash directory maps page numbers onto latch-set
/// chains; eviction is second-chance clock over the latch table.
pub struct BufferPool {
    page_size: usize,
    page_bits: u8,

    file: File,

    // frame memory, entry index times page size gives the frame offset;
    // the base pointer is captured once so frame access never reborrows
    // the whole region
    pool: UnsafeCell<Box<[u8]>>,
    pool_ptr: *mut u8,

    // parallel latch table, entry 0 reserved
    latch_sets: Box<[LatchSet]>,

    hash_table: Box<[HashBucket]>,
    hash_size: u64,

    latch_total: u32,
    latch_deployed: AtomicU32,
    latch_victim: AtomicU32,

    // allocation area latch and metadata image
    alloc_latch: SpinLatch,
    page_zero: UnsafeCell<PageZero>,

    // global duplicate key uniqueifier
    dups: AtomicU64,

    thread_no: AtomicU16,

    reads: AtomicUsize,
    writes: AtomicUsize,
}

// Frames and page-zero state are interior-mutable; access is serialized by
// the per-frame latch sets and the allocation latch respectively.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Open or create the backing file and size the pool.
    ///
    /// `page_bits` is log2 of the page size, clamped to [9, 24]; an existing
    /// file's recorded page size wins over the argument. `pool_frames` is
    /// the number of resident page frames.
    pub fn open<P: AsRef<Path>>(
        path: P,
        page_bits: u8,
        pool_frames: usize,
    ) -> Result<BufferPool, SmallError> {
        let mut bits = page_bits.max(MIN_BITS).min(MAX_BITS);

        if pool_frames < MIN_POOL_FRAMES {
            return Err(SmallError::new(
                ErrorKind::Map,
                &format!("buffer pool too small: {}", pool_frames),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .or(Err(SmallError::io("unable to open index file")))?;

        // read the minimum page size to get the recorded geometry
        let mut initit = true;
        let size = file
            .metadata()
            .or(Err(SmallError::io("unable to stat index file")))?
            .len();
        let mut zero = PageZero::default();
        if size > 0 {
            let mut probe = vec![0u8; 1 << MIN_BITS];
            file.read_exact_at(&mut probe, 0)
                .or(Err(SmallError::io("unable to read page zero")))?;
            zero = PageZero::decode(&probe);
            if zero.bits != 0 {
                bits = zero.bits;
                initit = false;
            }
        }

        let page_size = 1usize << bits;
        let latch_total = pool_frames as u32;
        let hash_size = (pool_frames / 16).next_power_of_two().max(16) as u64;

        let mut pool_mem = vec![0u8; pool_frames * page_size].into_boxed_slice();
        let pool_ptr = pool_mem.as_mut_ptr();

        let mut latch_sets = Vec::with_capacity(pool_frames);
        for entry in 0..pool_frames {
            latch_sets.push(LatchSet::new(entry as u32));
        }

        let mut hash_table = Vec::with_capacity(hash_size as usize);
        for _ in 0..hash_size {
            hash_table.push(HashBucket {
                latch: SpinLatch::new(),
                slot: AtomicU32::new(0),
            });
        }

        let pool = BufferPool {
            page_size,
            page_bits: bits,
            file,
            pool: UnsafeCell::new(pool_mem),
            pool_ptr,
            latch_sets: latch_sets.into_boxed_slice(),
            hash_table: hash_table.into_boxed_slice(),
            hash_size,
            latch_total,
            latch_deployed: AtomicU32::new(0),
            latch_victim: AtomicU32::new(0),
            alloc_latch: SpinLatch::new(),
            page_zero: UnsafeCell::new(zero),
            dups: AtomicU64::new(zero.dups),
            thread_no: AtomicU16::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        };

        if initit {
            pool.create_empty_tree()?;
        }

        debug!(
            "buffer pool opened, page_size: {}, frames: {}, hash: {}",
            page_size, pool_frames, hash_size
        );

        Ok(pool)
    }

    /// Initialize an empty tree: metadata page, root page and first page of
    /// leaves, each level carrying one stopper key.
    fn create_empty_tree(&self) -> SmallResult {
        let zero = PageZero {
            bits: self.page_bits,
            right: (MIN_LVL as u64) + 1,
            left: LEAF_PAGE,
            chain: 0,
            dups: 0,
        };

        let mut buf = vec![0u8; self.page_size];
        zero.encode(&mut buf);
        self.write_page(0, &buf)?;

        // the page of leaves is the level-0 terminus, the root points at it
        for lvl in (0..MIN_LVL).rev() {
            let page_no = (MIN_LVL - lvl) as u64;

            for b in buf.iter_mut() {
                *b = 0;
            }
            let page = Page::from_bytes_mut(&mut buf);
            page.set_bits(self.page_bits);
            page.set_lvl(lvl);
            page.set_min(self.page_size as u32);

            let mut value = [0u8; BT_ID];
            let vlen = if lvl != 0 {
                page::put_id(&mut value, (MIN_LVL - lvl) as u64 + 1);
                BT_ID
            } else {
                0
            };

            let off = page.push_record(&STOPPER, &value[..vlen]);
            page.set_slot(1, off, SlotType::Unique, false);
            page.set_cnt(1);
            page.set_act(1);

            self.write_page(page_no, &buf)?;
        }

        unsafe {
            *self.page_zero.get() = zero;
        }

        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_bits(&self) -> u8 {
        self.page_bits
    }

    pub fn next_thread_no(&self) -> u16 {
        self.thread_no.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Next value of the global duplicate key uniqueifier.
    pub fn next_dup(&self) -> u64 {
        self.dups.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn frame_ptr(&self, entry: u32) -> *mut u8 {
        unsafe { self.pool_ptr.add(entry as usize * self.page_size) }
    }

    /// The cached page image bound to a latch set.
    ///
    /// The caller must hold a content lock on the latch; the latch discipline
    /// is what keeps these views from aliasing a concurrent writer.
    pub(crate) fn map_page(&self, latch: &LatchSet) -> &Page {
        let bytes = unsafe { slice::from_raw_parts(self.frame_ptr(latch.entry), self.page_size) };
        Page::from_bytes(bytes)
    }

    /// Mutable view of the frame; the caller must hold the Write lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn map_page_mut(&self, latch: &LatchSet) -> &mut Page {
        let bytes =
            unsafe { slice::from_raw_parts_mut(self.frame_ptr(latch.entry), self.page_size) };
        Page::from_bytes_mut(bytes)
    }

    pub(crate) fn latch_entry(&self, entry: u32) -> &LatchSet {
        &self.latch_sets[entry as usize]
    }

    /// Read a page from its permanent location in the index file.
    pub fn read_page(&self, page_no: u64, buf: &mut [u8]) -> SmallResult {
        self.file
            .read_exact_at(buf, page_no << self.page_bits)
            .or_else(|e| {
                error!("unable to read page {}: {}", page_no, e);
                Err(SmallError::io(&format!("short read of page {}", page_no)))
            })
    }

    /// Write a page to its permanent location in the index file.
    pub fn write_page(&self, page_no: u64, buf: &[u8]) -> SmallResult {
        self.file
            .write_all_at(buf, page_no << self.page_bits)
            .or(Err(SmallError::io(&format!(
                "short write of page {}",
                page_no
            ))))
    }

    /// Link a latch table entry into the head of its hash chain and bind the
    /// frame to `page_no`, reading the page in when requested.
    fn latch_link(&self, hashidx: usize, slot: u32, page_no: u64, load: bool) -> SmallResult {
        let bucket = &self.hash_table[hashidx];
        let latch = &self.latch_sets[slot as usize];

        let head = bucket.slot.load(Ordering::SeqCst);
        latch.next.store(head, Ordering::SeqCst);
        if head != 0 {
            self.latch_sets[head as usize].prev.store(slot, Ordering::SeqCst);
        }
        bucket.slot.store(slot, Ordering::SeqCst);

        latch.page_no.store(page_no, Ordering::SeqCst);
        latch.split.store(0, Ordering::SeqCst);
        latch.prev.store(0, Ordering::SeqCst);
        latch.pin.store(1, Ordering::SeqCst);

        if load {
            let frame =
                unsafe { slice::from_raw_parts_mut(self.frame_ptr(slot), self.page_size) };
            self.read_page(page_no, frame)?;
            self.reads.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Find the existing latch set for a page or inspire a new one,
    /// returning it pinned.
    pub(crate) fn pin_latch(&self, page_no: u64, load: bool) -> Result<&LatchSet, SmallError> {
        let hashidx = (page_no % self.hash_size) as usize;
        let bucket = &self.hash_table[hashidx];

        //  try to find our entry
        bucket.latch.write_lock();

        let mut slot = bucket.slot.load(Ordering::SeqCst);
        while slot != 0 {
            let latch = &self.latch_sets[slot as usize];
            if latch.page_no() == page_no {
                break;
            }
            slot = latch.next.load(Ordering::SeqCst);
        }

        //  found our entry, increment clock
        if slot != 0 {
            let latch = &self.latch_sets[slot as usize];
            latch.pin.fetch_add(1, Ordering::SeqCst);
            bucket.latch.release_write();
            return Ok(latch);
        }

        //  see if there are any unused pool entries
        let slot = self.latch_deployed.fetch_add(1, Ordering::SeqCst) + 1;
        if slot < self.latch_total {
            if let Err(e) = self.latch_link(hashidx, slot, page_no, load) {
                bucket.latch.release_write();
                return Err(e);
            }
            bucket.latch.release_write();
            return Ok(&self.latch_sets[slot as usize]);
        }
        self.latch_deployed.fetch_sub(1, Ordering::SeqCst);

        //  find and reuse a previous entry on victim
        loop {
            let slot = self.latch_victim.fetch_add(1, Ordering::SeqCst) % self.latch_total;
            if slot == 0 {
                continue;
            }

            let latch = &self.latch_sets[slot as usize];
            let idx = (latch.page_no() % self.hash_size) as usize;

            // see if we are on the same chain as our target
            if idx == hashidx {
                continue;
            }

            if !self.hash_table[idx].latch.try_write_lock() {
                continue;
            }

            // the binding may have moved before we got the bucket; an
            // unvalidated candidate is skipped, never repaired
            if (latch.page_no() % self.hash_size) as usize != idx {
                self.hash_table[idx].latch.release_write();
                continue;
            }

            // skip this slot if it is pinned or recently referenced
            let pin = latch.pin.load(Ordering::SeqCst);
            if pin != 0 {
                if pin & CLOCK_BIT != 0 {
                    latch.pin.fetch_and(!CLOCK_BIT, Ordering::SeqCst);
                }
                self.hash_table[idx].latch.release_write();
                continue;
            }

            // update the permanent page area from the buffer pool
            if latch.dirty.load(Ordering::SeqCst) {
                let frame =
                    unsafe { slice::from_raw_parts(self.frame_ptr(slot), self.page_size) };
                if let Err(e) = self.write_page(latch.page_no(), frame) {
                    self.hash_table[idx].latch.release_write();
                    bucket.latch.release_write();
                    return Err(e);
                }
                latch.dirty.store(false, Ordering::SeqCst);
                self.writes.fetch_add(1, Ordering::SeqCst);
            }

            // unlink our available slot from its hash chain
            let prev = latch.prev.load(Ordering::SeqCst);
            let next = latch.next.load(Ordering::SeqCst);
            if prev != 0 {
                self.latch_sets[prev as usize].next.store(next, Ordering::SeqCst);
            } else {
                self.hash_table[idx].slot.store(next, Ordering::SeqCst);
            }
            if next != 0 {
                self.latch_sets[next as usize].prev.store(prev, Ordering::SeqCst);
            }
            self.hash_table[idx].latch.release_write();

            if let Err(e) = self.latch_link(hashidx, slot, page_no, load) {
                bucket.latch.release_write();
                return Err(e);
            }
            bucket.latch.release_write();
            return Ok(latch);
        }
    }

    /// Set the clock bit and drop one pin.
    pub(crate) fn unpin_latch(&self, latch: &LatchSet) {
        if latch.pin.load(Ordering::SeqCst) & CLOCK_BIT == 0 {
            latch.pin.fetch_or(CLOCK_BIT, Ordering::SeqCst);
        }
        latch.pin.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run a closure under the allocation latch with the metadata image.
    pub(crate) fn with_page_zero<R>(&self, f: impl FnOnce(&mut PageZero) -> R) -> R {
        self.alloc_latch.write_lock();
        let r = f(unsafe { &mut *self.page_zero.get() });
        self.alloc_latch.release_write();
        r
    }

    /// Allocate a page, preferring the free chain, and copy `contents` into
    /// its frame. Returns the latch pinned but unlocked, marked dirty.
    pub(crate) fn new_page(&self, contents: &Page) -> Result<&LatchSet, SmallError> {
        self.alloc_latch.write_lock();
        let zero = unsafe { &mut *self.page_zero.get() };

        // use empty chain first, else allocate a new page number
        if zero.chain != 0 {
            let page_no = zero.chain;
            let latch = match self.pin_latch(page_no, true) {
                Ok(latch) => latch,
                Err(e) => {
                    self.alloc_latch.release_write();
                    return Err(e);
                }
            };

            let page = self.map_page_mut(latch);
            zero.chain = page.right();
            self.alloc_latch.release_write();

            page.copy_from(contents);
            page.set_free(false);
            latch.set_dirty();
            return Ok(latch);
        }

        let page_no = zero.right;
        zero.right = page_no + 1;
        self.alloc_latch.release_write();

        // don't load the frame from the file, the page is brand new
        let latch = self.pin_latch(page_no, false)?;
        self.map_page_mut(latch).copy_from(contents);
        latch.set_dirty();
        Ok(latch)
    }

    /// Return a page to the free list. Call with the page Delete and Write
    /// locked; both locks and the pin are released here.
    pub(crate) fn free_page(&self, latch: &LatchSet) {
        self.alloc_latch.write_lock();
        let zero = unsafe { &mut *self.page_zero.get() };

        let page = self.map_page_mut(latch);
        page.set_right(zero.chain);
        page.set_free(true);
        zero.chain = latch.page_no();
        latch.set_dirty();

        latch.unlock(LockMode::Delete);
        latch.unlock(LockMode::Write);
        self.unpin_latch(latch);

        self.alloc_latch.release_write();
    }

    /// Flush every dirty pool frame and the metadata page.
    pub fn flush(&self) -> SmallResult {
        let deployed = self
            .latch_deployed
            .load(Ordering::SeqCst)
            .min(self.latch_total - 1);

        let mut flushed = 0;
        for slot in 1..=deployed {
            let latch = &self.latch_sets[slot as usize];
            if latch.dirty.load(Ordering::SeqCst) {
                let frame =
                    unsafe { slice::from_raw_parts(self.frame_ptr(slot), self.page_size) };
                self.write_page(latch.page_no(), frame)?;
                latch.dirty.store(false, Ordering::SeqCst);
                flushed += 1;
            }
        }

        let mut buf = vec![0u8; self.page_size];
        self.with_page_zero(|zero| {
            zero.dups = self.dups.load(Ordering::SeqCst);
            zero.encode(&mut buf);
        });
        self.write_page(0, &buf)?;

        debug!("{} buffer pool pages flushed", flushed);
        Ok(())
    }

    /// Flush and sync the backing file.
    pub fn close(&self) -> SmallResult {
        self.flush()?;
        self.file
            .sync_all()
            .or(Err(SmallError::io("unable to sync index file")))
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("buffer pool close failed: {}", e);
        }
    }
}
