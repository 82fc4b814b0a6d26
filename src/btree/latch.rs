use std::{
    sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering},
    thread,
};

// spin latch bit layout: exclusive is set for write access, share is the
// count of read accessors, write is granted when share == 0
const XCL: u16 = 1;
const PEND: u16 = 2;
const BOTH: u16 = 3;
const SHARE: u16 = 4;

/// Short-held latch guarding a hash bucket chain or the allocator area.
/// Never held across I/O except during first-load after frame install.
pub struct SpinLatch {
    bits: AtomicU16,
}

impl SpinLatch {
    pub fn new() -> Self {
        Self {
            bits: AtomicU16::new(0),
        }
    }

    /// Wait until write mode is clear and add 1 to the share count.
    pub fn read_lock(&self) {
        loop {
            let prev = self.bits.fetch_add(SHARE, Ordering::SeqCst);
            if prev & BOTH == 0 {
                return;
            }
            self.bits.fetch_sub(SHARE, Ordering::SeqCst);
            thread::yield_now();
        }
    }

    /// Wait for the other read and write latches to relinquish.
    pub fn write_lock(&self) {
        loop {
            let prev = self.bits.fetch_or(PEND | XCL, Ordering::SeqCst);
            if prev & XCL == 0 {
                if prev & !BOTH == 0 {
                    return;
                }
                self.bits.fetch_and(!XCL, Ordering::SeqCst);
            }
            thread::yield_now();
        }
    }

    /// Try to obtain write access, returning whether it was granted.
    pub fn try_write_lock(&self) -> bool {
        let prev = self.bits.fetch_or(XCL, Ordering::SeqCst);
        if prev & XCL == 0 {
            if prev & !BOTH == 0 {
                return true;
            }
            self.bits.fetch_and(!XCL, Ordering::SeqCst);
        }
        false
    }

    pub fn release_write(&self) {
        self.bits.fetch_and(!BOTH, Ordering::SeqCst);
    }

    pub fn release_read(&self) {
        self.bits.fetch_sub(SHARE, Ordering::SeqCst);
    }
}

// phase-fair reader/writer lock: writers queue on a ticket and announce
// themselves in the reader-in word, readers spin only while a writer of the
// current phase is present
const PHID: u16 = 0x1;
const PRES: u16 = 0x2;
const MASK: u16 = 0x3;
const RINC: u16 = 0x4;

/// Phase-fair reader/writer lock over page contents and access intent.
pub struct PhaseFairLock {
    rin: AtomicU16,
    rout: AtomicU16,
    ticket: AtomicU16,
    serving: AtomicU16,
}

impl PhaseFairLock {
    pub fn new() -> Self {
        Self {
            rin: AtomicU16::new(0),
            rout: AtomicU16::new(0),
            ticket: AtomicU16::new(0),
            serving: AtomicU16::new(0),
        }
    }

    pub fn write_lock(&self) {
        let tix = self.ticket.fetch_add(1, Ordering::SeqCst);

        // wait for our ticket to come up
        while tix != self.serving.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        // announce writer presence and phase, then wait for the readers
        // that entered ahead of us to drain
        let w = PRES | (tix & PHID);
        let r = self.rin.fetch_add(w, Ordering::SeqCst);
        while r != self.rout.load(Ordering::SeqCst) {
            thread::yield_now();
        }
    }

    pub fn write_release(&self) {
        self.rin.fetch_and(!MASK, Ordering::SeqCst);
        self.serving.fetch_add(1, Ordering::SeqCst);
    }

    pub fn read_lock(&self) {
        let w = self.rin.fetch_add(RINC, Ordering::SeqCst) & MASK;
        if w != 0 {
            // a writer of this phase is present, wait it out
            while w == (self.rin.load(Ordering::SeqCst) & MASK) {
                thread::yield_now();
            }
        }
    }

    pub fn read_release(&self) {
        self.rout.fetch_add(RINC, Ordering::SeqCst);
    }
}

/// Write-only reentrant lock, keyed by the owner's thread number.
///
/// Re-acquisition by the owner bumps a depth counter; release decrements it
/// and clears the owner at zero. Used for the Parent and Atomic roles.
pub struct WriteOnlyLock {
    xcl: SpinLatch,
    tid: AtomicU16,
    dup: AtomicU16,
}

impl WriteOnlyLock {
    pub fn new() -> Self {
        Self {
            xcl: SpinLatch::new(),
            tid: AtomicU16::new(0),
            dup: AtomicU16::new(0),
        }
    }

    pub fn lock(&self, tid: u16) {
        loop {
            self.xcl.write_lock();
            if self.tid.load(Ordering::SeqCst) == tid {
                self.dup.fetch_add(1, Ordering::SeqCst);
                self.xcl.release_write();
                return;
            }
            if self.tid.load(Ordering::SeqCst) == 0 {
                self.tid.store(tid, Ordering::SeqCst);
                self.xcl.release_write();
                return;
            }
            self.xcl.release_write();
            thread::yield_now();
        }
    }

    pub fn unlock(&self) {
        self.xcl.write_lock();
        if self.dup.load(Ordering::SeqCst) > 0 {
            self.dup.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.tid.store(0, Ordering::SeqCst);
        }
        self.xcl.release_write();
    }
}

/// The six lock roles of a resident page, plus the combined acquisition the
/// batched commit uses on its target leaves.
///
/// 1. `Access`: sharable, going to read the node. Incompatible with
///    `Delete`.
/// 2. `Delete`: exclusive, about to release the node. Incompatible with
///    `Access`.
/// 3. `Read`: sharable. Incompatible with `Write`.
/// 4. `Write`: exclusive. Incompatible with `Read` and other `Write`s.
/// 5. `Parent`: exclusive, posting of a fence key in the parent.
///    Incompatible with another `Parent`.
/// 6. `Atomic`: exclusive, batched update underway. Incompatible with
///    another `Atomic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Access,
    Delete,
    Read,
    Write,
    Parent,
    Atomic,
    AtomicRead,
}

pub const CLOCK_BIT: u16 = 0x8000;

/// Lock bundle of one resident page frame.
pub struct LatchSet {
    // page number currently bound to this frame
    pub(crate) page_no: AtomicU64,

    // read/write page content lock
    readwr: PhaseFairLock,

    // access intent vs. page delete
    access: PhaseFairLock,

    // posting of fence key in parent
    parent: WriteOnlyLock,

    // atomic update in progress
    atomic: WriteOnlyLock,

    // entry slot of the right split frame during an in-progress split chain
    pub(crate) split: AtomicU32,

    // own slot in the latch table
    pub(crate) entry: u32,

    // hash bucket chain links, guarded by the bucket latch
    pub(crate) next: AtomicU32,
    pub(crate) prev: AtomicU32,

    // outstanding pins, with the clock-eviction bit on top
    pub(crate) pin: AtomicU16,

    pub(crate) dirty: AtomicBool,
}

impl LatchSet {
    pub fn new(entry: u32) -> Self {
        Self {
            page_no: AtomicU64::new(0),
            readwr: PhaseFairLock::new(),
            access: PhaseFairLock::new(),
            parent: WriteOnlyLock::new(),
            atomic: WriteOnlyLock::new(),
            split: AtomicU32::new(0),
            entry,
            next: AtomicU32::new(0),
            prev: AtomicU32::new(0),
            pin: AtomicU16::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn page_no(&self) -> u64 {
        self.page_no.load(Ordering::SeqCst)
    }

    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Place the requested lock role on this page.
    pub fn lock(&self, mode: LockMode, tid: u16) {
        match mode {
            LockMode::Read => self.readwr.read_lock(),
            LockMode::Write => self.readwr.write_lock(),
            LockMode::Access => self.access.read_lock(),
            LockMode::Delete => self.access.write_lock(),
            LockMode::Parent => self.parent.lock(tid),
            LockMode::Atomic => self.atomic.lock(tid),
            LockMode::AtomicRead => {
                self.atomic.lock(tid);
                self.readwr.read_lock();
            }
        }
    }

    /// Remove the requested lock role from this page.
    pub fn unlock(&self, mode: LockMode) {
        match mode {
            LockMode::Read => self.readwr.read_release(),
            LockMode::Write => self.readwr.write_release(),
            LockMode::Access => self.access.read_release(),
            LockMode::Delete => self.access.write_release(),
            LockMode::Parent => self.parent.unlock(),
            LockMode::Atomic => self.atomic.unlock(),
            LockMode::AtomicRead => {
                self.atomic.unlock();
                self.readwr.read_release();
            }
        }
    }
}
