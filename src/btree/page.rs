use std::cmp::Ordering;

use crate::schema::KeySchema;

// page number constants
pub const ALLOC_PAGE: u64 = 0;
pub const ROOT_PAGE: u64 = 1;
pub const LEAF_PAGE: u64 = 2;

// number of levels in a freshly created tree
pub const MIN_LVL: u8 = 2;

pub const MIN_BITS: u8 = 9;
pub const MAX_BITS: u8 = 24;

// length of a page number on disk, big-endian
pub const BT_ID: usize = 6;

// maximum number of key bytes
pub const MAX_KEY: usize = 255;

pub const PAGE_HDR: usize = 32;
pub const SLOT_SIZE: usize = 4;
pub const KEY_HDR: usize = 1;
pub const VAL_HDR: usize = 1;

// sentinel fence key of the rightmost page on every level
pub const STOPPER: [u8; 2] = [0xff, 0xff];

// header field offsets
const OFF_CNT: usize = 0;
const OFF_ACT: usize = 4;
const OFF_MIN: usize = 8;
const OFF_GARBAGE: usize = 12;
const OFF_BITS: usize = 16;
const OFF_LVL: usize = 17;
const OFF_RIGHT: usize = 18;
const OFF_LEFT: usize = 24;

// page-zero extras, laid out after the standard header
const OFF_DUPS: usize = 32;
const OFF_CHAIN: usize = 40;

const FREE_FLAG: u8 = 0x80;
const KILL_FLAG: u8 = 0x80;

const OFF_MASK: u32 = 0x00ff_ffff;
const TYPE_SHIFT: u32 = 24;
const DEAD_BIT: u32 = 0x0800_0000;

/// Write a page number into its 6-byte big-endian disk form.
pub fn put_id(dest: &mut [u8], id: u64) {
    let bytes = id.to_be_bytes();
    dest[..BT_ID].copy_from_slice(&bytes[8 - BT_ID..]);
}

/// Read a 6-byte big-endian page number.
pub fn get_id(src: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[8 - BT_ID..].copy_from_slice(&src[..BT_ID]);
    u64::from_be_bytes(bytes)
}

/// Types occupying the key slot array.
///
/// In addition to the Unique keys there are Librarian and Duplicate slots.
/// The Librarian slots are dead keys that serve as filler, available to add
/// new Unique or Duplicate slots without shifting the array. The Duplicate
/// slots have had their key bytes extended by 6 bytes of binary uniqueifier.
/// Delete and Update tag pending mutations inside a batch source page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    Unique,
    Librarian,
    Duplicate,
    Delete,
    Update,
}

impl SlotType {
    fn from_bits(bits: u32) -> SlotType {
        match bits {
            0 => SlotType::Unique,
            1 => SlotType::Librarian,
            2 => SlotType::Duplicate,
            3 => SlotType::Delete,
            _ => SlotType::Update,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            SlotType::Unique => 0,
            SlotType::Librarian => 1,
            SlotType::Duplicate => 2,
            SlotType::Delete => 3,
            SlotType::Update => 4,
        }
    }
}

/// View over one fixed-size page image.
///
/// The header is followed by a forward-growing array of 4-byte slot
/// descriptors (1-based) and a backward-growing heap of key/value records.
/// Every accessor bounds-checks through the underlying slice.
#[repr(transparent)]
pub struct Page {
    data: [u8],
}

impl Page {
    pub fn from_bytes(bytes: &[u8]) -> &Page {
        unsafe { &*(bytes as *const [u8] as *const Page) }
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> &mut Page {
        unsafe { &mut *(bytes as *mut [u8] as *mut Page) }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn read_u32(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.data[off..off + 4]);
        u32::from_le_bytes(b)
    }

    fn write_u32(&mut self, off: usize, v: u32) {
        self.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn cnt(&self) -> u32 {
        self.read_u32(OFF_CNT)
    }

    pub fn set_cnt(&mut self, v: u32) {
        self.write_u32(OFF_CNT, v)
    }

    pub fn act(&self) -> u32 {
        self.read_u32(OFF_ACT)
    }

    pub fn set_act(&mut self, v: u32) {
        self.write_u32(OFF_ACT, v)
    }

    pub fn min(&self) -> u32 {
        self.read_u32(OFF_MIN)
    }

    pub fn set_min(&mut self, v: u32) {
        self.write_u32(OFF_MIN, v)
    }

    pub fn garbage(&self) -> u32 {
        self.read_u32(OFF_GARBAGE)
    }

    pub fn set_garbage(&mut self, v: u32) {
        self.write_u32(OFF_GARBAGE, v)
    }

    pub fn bits(&self) -> u8 {
        self.data[OFF_BITS] & !FREE_FLAG
    }

    pub fn set_bits(&mut self, v: u8) {
        self.data[OFF_BITS] = (self.data[OFF_BITS] & FREE_FLAG) | (v & !FREE_FLAG);
    }

    pub fn free(&self) -> bool {
        self.data[OFF_BITS] & FREE_FLAG != 0
    }

    pub fn set_free(&mut self, v: bool) {
        if v {
            self.data[OFF_BITS] |= FREE_FLAG;
        } else {
            self.data[OFF_BITS] &= !FREE_FLAG;
        }
    }

    pub fn lvl(&self) -> u8 {
        self.data[OFF_LVL] & !KILL_FLAG
    }

    pub fn set_lvl(&mut self, v: u8) {
        self.data[OFF_LVL] = (self.data[OFF_LVL] & KILL_FLAG) | (v & !KILL_FLAG);
    }

    pub fn kill(&self) -> bool {
        self.data[OFF_LVL] & KILL_FLAG != 0
    }

    pub fn set_kill(&mut self, v: bool) {
        if v {
            self.data[OFF_LVL] |= KILL_FLAG;
        } else {
            self.data[OFF_LVL] &= !KILL_FLAG;
        }
    }

    pub fn right(&self) -> u64 {
        get_id(&self.data[OFF_RIGHT..])
    }

    pub fn set_right(&mut self, id: u64) {
        put_id(&mut self.data[OFF_RIGHT..], id)
    }

    pub fn left(&self) -> u64 {
        get_id(&self.data[OFF_LEFT..])
    }

    pub fn set_left(&mut self, id: u64) {
        put_id(&mut self.data[OFF_LEFT..], id)
    }

    // page slots use 1-based indexing
    fn slot_pos(slot: u32) -> usize {
        PAGE_HDR + (slot as usize - 1) * SLOT_SIZE
    }

    pub(crate) fn slot_word(&self, slot: u32) -> u32 {
        self.read_u32(Self::slot_pos(slot))
    }

    pub(crate) fn set_slot_word(&mut self, slot: u32, word: u32) {
        self.write_u32(Self::slot_pos(slot), word)
    }

    pub fn slot_off(&self, slot: u32) -> u32 {
        self.slot_word(slot) & OFF_MASK
    }

    pub fn slot_type(&self, slot: u32) -> SlotType {
        SlotType::from_bits((self.slot_word(slot) >> TYPE_SHIFT) & 0x7)
    }

    pub fn slot_dead(&self, slot: u32) -> bool {
        self.slot_word(slot) & DEAD_BIT != 0
    }

    pub fn set_slot(&mut self, slot: u32, off: u32, typ: SlotType, dead: bool) {
        let mut word = (off & OFF_MASK) | (typ.to_bits() << TYPE_SHIFT);
        if dead {
            word |= DEAD_BIT;
        }
        self.set_slot_word(slot, word);
    }

    pub fn set_slot_dead(&mut self, slot: u32, dead: bool) {
        let mut word = self.slot_word(slot);
        if dead {
            word |= DEAD_BIT;
        } else {
            word &= !DEAD_BIT;
        }
        self.set_slot_word(slot, word);
    }

    pub fn set_slot_off(&mut self, slot: u32, off: u32) {
        let word = (self.slot_word(slot) & !OFF_MASK) | (off & OFF_MASK);
        self.set_slot_word(slot, word);
    }

    pub fn clear_slot(&mut self, slot: u32) {
        self.set_slot_word(slot, 0);
    }

    pub fn copy_slot(&mut self, from: u32, to: u32) {
        let word = self.slot_word(from);
        self.set_slot_word(to, word);
    }

    /// Key bytes of the record a slot points at.
    pub fn key(&self, slot: u32) -> &[u8] {
        let off = self.slot_off(slot) as usize;
        let len = self.data[off] as usize;
        &self.data[off + KEY_HDR..off + KEY_HDR + len]
    }

    /// Value bytes of the record, stored immediately after its key.
    pub fn val(&self, slot: u32) -> &[u8] {
        let off = self.slot_off(slot) as usize;
        let klen = self.data[off] as usize;
        let voff = off + KEY_HDR + klen;
        let vlen = self.data[voff] as usize;
        &self.data[voff + VAL_HDR..voff + VAL_HDR + vlen]
    }

    /// Overwrite the value bytes in place. The replacement must not exceed
    /// the stored length; the stored length shrinks to fit.
    pub fn set_val(&mut self, slot: u32, value: &[u8]) {
        let off = self.slot_off(slot) as usize;
        let klen = self.data[off] as usize;
        let voff = off + KEY_HDR + klen;
        self.data[voff] = value.len() as u8;
        self.data[voff + VAL_HDR..voff + VAL_HDR + value.len()].copy_from_slice(value);
    }

    /// Record footprint of a slot in heap bytes, for garbage accounting.
    pub fn record_bytes(&self, slot: u32) -> u32 {
        (self.key(slot).len() + KEY_HDR + self.val(slot).len() + VAL_HDR) as u32
    }

    /// Push a key/value record onto the bottom of the heap area and return
    /// the new `min` offset the owning slot should point at.
    pub fn push_record(&mut self, key: &[u8], value: &[u8]) -> u32 {
        let mut min = self.min() as usize;

        min -= value.len() + VAL_HDR;
        self.data[min] = value.len() as u8;
        self.data[min + VAL_HDR..min + VAL_HDR + value.len()].copy_from_slice(value);

        min -= key.len() + KEY_HDR;
        self.data[min] = key.len() as u8;
        self.data[min + KEY_HDR..min + KEY_HDR + key.len()].copy_from_slice(key);

        self.set_min(min as u32);
        min as u32
    }

    /// Zero everything past the header, keeping the page info.
    pub fn clear_body(&mut self) {
        for b in &mut self.data[PAGE_HDR..] {
            *b = 0;
        }
    }

    pub fn clear_all(&mut self) {
        for b in &mut self.data {
            *b = 0;
        }
    }

    pub fn copy_from(&mut self, other: &Page) {
        self.data.copy_from_slice(&other.data);
    }

    /// Room check: would a record of `keylen`/`vallen` bytes fit alongside
    /// two more slot descriptors?
    pub fn fits(&self, keylen: usize, vallen: usize) -> bool {
        self.min() as usize
            >= (self.cnt() as usize + 2) * SLOT_SIZE + PAGE_HDR + keylen + KEY_HDR + vallen + VAL_HDR
    }
}

/// Binary search the slot array for the smallest slot whose key is >= `key`.
///
/// The high fence acts as an infinite value only on the rightmost page of
/// its level; returns 0 when the key belongs on a right sibling.
pub fn find_slot(page: &Page, key: &[u8], schema: &dyn KeySchema) -> u32 {
    let mut low: u32 = 1;
    let mut higher: u32 = page.cnt();
    let mut good = false;

    if page.right() != 0 {
        higher += 1;
    } else {
        good = true;
    }

    // low is the lowest candidate, higher is already tested as >= the
    // passed key; the loop ends when they meet
    while higher > low {
        let slot = low + (higher - low) / 2;
        if schema.compare(page.key(slot), key) == Ordering::Less {
            low = slot + 1;
        } else {
            higher = slot;
            good = true;
        }
    }

    if good {
        higher
    } else {
        0
    }
}

/// Check the page for space, rebuilding it in place when enough garbage has
/// accumulated to bother. Returns 0 when the page must split instead, else
/// the slot at which the pending insert should land.
pub fn clean_page(page: &mut Page, frame: &mut Page, keylen: usize, slot: u32, vallen: usize) -> u32 {
    let page_size = page.size();

    if page.fits(keylen, vallen) {
        return slot;
    }

    // skip cleanup and proceed to split if there's not enough garbage to
    // bother with
    if (page.garbage() as usize) < page_size / 5 {
        return 0;
    }

    frame.copy_from(page);

    page.clear_body();
    page.set_garbage(0);
    page.set_act(0);

    let max = frame.cnt();
    let mut newslot = max;
    let mut nxt = page_size;
    let mut idx: u32 = 0;

    // remove deleted keys, except the fence of a leaf page
    for cnt in 1..=max {
        if cnt == slot {
            newslot = idx + 2;
        }

        if (cnt < max || frame.lvl() != 0) && frame.slot_dead(cnt) {
            continue;
        }

        let val = frame.val(cnt);
        nxt -= val.len() + VAL_HDR;
        let voff = nxt;

        let key = frame.key(cnt);
        nxt -= key.len() + KEY_HDR;

        page.data[nxt] = key.len() as u8;
        page.data[nxt + KEY_HDR..voff].copy_from_slice(key);
        page.data[voff] = val.len() as u8;
        page.data[voff + VAL_HDR..voff + VAL_HDR + val.len()].copy_from_slice(val);

        // interleave a librarian slot ahead of the real one
        idx += 1;
        page.set_slot(idx, nxt as u32, SlotType::Librarian, true);

        idx += 1;
        let dead = frame.slot_dead(cnt);
        page.set_slot(idx, nxt as u32, frame.slot_type(cnt), dead);
        if !dead {
            page.set_act(page.act() + 1);
        }
    }

    page.set_min(nxt as u32);
    page.set_cnt(idx);

    // see if the page has enough space now, or does it need splitting?
    if page.fits(keylen, vallen) {
        newslot
    } else {
        0
    }
}

/// Assemble the upper half of `src` (by slot count) into the zeroed scratch
/// frame, preserving librarian parity. The scratch becomes the image of the
/// new right sibling.
pub fn split_upper(src: &Page, frame: &mut Page, src_page_no: u64, is_root: bool) {
    frame.clear_all();

    let max = src.cnt();
    let mut nxt = frame.size();
    let mut idx: u32 = 0;

    for cnt in max / 2 + 1..=max {
        if (cnt < max || src.lvl() != 0) && src.slot_dead(cnt) {
            continue;
        }

        let val = src.val(cnt);
        nxt -= val.len() + VAL_HDR;
        let voff = nxt;

        let key = src.key(cnt);
        nxt -= key.len() + KEY_HDR;

        frame.data[nxt] = key.len() as u8;
        frame.data[nxt + KEY_HDR..voff].copy_from_slice(key);
        frame.data[voff] = val.len() as u8;
        frame.data[voff + VAL_HDR..voff + VAL_HDR + val.len()].copy_from_slice(val);

        idx += 1;
        frame.set_slot(idx, nxt as u32, SlotType::Librarian, true);

        idx += 1;
        let dead = src.slot_dead(cnt);
        frame.set_slot(idx, nxt as u32, src.slot_type(cnt), dead);
        if !dead {
            frame.set_act(frame.act() + 1);
        }
    }

    frame.set_bits(src.bits());
    frame.set_min(nxt as u32);
    frame.set_cnt(idx);
    frame.set_lvl(src.lvl());

    // link the new right node into the sibling chain
    if !is_root {
        frame.set_right(src.right());
    }
    frame.set_left(src_page_no);
}

/// Rewrite `page` with its lower half only; `frame` is scratch and receives
/// a copy of the pre-split image first.
pub fn split_lower(page: &mut Page, frame: &mut Page, right_page_no: u64) {
    frame.copy_from(page);
    page.clear_body();
    page.set_garbage(0);
    page.set_act(0);

    let mut max = frame.cnt() / 2;
    if frame.slot_type(max) == SlotType::Librarian {
        max -= 1;
    }

    let mut nxt = page.size();
    let mut idx: u32 = 0;

    for cnt in 1..=max {
        if frame.slot_dead(cnt) {
            continue;
        }

        let val = frame.val(cnt);
        nxt -= val.len() + VAL_HDR;
        let voff = nxt;

        let key = frame.key(cnt);
        nxt -= key.len() + KEY_HDR;

        page.data[nxt] = key.len() as u8;
        page.data[nxt + KEY_HDR..voff].copy_from_slice(key);
        page.data[voff] = val.len() as u8;
        page.data[voff + VAL_HDR..voff + VAL_HDR + val.len()].copy_from_slice(val);

        idx += 1;
        page.set_slot(idx, nxt as u32, SlotType::Librarian, true);

        idx += 1;
        page.set_slot(idx, nxt as u32, frame.slot_type(cnt), false);
        page.set_act(page.act() + 1);
    }

    page.set_right(right_page_no);
    page.set_min(nxt as u32);
    page.set_cnt(idx);
}

/// Install a new key and value before `slot`. The page must already be
/// checked for adequate space.
pub fn insert_slot(page: &mut Page, mut slot: u32, key: &[u8], value: &[u8], typ: SlotType) {
    // if the preceding slot is a librarian slot, use it
    if slot > 1 && page.slot_type(slot - 1) == SlotType::Librarian {
        slot -= 1;
    }

    let off = page.push_record(key, value);

    // find the first dead slot at or after the insertion point
    let mut idx = slot;
    while idx < page.cnt() {
        if page.slot_dead(idx) {
            break;
        }
        idx += 1;
    }

    let librarian;
    if idx == page.cnt() {
        idx += 2;
        page.set_cnt(page.cnt() + 2);
        librarian = 2;
    } else {
        librarian = 1;
    }

    page.set_act(page.act() + 1);

    // shift the array open, consuming the dead slot
    while idx > slot + librarian - 1 {
        page.copy_slot(idx - librarian, idx);
        idx -= 1;
    }

    if librarian > 1 {
        page.set_slot(slot, off, SlotType::Librarian, true);
        slot += 1;
    }

    page.set_slot(slot, off, typ, false);
}

/// In-memory image of the metadata/allocator page.
///
/// `right` is the next never-allocated page number, `left` the leftmost
/// leaf, `chain` the head of the free-page list threaded through `right`
/// pointers. The duplicate sequence is kept as a live atomic by the pool
/// and only serialized here.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageZero {
    pub bits: u8,
    pub right: u64,
    pub left: u64,
    pub chain: u64,
    pub dups: u64,
}

impl PageZero {
    pub fn decode(buf: &[u8]) -> PageZero {
        let mut dups = [0u8; 8];
        dups.copy_from_slice(&buf[OFF_DUPS..OFF_DUPS + 8]);
        PageZero {
            bits: buf[OFF_BITS] & !FREE_FLAG,
            right: get_id(&buf[OFF_RIGHT..]),
            left: get_id(&buf[OFF_LEFT..]),
            chain: get_id(&buf[OFF_CHAIN..]),
            dups: u64::from_le_bytes(dups),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[OFF_BITS] = self.bits;
        put_id(&mut buf[OFF_RIGHT..], self.right);
        put_id(&mut buf[OFF_LEFT..], self.left);
        put_id(&mut buf[OFF_CHAIN..], self.chain);
        buf[OFF_DUPS..OFF_DUPS + 8].copy_from_slice(&self.dups.to_le_bytes());
    }
}
