#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
};

use small_index::{utils, BTreeHandle, BTreeIndex};

pub const DEFAULT_PAGE_BITS: u8 = 12;
pub const DEFAULT_POOL_FRAMES: usize = 256;

static SEQ: AtomicUsize = AtomicUsize::new(0);

/// # Conduct the initialization
///
/// - Setting up log configurations.
pub fn setup() {
    utils::init_log();
}

/// A fresh file path under the system temp directory; any leftover from a
/// previous run is removed.
pub fn temp_index_path(name: &str) -> PathBuf {
    let seq = SEQ.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "small-index-{}-{}-{}.db",
        name,
        std::process::id(),
        seq
    ));
    let _ = std::fs::remove_file(&path);
    path
}

/// Open a byte-ordered index with the default geometry (page size 4096,
/// pool of 256 frames).
pub fn open_default(name: &str) -> (BTreeIndex, PathBuf) {
    setup();
    let path = temp_index_path(name);
    let index = BTreeIndex::open_bytes(&path, DEFAULT_PAGE_BITS, DEFAULT_POOL_FRAMES).unwrap();
    (index, path)
}

pub fn key(i: usize) -> Vec<u8> {
    format!("k{:05}", i).into_bytes()
}

pub fn val(i: usize) -> Vec<u8> {
    format!("v{:05}", i).into_bytes()
}

/// A key padded out to `len` bytes, still ordered by `i`.
pub fn wide_key(i: usize, len: usize) -> Vec<u8> {
    let mut k = format!("k{:08}", i).into_bytes();
    k.resize(len, b'.');
    k
}

pub fn insert_range(h: &mut BTreeHandle, range: std::ops::Range<usize>) {
    for i in range {
        h.insert_key(&key(i), &val(i), 0, true).unwrap();
    }
}

/// Collect the whole index through a forward scan.
pub fn collect_scan(h: &mut BTreeHandle) -> Vec<(Vec<u8>, Vec<u8>)> {
    h.iter_from(b"\x00").unwrap().collect()
}

/// Collect the whole index through a reverse scan, highest key first.
pub fn collect_scan_rev(h: &mut BTreeHandle) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut slot = h.scan_last().unwrap();
    while slot != 0 {
        out.push((h.cursor_key(slot).to_vec(), h.cursor_val(slot).to_vec()));
        slot = h.scan_prev(slot).unwrap();
    }
    out
}
