mod test_utils;

use test_utils::*;

#[test]
// Delete one key out of ten; the rest keep their values.
fn test_delete_one_of_ten() {
    let (index, path) = open_default("delete_one");
    let mut h = index.handle();

    for i in 1..=10 {
        let key = format!("k{:02}", i);
        let val = format!("v{:02}", i);
        h.insert_key(key.as_bytes(), val.as_bytes(), 0, true).unwrap();
    }

    h.delete_key(b"k05", 0, true).unwrap();

    let rows = collect_scan(&mut h);
    assert_eq!(rows.len(), 9);
    assert!(rows.iter().all(|(k, _)| k != b"k05"));

    assert_eq!(h.get(b"k05").unwrap(), None);
    assert_eq!(h.get(b"k04").unwrap(), Some(b"v04".to_vec()));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_insert_delete_find_roundtrip() {
    let (index, path) = open_default("delete_roundtrip");
    let mut h = index.handle();

    h.insert_key(b"phantom", b"v", 0, true).unwrap();
    assert_eq!(h.get(b"phantom").unwrap(), Some(b"v".to_vec()));

    h.delete_key(b"phantom", 0, true).unwrap();
    assert_eq!(h.get(b"phantom").unwrap(), None);

    // deleting a key that isn't there is a quiet no-op
    h.delete_key(b"phantom", 0, true).unwrap();
    assert_eq!(h.check_integrity().unwrap(), 0);

    let _ = std::fs::remove_file(&path);
}

#[test]
// Alternating deletes leave half-full pages behind; everything that
// remains is still found and ordered.
fn test_delete_every_other_key() {
    let (index, path) = open_default("delete_alternate");
    let mut h = index.handle();

    insert_range(&mut h, 0..2000);
    for i in (0..2000).step_by(2) {
        h.delete_key(&key(i), 0, true).unwrap();
    }

    assert_eq!(h.check_integrity().unwrap(), 1000);

    for i in 0..2000 {
        let expect = if i % 2 == 0 { None } else { Some(val(i)) };
        assert_eq!(h.get(&key(i)).unwrap(), expect, "key {}", i);
    }

    let rows = collect_scan(&mut h);
    assert_eq!(rows.len(), 1000);
    assert!(rows.windows(2).all(|w| w[0].0 < w[1].0));

    let _ = std::fs::remove_file(&path);
}

#[test]
// Draining whole pages merges them away and the root pulls its single
// child up, shrinking the tree by at least one level.
fn test_mass_delete_collapses_tree() {
    let (index, path) = open_default("delete_collapse");
    let mut h = index.handle();

    for i in 0..1000 {
        h.insert_key(&wide_key(i, 200), &val(i), 0, true).unwrap();
    }
    let tall = h.tree_height().unwrap();
    assert!(tall >= 3);

    for i in 0..950 {
        h.delete_key(&wide_key(i, 200), 0, true).unwrap();
    }

    let short = h.tree_height().unwrap();
    assert!(
        short < tall,
        "tree height did not shrink: {} -> {}",
        tall,
        short
    );

    assert_eq!(h.check_integrity().unwrap(), 50);
    for i in 950..1000 {
        assert_eq!(h.get(&wide_key(i, 200)).unwrap(), Some(val(i)));
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
// Emptying the index completely leaves a sane, reusable tree.
fn test_delete_everything_then_reuse() {
    let (index, path) = open_default("delete_all");
    let mut h = index.handle();

    insert_range(&mut h, 0..1500);
    for i in 0..1500 {
        h.delete_key(&key(i), 0, true).unwrap();
    }

    assert_eq!(h.check_integrity().unwrap(), 0);
    assert_eq!(collect_scan(&mut h).len(), 0);

    // freed pages come back through the allocator chain
    insert_range(&mut h, 0..100);
    assert_eq!(h.check_integrity().unwrap(), 100);

    let _ = std::fs::remove_file(&path);
}

#[test]
// Deleting a page's highest key forces the fence repair path in the
// parent.
fn test_delete_fence_keys() {
    let (index, path) = open_default("delete_fence");
    let mut h = index.handle();

    insert_range(&mut h, 0..2000);

    // walk the leaf chain collecting the last key of every non-rightmost
    // page, which is that page's fence
    let mut fences = Vec::new();
    let mut slot = h.scan_start(&key(0)).unwrap();
    let mut cur_page = h.cursor_page_no();
    let mut prev_key: Option<Vec<u8>> = None;
    while slot != 0 {
        if h.cursor_page_no() != cur_page {
            cur_page = h.cursor_page_no();
            if let Some(fence) = prev_key.take() {
                fences.push(fence);
            }
        }
        prev_key = Some(h.cursor_key(slot).to_vec());
        slot = h.scan_next(slot).unwrap();
    }

    assert!(!fences.is_empty());
    for f in &fences {
        h.delete_key(f, 0, true).unwrap();
    }

    let expected = 2000 - fences.len() as u64;
    assert_eq!(h.check_integrity().unwrap(), expected);

    let _ = std::fs::remove_file(&path);
}
