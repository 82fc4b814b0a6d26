use small_index::BatchPage;

mod test_utils;

use test_utils::*;

fn new_batch() -> BatchPage {
    BatchPage::new(1 << DEFAULT_PAGE_BITS)
}

#[test]
// Two inserts in one batch both land and are both visible afterwards.
fn test_batch_insert_pair() {
    let (index, path) = open_default("batch_pair");
    let mut h = index.handle();

    let mut batch = new_batch();
    batch.add_insert(b"k1", b"v1").unwrap();
    batch.add_insert(b"k2", b"v2").unwrap();

    assert_eq!(h.atomic_batch(&mut batch, true).unwrap(), 0);
    assert_eq!(h.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(h.get(b"k2").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(h.check_integrity().unwrap(), 2);

    let _ = std::fs::remove_file(&path);
}

#[test]
// A unique batch containing the same key twice reports the second
// occurrence and applies nothing.
fn test_batch_unique_violation_inside_batch() {
    let (index, path) = open_default("batch_dup_inside");
    let mut h = index.handle();

    let mut batch = new_batch();
    batch.add_insert(b"a", b"1").unwrap();
    batch.add_insert(b"b", b"2").unwrap();
    batch.add_delete(b"c").unwrap();
    batch.add_insert(b"a", b"3").unwrap();

    let violating = h.atomic_batch(&mut batch, true).unwrap();
    assert_eq!(violating, 2, "the second 'a' in sorted order violates");

    assert_eq!(h.get(b"a").unwrap(), None);
    assert_eq!(h.get(b"b").unwrap(), None);
    assert_eq!(h.check_integrity().unwrap(), 0);

    let _ = std::fs::remove_file(&path);
}

#[test]
// The same batch without uniqueness stores both 'a' records in duplicate
// order.
fn test_batch_duplicates_applied_in_order() {
    let (index, path) = open_default("batch_dups");
    let mut h = index.handle();

    let mut batch = new_batch();
    batch.add_insert(b"a", b"1").unwrap();
    batch.add_insert(b"b", b"2").unwrap();
    batch.add_delete(b"c").unwrap();
    batch.add_insert(b"a", b"3").unwrap();

    assert_eq!(h.atomic_batch(&mut batch, false).unwrap(), 0);

    let rows = collect_scan(&mut h);
    assert_eq!(
        rows,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"a".to_vec(), b"3".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
        ]
    );

    let _ = std::fs::remove_file(&path);
}

#[test]
// A batch colliding with a pre-existing key reports it and leaves the
// other batch keys unapplied.
fn test_batch_violation_against_existing_key() {
    let (index, path) = open_default("batch_existing");
    let mut h = index.handle();

    h.insert_key(b"existing", b"x", 0, true).unwrap();

    let mut batch = new_batch();
    batch.add_insert(b"aaa", b"1").unwrap();
    batch.add_insert(b"existing", b"clobber").unwrap();
    batch.add_insert(b"zzz", b"2").unwrap();

    let violating = h.atomic_batch(&mut batch, true).unwrap();
    assert_eq!(violating, 2);

    assert_eq!(h.get(b"aaa").unwrap(), None);
    assert_eq!(h.get(b"zzz").unwrap(), None);
    assert_eq!(h.get(b"existing").unwrap(), Some(b"x".to_vec()));
    assert_eq!(h.check_integrity().unwrap(), 1);

    let _ = std::fs::remove_file(&path);
}

#[test]
// Mixed inserts and deletes across many leaves apply as one unit.
fn test_batch_across_many_leaves() {
    let (index, path) = open_default("batch_wide");
    let mut h = index.handle();

    insert_range(&mut h, 0..2000);

    let mut batch = new_batch();
    for i in (0..2000).step_by(40) {
        batch.add_delete(&key(i)).unwrap();
    }
    for i in 2000..2050 {
        batch.add_insert(&key(i), &val(i)).unwrap();
    }

    assert_eq!(h.atomic_batch(&mut batch, true).unwrap(), 0);

    assert_eq!(h.check_integrity().unwrap(), 2000 - 50 + 50);
    for i in (0..2000).step_by(40) {
        assert_eq!(h.get(&key(i)).unwrap(), None);
    }
    for i in 2000..2050 {
        assert_eq!(h.get(&key(i)).unwrap(), Some(val(i)));
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
// A batch big enough to overflow its target leaves drives the split
// chain machinery.
fn test_batch_splits_target_leaves() {
    let (index, path) = open_default("batch_split");
    let mut h = index.handle();

    // pre-fill a narrow key range so the batch targets few leaves
    for i in 0..120 {
        h.insert_key(&wide_key(i, 24), b"seed", 0, true).unwrap();
    }

    let mut batch = new_batch();
    for i in 0..25 {
        let payload = vec![b'p'; 120];
        batch.add_insert(&wide_key(i * 4 + 1000, 24), &payload).unwrap();
    }
    assert_eq!(h.atomic_batch(&mut batch, true).unwrap(), 0);

    assert_eq!(h.check_integrity().unwrap(), 145);
    for i in 0..25 {
        let got = h.get(&wide_key(i * 4 + 1000, 24)).unwrap().unwrap();
        assert_eq!(got.len(), 120);
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
// A batch that empties whole leaves frees them through the deferred
// fence queue.
fn test_batch_empties_leaves() {
    let (index, path) = open_default("batch_empty");
    let mut h = index.handle();

    insert_range(&mut h, 0..1200);

    let mut batch = new_batch();
    for i in 0..150 {
        batch.add_delete(&key(i)).unwrap();
    }
    assert_eq!(h.atomic_batch(&mut batch, true).unwrap(), 0);

    let mut batch = new_batch();
    for i in 150..300 {
        batch.add_delete(&key(i)).unwrap();
    }
    assert_eq!(h.atomic_batch(&mut batch, true).unwrap(), 0);

    assert_eq!(h.check_integrity().unwrap(), 900);
    assert_eq!(h.get(&key(0)).unwrap(), None);
    assert_eq!(h.get(&key(299)).unwrap(), None);
    assert_eq!(h.get(&key(300)).unwrap(), Some(val(300)));

    let forward = collect_scan(&mut h);
    assert_eq!(forward.len(), 900);

    let _ = std::fs::remove_file(&path);
}

#[test]
// An empty batch is a successful no-op.
fn test_empty_batch() {
    let (index, path) = open_default("batch_nothing");
    let mut h = index.handle();

    let mut batch = new_batch();
    assert_eq!(h.atomic_batch(&mut batch, true).unwrap(), 0);
    assert_eq!(h.check_integrity().unwrap(), 0);

    let _ = std::fs::remove_file(&path);
}
