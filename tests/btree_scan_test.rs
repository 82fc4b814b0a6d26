use itertools::Itertools;
use rand::prelude::*;

mod test_utils;

use test_utils::*;

#[test]
// A full forward scan returns every key in schema order, whatever order
// they went in.
fn test_scan_is_sorted() {
    let (index, path) = open_default("scan_sorted");
    let mut h = index.handle();

    let mut order: Vec<usize> = (0..3000).collect();
    order.shuffle(&mut rand::thread_rng());
    for i in order {
        h.insert_key(&key(i), &val(i), 0, true).unwrap();
    }

    let rows = collect_scan(&mut h);
    assert_eq!(rows.len(), 3000);
    assert!(rows.iter().map(|(k, _)| k.clone()).tuple_windows().all(|(a, b)| a < b));

    for (i, (k, v)) in rows.iter().enumerate() {
        assert_eq!(k, &key(i));
        assert_eq!(v, &val(i));
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
// A scan can start in the middle and picks up at the first key >= the
// probe.
fn test_scan_from_middle() {
    let (index, path) = open_default("scan_middle");
    let mut h = index.handle();

    insert_range(&mut h, 0..1000);

    let rows: Vec<_> = h.iter_from(&key(700)).unwrap().collect();
    assert_eq!(rows.len(), 300);
    assert_eq!(rows[0].0, key(700));

    // a probe between stored keys lands on the next one
    let rows: Vec<_> = h.iter_from(b"k00700x").unwrap().take(1).collect();
    assert_eq!(rows[0].0, key(701));

    let _ = std::fs::remove_file(&path);
}

#[test]
// A reverse scan is the exact mirror of the forward scan.
fn test_forward_equals_reversed_backward() {
    let (index, path) = open_default("scan_mirror");
    let mut h = index.handle();

    insert_range(&mut h, 0..2500);

    let forward = collect_scan(&mut h);
    let mut backward = collect_scan_rev(&mut h);
    backward.reverse();

    assert_eq!(forward.len(), 2500);
    assert_eq!(forward, backward);

    let _ = std::fs::remove_file(&path);
}

#[test]
// Reverse scans stay correct after deletes have merged pages away.
fn test_reverse_scan_after_merges() {
    let (index, path) = open_default("scan_after_merge");
    let mut h = index.handle();

    insert_range(&mut h, 0..2000);
    for i in 400..1600 {
        h.delete_key(&key(i), 0, true).unwrap();
    }

    let forward = collect_scan(&mut h);
    let mut backward = collect_scan_rev(&mut h);
    backward.reverse();

    assert_eq!(forward.len(), 800);
    assert_eq!(forward, backward);

    let _ = std::fs::remove_file(&path);
}

#[test]
// Duplicates of one key scan back in duplicate-counter order, even when
// they straddle page splits.
fn test_scan_duplicates_in_insertion_order() {
    let (index, path) = open_default("scan_dups");
    let mut h = index.handle();

    for i in 0..800 {
        let payload = format!("payload-{:06}", i);
        h.insert_key(b"same-key", payload.as_bytes(), 0, false).unwrap();
    }

    let rows = collect_scan(&mut h);
    assert_eq!(rows.len(), 800);
    for (i, (k, v)) in rows.iter().enumerate() {
        assert_eq!(k, b"same-key");
        assert_eq!(v, format!("payload-{:06}", i).as_bytes());
    }

    let _ = std::fs::remove_file(&path);
}
