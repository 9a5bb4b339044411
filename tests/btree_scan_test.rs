mod common;

use std::collections::HashSet;

use blink_db::BLinkTree;
use common::{assert_integrity, collect_scan, int_key, new_pool};
use rand::Rng;

#[test]
fn test_scan_empty_tree() {
    let pool = new_pool("scan_empty.db", 12);
    let mut tree = BLinkTree::new(&pool);

    assert_eq!(collect_scan(&mut tree).len(), 0);
    tree.latch_audit().unwrap();
}

#[test]
fn test_scan_random_keys_in_order() {
    let pool = new_pool("scan_random.db", 12);
    let mut tree = BLinkTree::new(&pool);

    // 1000 random distinct keys
    let mut rng = rand::thread_rng();
    let mut keys: HashSet<u64> = HashSet::new();
    while keys.len() < 1000 {
        keys.insert(rng.gen_range(0, u64::MAX / 2));
    }

    for &v in &keys {
        tree.insert(&int_key(v), 0, v + 1, 1).unwrap();
    }

    let mut expected: Vec<u64> = keys.into_iter().collect();
    expected.sort();

    // the full scan yields every key, ascending, exactly once
    let rows = collect_scan(&mut tree);
    assert_eq!(rows.len(), expected.len());
    for (row, &v) in rows.iter().zip(expected.iter()) {
        assert_eq!(row.0, int_key(v));
        assert_eq!(row.1, v + 1);
    }

    assert_integrity(&mut tree);
    tree.latch_audit().unwrap();
}

#[test]
fn test_scan_from_key_starts_midway() {
    let pool = new_pool("scan_midway.db", 12);
    let mut tree = BLinkTree::new(&pool);

    for v in 0..500u64 {
        tree.insert(&int_key(v * 2), 0, v + 1, 1).unwrap();
    }

    // seek to a key that is absent; the cursor lands on the next one up
    let mut slot = tree.start_scan(&int_key(701)).unwrap();
    let mut seen = Vec::new();
    while slot != 0 {
        if let Some((key, _)) = tree.cursor_entry(slot) {
            seen.push(key);
        }
        slot = tree.next_scan(slot).unwrap();
    }

    assert_eq!(seen.first().unwrap(), &int_key(702));
    assert_eq!(seen.len(), (999 - 702) / 2 + 1);
    tree.latch_audit().unwrap();
}

#[test]
fn test_scan_skips_tombstones() {
    let pool = new_pool("scan_tombstone.db", 12);
    let mut tree = BLinkTree::new(&pool);

    for v in 0..100u64 {
        tree.insert(&int_key(v), 0, v + 1, 1).unwrap();
    }
    for v in (0..100u64).filter(|v| v % 3 == 0) {
        tree.delete(&int_key(v), 0).unwrap();
    }

    let rows = collect_scan(&mut tree);
    let expected: Vec<u64> = (0..100u64).filter(|v| v % 3 != 0).collect();
    assert_eq!(rows.len(), expected.len());
    for (row, &v) in rows.iter().zip(expected.iter()) {
        assert_eq!(row.0, int_key(v));
    }

    assert_integrity(&mut tree);
    tree.latch_audit().unwrap();
}
