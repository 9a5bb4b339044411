mod common;

use blink_db::BLinkTree;
use common::{assert_integrity, collect_scan, long_key, new_pool};

#[test]
fn test_delete_then_find() {
    let pool = new_pool("delete_basic.db", 12);
    let mut tree = BLinkTree::new(&pool);

    tree.insert(b"apple", 0, 7, 1).unwrap();
    tree.insert(b"banana", 0, 8, 1).unwrap();

    tree.delete(b"apple", 0).unwrap();
    assert!(tree.found());
    assert_eq!(tree.find(b"apple").unwrap(), 0);
    assert_eq!(tree.find(b"banana").unwrap(), 8);

    // deleting a missing key is not an error
    tree.delete(b"cherry", 0).unwrap();
    assert!(!tree.found());
    tree.delete(b"apple", 0).unwrap();
    assert!(!tree.found());

    // a tombstoned key can come back
    tree.insert(b"apple", 0, 9, 2).unwrap();
    assert_eq!(tree.find(b"apple").unwrap(), 9);

    assert_integrity(&mut tree);
    tree.latch_audit().unwrap();
}

#[test]
fn test_delete_leaf_fence() {
    // the greatest key of a leaf is its fence; deleting it leaves a
    // tombstone that keeps routing until compaction
    let pool = new_pool("delete_fence.db", 12);
    let mut tree = BLinkTree::new(&pool);

    for v in 0..40u64 {
        tree.insert(&long_key(v), 0, v + 1, 1).unwrap();
    }

    // descending order deletes each leaf's greatest key first
    let rows = collect_scan(&mut tree);
    assert_eq!(rows.len(), 40);

    for v in (0..40u64).rev() {
        tree.delete(&long_key(v), 0).unwrap();
        assert!(tree.found(), "key {} missing at delete", v);
        assert_eq!(tree.find(&long_key(v)).unwrap(), 0);
    }

    assert_eq!(collect_scan(&mut tree).len(), 0);
    assert_integrity(&mut tree);
    tree.latch_audit().unwrap();
}

#[test]
fn test_delete_causes_merge() {
    // two dozen fat keys split into several leaves; deleting the lower
    // range empties the left leaf, which absorbs its right sibling and
    // sends the sibling to the free list
    let pool = new_pool("delete_merge.db", 12);
    let mut tree = BLinkTree::new(&pool);

    for v in 0..24u64 {
        tree.insert(&long_key(v), 0, v + 1, 1).unwrap();
    }
    assert_eq!(pool.free_head(), 0);

    for v in 0..19u64 {
        tree.delete(&long_key(v), 0).unwrap();
        assert!(tree.found());
    }

    for v in 0..19u64 {
        assert_eq!(tree.find(&long_key(v)).unwrap(), 0, "key {}", v);
    }
    for v in 19..24u64 {
        assert_eq!(tree.find(&long_key(v)).unwrap(), v + 1, "key {}", v);
    }

    // at least one emptied page went back to the free list
    assert_ne!(pool.free_head(), 0);

    assert_integrity(&mut tree);
    tree.latch_audit().unwrap();
}

#[test]
fn test_mass_delete_collapses_tree() {
    // three levels up, then tear everything down; merges must cascade
    // and the root must collapse back toward a single leaf
    let pool = new_pool("delete_collapse.db", 12);
    let mut tree = BLinkTree::new(&pool);

    let rows = 600u64;
    for v in 0..rows {
        tree.insert(&long_key(v), 0, v + 1, 1).unwrap();
    }
    assert_integrity(&mut tree);

    for v in 0..rows {
        tree.delete(&long_key(v), 0).unwrap();
        assert!(tree.found(), "key {} missing at delete", v);
    }

    for v in 0..rows {
        assert_eq!(tree.find(&long_key(v)).unwrap(), 0);
    }
    assert_eq!(collect_scan(&mut tree).len(), 0);

    // the emptied pages are reclaimable
    assert_ne!(pool.free_head(), 0);
    assert_integrity(&mut tree);
    tree.latch_audit().unwrap();

    // freed pages get reused before the file grows again
    let water_mark = pool.high_water();
    for v in 0..rows {
        tree.insert(&long_key(v), 0, v + 1, 2).unwrap();
    }
    for v in 0..rows {
        assert_eq!(tree.find(&long_key(v)).unwrap(), v + 1);
    }
    assert!(pool.high_water() <= water_mark + 1);
    assert_integrity(&mut tree);
    tree.latch_audit().unwrap();
}

#[test]
fn test_alternating_insert_delete() {
    let pool = new_pool("delete_alternate.db", 12);
    let mut tree = BLinkTree::new(&pool);

    for round in 0..4u64 {
        for v in 0..120u64 {
            tree.insert(&long_key(v), 0, round * 1000 + v, 1).unwrap();
        }
        for v in (0..120u64).filter(|v| v % 2 == round % 2) {
            tree.delete(&long_key(v), 0).unwrap();
        }
        assert_integrity(&mut tree);
    }
    tree.latch_audit().unwrap();
}
