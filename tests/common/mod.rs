use std::fs;
use std::sync::{Arc, Once};

use blink_db::{BLinkTree, BufferPool, OpenMode};

static INIT: Once = Once::new();

pub const POOL_MAX: usize = 64;
pub const SEG_BITS: u32 = 3;
pub const HASH_SIZE: usize = 16;

/// Set up log configurations once per test binary.
pub fn setup() {
    INIT.call_once(blink_db::log::init_log);
}

/// Create a fresh index file under the temp directory and open a pool
/// over it.
pub fn new_pool(name: &str, page_bits: u32) -> Arc<BufferPool> {
    setup();
    let path = std::env::temp_dir().join(name);
    let _ = fs::remove_file(&path);
    BufferPool::create(
        &path,
        OpenMode::ReadWrite,
        page_bits,
        POOL_MAX,
        SEG_BITS,
        HASH_SIZE,
    )
    .unwrap()
}

/// Reopen an existing index file; the stored page size wins.
pub fn reopen_pool(name: &str) -> Arc<BufferPool> {
    let path = std::env::temp_dir().join(name);
    BufferPool::create(
        &path,
        OpenMode::ReadWrite,
        0,
        POOL_MAX,
        SEG_BITS,
        HASH_SIZE,
    )
    .unwrap()
}

/// Fixed-width big-endian keys sort the same as their integers.
pub fn int_key(v: u64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

/// A long key forces small per-page fanout, so a handful of inserts
/// splits pages even at the minimum page size.
pub fn long_key(v: u64) -> Vec<u8> {
    let mut key = format!("{:06}", v).into_bytes();
    key.resize(250, b'x');
    key
}

/// Walk the whole index in key order through the scan cursor.
pub fn collect_scan(tree: &mut BLinkTree) -> Vec<(Vec<u8>, u64)> {
    let mut rows = Vec::new();
    let mut slot = tree.start_scan(&[]).unwrap();
    while slot != 0 {
        if let Some(entry) = tree.cursor_entry(slot) {
            rows.push(entry);
        }
        slot = tree.next_scan(slot).unwrap();
    }
    rows
}

/// Check the structural invariants, dumping the tree on failure.
pub fn assert_integrity(tree: &mut BLinkTree) {
    if let Err(e) = tree.check_integrity() {
        tree.draw_tree();
        e.show_backtrace();
        panic!("integrity check failed: {}", e);
    }
}
