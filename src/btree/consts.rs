/// Page numbers are 48 bits on disk, handled as u64 in memory.
pub type PageId = u64;

/// Packed on-disk PageId size in bytes.
pub const ID_LEN: usize = 6;

/// Page size bounds, lg(4K) .. lg(16M).
pub const MIN_PAGE_BITS: u32 = 12;
pub const MAX_PAGE_BITS: u32 = 24;

/// The smallest page size; also the mmap alignment unit.
pub const MIN_PAGE_SIZE: usize = 1 << MIN_PAGE_BITS as usize;

/// Reserved page numbers.
pub const ALLOC_PAGE: PageId = 0;
pub const ROOT_PAGE: PageId = 1;
pub const LEAF_PAGE: PageId = 2;
pub const LATCH_PAGE: PageId = 3;

/// Number of latch manager slots backed by the reserved latch pages.
pub const LATCH_TABLE: usize = 1024;

/// Maximum number of key bytes.
pub const MAX_KEY_LEN: usize = 255;

/// The +infinity fence on rightmost pages.
pub const STOPPER_KEY: [u8; 2] = [0xff, 0xff];

/// Page header and slot geometry, see `page.rs`.
pub const PAGE_HEADER_SIZE: usize = 24;
pub const SLOT_SIZE: usize = 16;
