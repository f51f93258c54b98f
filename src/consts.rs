//! On-disk layout constants for the KV and OKV layers.
//!
//! Byte offsets mirror the original engine's fixed layout; see
//! DESIGN.md for the grounding source of each group.

/// File header marker, at offset 0.
pub const HEADER_MARKER: &[u8; 4] = b"KVDB";
/// Current on-disk format version. A file stuck at version 0 is a
/// create() that crashed before the version bytes were rewritten.
pub const HEADER_VERSION: u32 = 5;
pub const HEADER_VERSION_INCOMPLETE: u32 = 0;

pub const HEADER_MARKER_OFFSET: u64 = 0;
pub const HEADER_VERSION_OFFSET: u64 = 4;
pub const HEADER_FIRSTMAXCOUNT_OFFSET: u64 = 8;
pub const HEADER_COMPRESSION_OFFSET: u64 = 16;
pub const HEADER_FILESIZE_OFFSET: u64 = 20;
pub const HEADER_FREELIST_OFFSET: u64 = 28;

pub const FREELIST_CLASS_COUNT: usize = 64;
/// End of the header region: the freelist table is the last header
/// field, so this is simply its offset plus its own length. Derived
/// from the offsets above rather than hand-summed, so the two can
/// never drift apart.
pub const HEADER_SIZE: u64 = HEADER_FREELIST_OFFSET + (FREELIST_CLASS_COUNT as u64) * 8;

pub const JOURNAL_MARKER: &[u8; 4] = b"KVJL";
pub const JOURNAL_HEADER_SIZE: u64 = 8; // marker(4) + checksum(4)
pub const JOURNAL_RECORD_HEADER_SIZE: u64 = 8 + 2; // offset(8) + length(2)
pub const JOURNAL_SUFFIX: &str = "journal";

// Table layout.
pub const TABLE_NEXT_TABLE_OFFSET: u64 = 0;
pub const TABLE_COUNT_OFFSET: u64 = 8;
pub const TABLE_BLOOM_SIZE_OFFSET: u64 = 16;
pub const TABLE_MAX_COUNT_OFFSET: u64 = 24;
pub const TABLE_BLOOM_FILTER_OFFSET: u64 = 32;
pub const TABLE_HEADER_SIZE: u64 = 8 + 8 + 8 + 8;

pub const FIRST_TABLE_MAX_COUNT: u64 = 1 << 17;
pub const TABLE_BITS_FOR_BLOOM_FILTER: u64 = 5;
pub const BLOOM_FILTER_HASH_COUNT: usize = 3;
pub const MAX_MEAN_COLLISION: u64 = 3;

// Data block layout.
pub const BLOCK_NEXT_OFFSET_OFFSET: u64 = 0;
pub const BLOCK_HASH_VALUE_OFFSET: u64 = 8;
pub const BLOCK_LOG2SIZE_OFFSET: u64 = 12;
pub const BLOCK_KEY_SIZE_OFFSET: u64 = 13;
pub const BLOCK_KEY_BYTES_OFFSET: u64 = 21;
pub const BLOCK_FIXED_HEADER_SIZE: u64 = 8 + 4 + 1 + 8 + 8; // 29

pub const PRE_READ_KEY_SIZE: usize = 128;

pub const IMPLICIT_TRANSACTION_MAX_OP: u64 = 10_000;

// OKV layout.
pub const METAKEY_PREFIX: &[u8] = b"\0kvdbo";
pub const NODE_KEY_PREFIX: &[u8] = b"n";
pub const MASTER_NODE_KEY: &[u8] = b"m";

pub const MAX_CHANGES_COUNT: u64 = 16384;
pub const MAX_KEYS_PER_NODE: u64 = 16384;
pub const KEYS_PER_NODE_MERGE_THRESHOLD: u64 = MAX_KEYS_PER_NODE / 4;
pub const MEAN_KEYS_PER_NODE: u64 = MAX_KEYS_PER_NODE / 2;