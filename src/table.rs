//! A single fixed-capacity hash table: header, Bloom filter bytes and
//! the bucket head array, mapped read-write over its region of the
//! database file.
//!
//! A `Table`'s mmap is only ever used as a read cache. Every mutation
//! that must survive a crash goes through the journal as a positional
//! write to the underlying file descriptor; because the mmap is a
//! `MAP_SHARED` view of the same pages, those writes become visible
//! through the mapping without any extra synchronization. This sidesteps
//! the munmap-without-msync hazard the original engine's recovery path
//! has: this crate never mmaps for journal replay, only for committed
//! reads.

use byteorder::{BigEndian, ByteOrder};
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::codec::hash::bloom_hashes;
use crate::consts::*;
use crate::error::Result;
use crate::primes::next_prime;

/// Reads a table's `(next_table_offset, count, maxcount)` directly from
/// the file, without mapping it. Used when walking the table chain on
/// open, since a table's own `maxcount` field must be known before its
/// region (bloom filter size depends on it) can be mapped.
pub fn read_table_header(file: &File, offset: u64) -> Result<(u64, u64, u64)> {
    let mut buf = [0u8; TABLE_HEADER_SIZE as usize];
    file.read_exact_at(&mut buf, offset)?;
    let next_table_offset = BigEndian::read_u64(&buf[TABLE_NEXT_TABLE_OFFSET as usize..]);
    let count = BigEndian::read_u64(&buf[TABLE_COUNT_OFFSET as usize..]);
    let maxcount = BigEndian::read_u64(&buf[TABLE_MAX_COUNT_OFFSET as usize..]);
    Ok((next_table_offset, count, maxcount))
}

/// Number of Bloom filter bits for a table sized `maxcount`.
pub fn bloom_filter_bits(maxcount: u64) -> u64 {
    next_prime(maxcount * TABLE_BITS_FOR_BLOOM_FILTER)
}

/// Byte length of the Bloom filter region, rounded up to a whole byte.
pub fn bloom_filter_bytes(maxcount: u64) -> u64 {
    (bloom_filter_bits(maxcount) + 7) / 8
}

/// Total on-disk size of a table sized `maxcount`, header through the
/// last bucket head.
pub fn table_size(maxcount: u64) -> u64 {
    TABLE_HEADER_SIZE + bloom_filter_bytes(maxcount) + maxcount * 8
}

pub struct Table {
    pub offset: u64,
    pub maxcount: u64,
    pub bloom_bits: u64,
    bloom_bytes: u64,
    mmap: MmapMut,
}

impl Table {
    /// Maps the table region `[offset, offset + table_size(maxcount))`
    /// of `file` read-write.
    pub fn open(file: &File, offset: u64, maxcount: u64) -> Result<Self> {
        let bloom_bytes = bloom_filter_bytes(maxcount);
        let size = table_size(maxcount);
        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(size as usize)
                .map_mut(file)?
        };
        Ok(Table {
            offset,
            maxcount,
            bloom_bits: bloom_filter_bits(maxcount),
            bloom_bytes,
            mmap,
        })
    }

    fn bucket_array_offset(&self) -> usize {
        (TABLE_HEADER_SIZE + self.bloom_bytes) as usize
    }

    pub fn next_table_offset(&self) -> u64 {
        BigEndian::read_u64(&self.mmap[TABLE_NEXT_TABLE_OFFSET as usize..])
    }

    pub fn count(&self) -> u64 {
        BigEndian::read_u64(&self.mmap[TABLE_COUNT_OFFSET as usize..])
    }

    pub fn bucket_head(&self, bucket: u64) -> u64 {
        let pos = self.bucket_array_offset() + (bucket as usize) * 8;
        BigEndian::read_u64(&self.mmap[pos..])
    }

    /// Absolute file offset of the bucket head slot for `bucket`.
    pub fn bucket_head_file_offset(&self, bucket: u64) -> u64 {
        self.offset + self.bucket_array_offset() as u64 + bucket * 8
    }

    pub fn bucket_of_hash(&self, hash: u32) -> u64 {
        (hash as u64) % self.maxcount
    }

    /// Tests the Bloom filter for possible membership using `h1`/`h2`
    /// from `bloom_hashes(key, 3)` (index 0, the block hash, is not a
    /// probe).
    pub fn might_contain(&self, probes: &[u32]) -> bool {
        for &h in probes {
            let idx = (h as u64) % self.bloom_bits;
            let byte = self.mmap[TABLE_BLOOM_FILTER_OFFSET as usize + (idx / 8) as usize];
            if byte & (1 << (idx % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn bloom_probes(key: &[u8]) -> Vec<u32> {
        let all = bloom_hashes(key, BLOOM_FILTER_HASH_COUNT);
        all[1..].to_vec()
    }

    /// Absolute file offset of the byte holding bit `idx` of the Bloom
    /// filter, used by the transaction to build journal records for
    /// Bloom-filter deltas.
    pub fn bloom_byte_file_offset(&self, bit_index: u64) -> u64 {
        self.offset + TABLE_BLOOM_FILTER_OFFSET + bit_index / 8
    }

    pub fn bloom_byte(&self, bit_index: u64) -> u8 {
        self.mmap[TABLE_BLOOM_FILTER_OFFSET as usize + (bit_index / 8) as usize]
    }

    pub fn count_file_offset(&self) -> u64 {
        self.offset + TABLE_COUNT_OFFSET
    }

    pub fn next_table_offset_file_offset(&self) -> u64 {
        self.offset + TABLE_NEXT_TABLE_OFFSET
    }

    pub fn bucket_count(&self) -> u64 {
        self.maxcount
    }
}

/// Builds the zero-filled byte image of a brand-new table header
/// (count = 0, bloom filter cleared, bucket heads cleared), used by the
/// transaction when computing journal writes for table creation.
pub fn new_table_image(maxcount: u64) -> Vec<u8> {
    let size = table_size(maxcount) as usize;
    let mut buf = vec![0u8; size];
    BigEndian::write_u64(&mut buf[TABLE_NEXT_TABLE_OFFSET as usize..], 0);
    BigEndian::write_u64(&mut buf[TABLE_COUNT_OFFSET as usize..], 0);
    BigEndian::write_u64(
        &mut buf[TABLE_BLOOM_SIZE_OFFSET as usize..],
        bloom_filter_bits(maxcount),
    );
    BigEndian::write_u64(&mut buf[TABLE_MAX_COUNT_OFFSET as usize..], maxcount);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_size_accounts_for_header_bloom_and_buckets() {
        let maxcount = 17u64; // prime, small
        let bloom_bytes = bloom_filter_bytes(maxcount);
        assert_eq!(
            table_size(maxcount),
            TABLE_HEADER_SIZE + bloom_bytes + maxcount * 8
        );
    }

    #[test]
    fn new_table_image_has_zeroed_count_and_correct_maxcount_field() {
        let maxcount = 101u64;
        let image = new_table_image(maxcount);
        assert_eq!(image.len(), table_size(maxcount) as usize);
        assert_eq!(
            BigEndian::read_u64(&image[TABLE_COUNT_OFFSET as usize..]),
            0
        );
        assert_eq!(
            BigEndian::read_u64(&image[TABLE_MAX_COUNT_OFFSET as usize..]),
            maxcount
        );
    }
}
