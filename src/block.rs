//! Data block encode/decode: the on-disk record holding one key/value
//! pair plus chain/hash/size-class metadata.

use byteorder::{BigEndian, ByteOrder};

use crate::consts::*;

/// Rounds `value` up to a power of two, minimum 16.
pub fn block_size_round_up(value: u64) -> u64 {
    let value = value.max(16);
    let mut power = 1u64;
    while power < value {
        power <<= 1;
    }
    power
}

/// `ceil(log2(round_up(value)))`, i.e. the size class of a block whose
/// payload is `value` bytes. Matches the original `log2_round_up`,
/// which counts doublings starting from 1.
pub fn size_class(payload: u64) -> u8 {
    let value = payload.max(16);
    let mut power = 1u64;
    let mut log2 = 1u8;
    while power < value {
        power <<= 1;
        log2 += 1;
    }
    log2
}

pub fn class_capacity(class: u8) -> u64 {
    1u64 << class
}

/// Total file footprint of a block with the given size class,
/// including the fixed 29-byte header.
pub fn block_file_size(class: u8) -> u64 {
    BLOCK_FIXED_HEADER_SIZE + class_capacity(class)
}

/// Header fields decoded from the front of a block.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    pub next_offset: u64,
    pub hash: u32,
    pub class: u8,
    pub key_len: u64,
}

impl BlockHeader {
    /// Decodes the fixed header from `buf`, which must contain at
    /// least `BLOCK_KEY_BYTES_OFFSET` bytes.
    pub fn decode(buf: &[u8]) -> Self {
        BlockHeader {
            next_offset: BigEndian::read_u64(&buf[BLOCK_NEXT_OFFSET_OFFSET as usize..]),
            hash: BigEndian::read_u32(&buf[BLOCK_HASH_VALUE_OFFSET as usize..]),
            class: buf[BLOCK_LOG2SIZE_OFFSET as usize],
            key_len: BigEndian::read_u64(&buf[BLOCK_KEY_SIZE_OFFSET as usize..]),
        }
    }
}

/// Builds the full on-disk byte image of a block: fixed header, key,
/// value-length, value, zero-padded up to the block's full size-class
/// footprint so the space remains reusable at its class when recycled.
pub fn encode_block(next_offset: u64, hash: u32, key: &[u8], value: &[u8]) -> (u8, Vec<u8>) {
    let class = size_class((key.len() + value.len()) as u64);
    let total = block_file_size(class) as usize;
    let mut buf = vec![0u8; total];

    BigEndian::write_u64(&mut buf[BLOCK_NEXT_OFFSET_OFFSET as usize..], next_offset);
    BigEndian::write_u32(&mut buf[BLOCK_HASH_VALUE_OFFSET as usize..], hash);
    buf[BLOCK_LOG2SIZE_OFFSET as usize] = class;
    BigEndian::write_u64(
        &mut buf[BLOCK_KEY_SIZE_OFFSET as usize..],
        key.len() as u64,
    );
    let key_bytes_start = BLOCK_KEY_BYTES_OFFSET as usize;
    buf[key_bytes_start..key_bytes_start + key.len()].copy_from_slice(key);

    let value_len_offset = key_bytes_start + key.len();
    BigEndian::write_u64(&mut buf[value_len_offset..], value.len() as u64);
    let value_start = value_len_offset + 8;
    buf[value_start..value_start + value.len()].copy_from_slice(value);

    (class, buf)
}

/// Overwrites just the next-in-bucket link at the front of an encoded
/// block image (or an on-disk block's first 8 bytes), used both to
/// relink bucket chains and to encode a free-list "next free" pointer.
pub fn encode_next_offset(next_offset: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, next_offset);
    buf
}

pub fn decode_next_offset(buf: &[u8]) -> u64 {
    BigEndian::read_u64(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_respects_the_sixteen_byte_floor() {
        assert_eq!(size_class(0), 4); // 2^4 = 16
        assert_eq!(size_class(1), 4);
        assert_eq!(size_class(16), 4);
        assert_eq!(size_class(17), 5); // 2^5 = 32
        assert_eq!(size_class(32), 5);
        assert_eq!(size_class(33), 6);
    }

    #[test]
    fn block_file_size_includes_fixed_header() {
        assert_eq!(block_file_size(4), BLOCK_FIXED_HEADER_SIZE + 16);
    }

    #[test]
    fn encode_then_decode_header_round_trips() {
        let key = b"hoa";
        let value = b"test-value";
        let (class, image) = encode_block(12345, 0xDEADBEEF, key, value);
        let header = BlockHeader::decode(&image);
        assert_eq!(header.next_offset, 12345);
        assert_eq!(header.hash, 0xDEADBEEF);
        assert_eq!(header.class, class);
        assert_eq!(header.key_len, key.len() as u64);

        let key_start = BLOCK_KEY_BYTES_OFFSET as usize;
        assert_eq!(&image[key_start..key_start + key.len()], key);
        let value_len_offset = key_start + key.len();
        let value_len = BigEndian::read_u64(&image[value_len_offset..]);
        assert_eq!(value_len, value.len() as u64);
        let value_start = value_len_offset + 8;
        assert_eq!(&image[value_start..value_start + value.len()], value);
    }

    #[test]
    fn image_is_zero_padded_to_the_full_size_class() {
        let (class, image) = encode_block(0, 0, b"k", b"v");
        assert_eq!(image.len(), block_file_size(class) as usize);
        let used = BLOCK_KEY_BYTES_OFFSET as usize + 1 + 8 + 1;
        assert!(image[used..].iter().all(|&b| b == 0));
    }
}
