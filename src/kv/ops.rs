use byteorder::{BigEndian, ByteOrder};

use crate::block::{encode_block, BlockHeader};
use crate::codec::hash::murmur_hash2;
use crate::config::CompressionType;
use crate::consts::{BLOCK_KEY_BYTES_OFFSET, METAKEY_PREFIX};
use crate::error::{Error, Result};

use super::db::Kv;

impl Kv {
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.set_internal(key, value, true)
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.get_internal(key)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.delete_internal(key, true)
    }

    /// Lists every key currently stored. Meant for maintenance and test
    /// use rather than hot-path iteration; OKV keeps its own ordered
    /// index for that.
    pub fn enumerate_keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for table_idx in 0..self.table_count() {
            let maxcount = self.maxcount_of(table_idx);
            for bucket in 0..maxcount {
                let mut cur = self.bucket_head_live(table_idx, bucket);
                while cur != 0 {
                    let buf = self.read_block_bytes(cur)?;
                    let header = BlockHeader::decode(&buf);
                    let key_start = BLOCK_KEY_BYTES_OFFSET as usize;
                    keys.push(buf[key_start..key_start + header.key_len as usize].to_vec());
                    cur = header.next_offset;
                }
            }
        }
        Ok(keys)
    }

    /// Entry point used by the OKV layer to store its own bookkeeping
    /// keys, which carry the reserved metakey prefix a public caller is
    /// not allowed to use directly.
    pub(crate) fn set_internal(&mut self, key: &[u8], value: &[u8], enforce_reserved: bool) -> Result<()> {
        if enforce_reserved && key.starts_with(METAKEY_PREFIX) {
            return Err(Error::KeyNotAllowed);
        }
        self.ensure_transaction()?;
        let block_hash = murmur_hash2(key, 0);
        let stored_value = self.encode_value(value)?;

        if let Some((table_idx, pred, offset, bucket)) = self.find_key(key, block_hash)? {
            self.replace_block(table_idx, pred, offset, bucket, block_hash, key, &stored_value)?;
        } else {
            self.insert_block(block_hash, key, &stored_value)?;
        }
        self.bump_op_and_maybe_autocommit()
    }

    pub(crate) fn get_internal(&self, key: &[u8]) -> Result<Vec<u8>> {
        let block_hash = murmur_hash2(key, 0);
        match self.find_key(key, block_hash)? {
            Some((_, _, offset, _)) => {
                let buf = self.read_block_bytes(offset)?;
                self.decode_value(extract_value(&buf))
            }
            None => Err(Error::NotFound),
        }
    }

    pub(crate) fn delete_internal(&mut self, key: &[u8], enforce_reserved: bool) -> Result<()> {
        if enforce_reserved && key.starts_with(METAKEY_PREFIX) {
            return Err(Error::KeyNotAllowed);
        }
        self.ensure_transaction()?;
        let block_hash = murmur_hash2(key, 0);
        match self.find_key(key, block_hash)? {
            Some((table_idx, pred, offset, bucket)) => {
                let header = BlockHeader::decode(&self.read_block_bytes(offset)?);
                match pred {
                    Some(pred_offset) => self.write_block_next_offset(pred_offset, header.next_offset),
                    None => self.set_bucket_head(table_idx, bucket, header.next_offset),
                }
                self.recycle_block(header.class, offset);
                self.bump_table_count(table_idx, -1);
                self.bump_op_and_maybe_autocommit()
            }
            None => Err(Error::NotFound),
        }
    }

    fn find_key(&self, key: &[u8], block_hash: u32) -> Result<Option<(usize, Option<u64>, u64, u64)>> {
        for table_idx in 0..self.table_count() {
            if !self.might_contain_live(table_idx, key) {
                continue;
            }
            let bucket = self.bucket_of(table_idx, block_hash);
            let mut pred: Option<u64> = None;
            let mut cur = self.bucket_head_live(table_idx, bucket);
            while cur != 0 {
                let buf = self.read_block_bytes(cur)?;
                let header = BlockHeader::decode(&buf);
                if header.hash == block_hash && key_matches(&buf, &header, key) {
                    return Ok(Some((table_idx, pred, cur, bucket)));
                }
                pred = Some(cur);
                cur = header.next_offset;
            }
        }
        Ok(None)
    }

    fn insert_block(&mut self, block_hash: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let table_idx = self.select_table_for_insert()?;
        let bucket = self.bucket_of(table_idx, block_hash);
        let current_head = self.bucket_head_live(table_idx, bucket);
        let (class, image) = encode_block(current_head, block_hash, key, value);
        let offset = self.alloc_block(class, &image)?;
        self.set_bucket_head(table_idx, bucket, offset);
        self.bump_table_count(table_idx, 1);
        self.set_bloom_bits(table_idx, key);
        Ok(())
    }

    fn replace_block(
        &mut self,
        table_idx: usize,
        pred: Option<u64>,
        old_offset: u64,
        bucket: u64,
        block_hash: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let old_header = BlockHeader::decode(&self.read_block_bytes(old_offset)?);
        let (class, image) = encode_block(old_header.next_offset, block_hash, key, value);
        let new_offset = self.alloc_block(class, &image)?;
        match pred {
            Some(pred_offset) => self.write_block_next_offset(pred_offset, new_offset),
            None => self.set_bucket_head(table_idx, bucket, new_offset),
        }
        self.recycle_block(old_header.class, old_offset);
        Ok(())
    }

    fn encode_value(&self, value: &[u8]) -> Result<Vec<u8>> {
        match self.config().compression {
            CompressionType::Raw => Ok(value.to_vec()),
            CompressionType::Lz4 => {
                let compressed = lz4_flex::block::compress(value);
                let mut framed = Vec::with_capacity(4 + compressed.len());
                framed.extend_from_slice(&(value.len() as u32).to_be_bytes());
                framed.extend_from_slice(&compressed);
                Ok(framed)
            }
        }
    }

    fn decode_value(&self, stored: &[u8]) -> Result<Vec<u8>> {
        match self.config().compression {
            CompressionType::Raw => Ok(stored.to_vec()),
            CompressionType::Lz4 => {
                if stored.len() < 4 {
                    return Err(Error::corrupted("truncated compressed value header"));
                }
                let uncompressed_len =
                    u32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]]) as usize;
                lz4_flex::block::decompress(&stored[4..], uncompressed_len)
                    .map_err(|e| Error::corrupted(format!("lz4 decompress failed: {e}")))
            }
        }
    }
}

fn key_matches(buf: &[u8], header: &BlockHeader, key: &[u8]) -> bool {
    if header.key_len as usize != key.len() {
        return false;
    }
    let start = BLOCK_KEY_BYTES_OFFSET as usize;
    &buf[start..start + key.len()] == key
}

fn extract_value(buf: &[u8]) -> &[u8] {
    let header = BlockHeader::decode(buf);
    let key_start = BLOCK_KEY_BYTES_OFFSET as usize;
    let value_len_offset = key_start + header.key_len as usize;
    let value_len = BigEndian::read_u64(&buf[value_len_offset..]) as usize;
    let value_start = value_len_offset + 8;
    &buf[value_start..value_start + value_len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("kvdb_rs_ops_test_{}_{}_{}", tag, std::process::id(), unique()))
    }

    fn unique() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
    }

    fn small_config() -> Config {
        Config::default().with_first_table_max_count(17)
    }

    #[test]
    fn set_then_get_round_trips_and_commits() {
        let path = temp_path("roundtrip");
        let mut kv = Kv::create(&path, small_config()).unwrap();
        kv.set(b"alpha", b"1").unwrap();
        kv.set(b"beta", b"2").unwrap();
        kv.commit_transaction().unwrap();

        assert_eq!(kv.get(b"alpha").unwrap(), b"1");
        assert_eq!(kv.get(b"beta").unwrap(), b"2");
        assert!(matches!(kv.get(b"missing"), Err(Error::NotFound)));

        kv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn overwriting_a_key_replaces_its_value() {
        let path = temp_path("overwrite");
        let mut kv = Kv::create(&path, small_config()).unwrap();
        kv.set(b"k", b"first").unwrap();
        kv.set(b"k", b"second").unwrap();
        kv.commit_transaction().unwrap();
        assert_eq!(kv.get(b"k").unwrap(), b"second");
        kv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn delete_removes_a_key() {
        let path = temp_path("delete");
        let mut kv = Kv::create(&path, small_config()).unwrap();
        kv.set(b"k", b"v").unwrap();
        kv.commit_transaction().unwrap();
        kv.delete(b"k").unwrap();
        kv.commit_transaction().unwrap();
        assert!(matches!(kv.get(b"k"), Err(Error::NotFound)));
        kv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reserved_metakey_prefix_is_rejected() {
        let path = temp_path("reserved");
        let mut kv = Kv::create(&path, small_config()).unwrap();
        let reserved_key = [crate::consts::METAKEY_PREFIX, b"x"].concat();
        assert!(matches!(kv.set(&reserved_key, b"v"), Err(Error::KeyNotAllowed)));
        kv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn abort_discards_uncommitted_inserts() {
        let path = temp_path("abort");
        let mut kv = Kv::create(&path, small_config()).unwrap();
        kv.set(b"committed", b"yes").unwrap();
        kv.commit_transaction().unwrap();

        kv.set(b"uncommitted", b"no").unwrap();
        kv.abort_transaction().unwrap();

        assert_eq!(kv.get(b"committed").unwrap(), b"yes");
        assert!(matches!(kv.get(b"uncommitted"), Err(Error::NotFound)));
        kv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn survives_reopen_after_commit() {
        let path = temp_path("reopen");
        {
            let mut kv = Kv::create(&path, small_config()).unwrap();
            kv.set(b"durable", b"value").unwrap();
            kv.commit_transaction().unwrap();
            kv.close().unwrap();
        }
        let kv = Kv::open(&path, small_config()).unwrap();
        assert_eq!(kv.get(b"durable").unwrap(), b"value");
        kv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn lz4_compression_round_trips_transparently() {
        let path = temp_path("lz4");
        let cfg = small_config().with_compression(CompressionType::Lz4);
        let mut kv = Kv::create(&path, cfg).unwrap();
        let value = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        kv.set(b"big", &value).unwrap();
        kv.commit_transaction().unwrap();
        assert_eq!(kv.get(b"big").unwrap(), value);
        kv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
