use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::codec::varint;
use crate::config::Config;
use crate::consts::{
    KEYS_PER_NODE_MERGE_THRESHOLD, MASTER_NODE_KEY, MAX_CHANGES_COUNT, MAX_KEYS_PER_NODE,
    MEAN_KEYS_PER_NODE, METAKEY_PREFIX, NODE_KEY_PREFIX,
};
use crate::error::{Error, Result};
use crate::kv::Kv;

use super::iter::OkvIterator;

fn master_key() -> Vec<u8> {
    let mut k = METAKEY_PREFIX.to_vec();
    k.extend_from_slice(MASTER_NODE_KEY);
    k
}

fn node_key(node_id: u64) -> Vec<u8> {
    let mut k = METAKEY_PREFIX.to_vec();
    k.extend_from_slice(NODE_KEY_PREFIX);
    varint::encode_u64(&mut k, node_id);
    k
}

/// Master node layout is struct-of-arrays, not one record per node:
/// `varint N`, then N node-id varints, then N key-count varints, then N
/// length-prefixed first keys. Keeping each field in its own contiguous
/// run (rather than interleaving per-node tuples) is what the original
/// encoder does.
fn encode_master(node_ids: &[u64], first_keys: &[Vec<u8>], keys_counts: &[u64]) -> Vec<u8> {
    let mut buf = Vec::new();
    varint::encode_u64(&mut buf, node_ids.len() as u64);
    for &id in node_ids {
        varint::encode_u64(&mut buf, id);
    }
    for &count in keys_counts {
        varint::encode_u64(&mut buf, count);
    }
    for key in first_keys {
        varint::encode_u64(&mut buf, key.len() as u64);
        buf.extend_from_slice(key);
    }
    buf
}

fn decode_master(raw: &[u8]) -> Result<(Vec<u64>, Vec<Vec<u8>>, Vec<u64>)> {
    let mut pos = 0;
    let (count, consumed) = varint::decode_u64(raw, pos)?;
    pos += consumed;
    let count = count as usize;

    let mut node_ids = Vec::with_capacity(count);
    for _ in 0..count {
        let (id, c) = varint::decode_u64(raw, pos)?;
        pos += c;
        node_ids.push(id);
    }

    let mut keys_counts = Vec::with_capacity(count);
    for _ in 0..count {
        let (kc, c) = varint::decode_u64(raw, pos)?;
        pos += c;
        keys_counts.push(kc);
    }

    let mut first_keys = Vec::with_capacity(count);
    for _ in 0..count {
        let (klen, c) = varint::decode_u64(raw, pos)?;
        pos += c;
        let key = raw
            .get(pos..pos + klen as usize)
            .ok_or_else(|| Error::corrupted("truncated master node key"))?
            .to_vec();
        pos += klen as usize;
        first_keys.push(key);
    }

    Ok((node_ids, first_keys, keys_counts))
}

/// A node's payload is an 8-byte big-endian `changes_count` header
/// followed by that many `<1-byte op><varint key length><key bytes>`
/// entries, replayed in order into a materialized key set (last
/// decision per key wins). `1` is insert, `0` is delete.
fn decode_node_payload(raw: &[u8]) -> Result<(u64, &[u8])> {
    if raw.is_empty() {
        return Ok((0, &[]));
    }
    if raw.len() < 8 {
        return Err(Error::corrupted("truncated node changes_count header"));
    }
    let changes_count = BigEndian::read_u64(&raw[0..8]);
    Ok((changes_count, &raw[8..]))
}

fn encode_node_payload(changes_count: u64, entries: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + entries.len());
    let mut header = [0u8; 8];
    BigEndian::write_u64(&mut header, changes_count);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(entries);
    buf
}

fn decode_node_entries(raw: &[u8]) -> Result<BTreeSet<Vec<u8>>> {
    let mut pos = 0;
    let mut set = BTreeSet::new();
    while pos < raw.len() {
        let op = raw[pos];
        pos += 1;
        let (klen, consumed) = varint::decode_u64(raw, pos)?;
        pos += consumed;
        let key = raw
            .get(pos..pos + klen as usize)
            .ok_or_else(|| Error::corrupted("truncated node change log"))?
            .to_vec();
        pos += klen as usize;
        match op {
            1 => {
                set.insert(key);
            }
            0 => {
                set.remove(&key);
            }
            other => return Err(Error::corrupted(format!("unknown node log op {other}"))),
        }
    }
    Ok(set)
}

fn append_node_entry(out: &mut Vec<u8>, insert: bool, key: &[u8]) {
    out.push(if insert { 1 } else { 0 });
    varint::encode_u64(out, key.len() as u64);
    out.extend_from_slice(key);
}

fn encode_compacted_log<'a>(keys: impl Iterator<Item = &'a Vec<u8>>) -> Vec<u8> {
    let mut buf = Vec::new();
    for key in keys {
        append_node_entry(&mut buf, true, key);
    }
    buf
}

struct TxnSnapshot {
    node_ids: Vec<u64>,
    first_keys: Vec<Vec<u8>>,
    keys_counts: Vec<u64>,
    next_node_id: u64,
}

/// An ordered index of keys layered over a `Kv` handle. Its own
/// bookkeeping (the master directory and each node's change log) is
/// stored as ordinary reserved-prefix entries in the same file, so it
/// shares the underlying journal and transaction lifecycle rather than
/// keeping one of its own.
pub struct Okv {
    kv: Kv,
    node_ids: Vec<u64>,
    first_keys: Vec<Vec<u8>>,
    keys_counts: Vec<u64>,
    next_node_id: u64,
    pending_inserts: BTreeSet<Vec<u8>>,
    pending_deletes: BTreeSet<Vec<u8>>,
    master_dirty: bool,
    txn_snapshot: Option<TxnSnapshot>,
}

impl Okv {
    /// Creates a brand new index over a brand new `Kv` file at `path`,
    /// with a single root node spanning the whole key range.
    pub fn create<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let mut kv = Kv::create(path, config)?;
        let node_ids = vec![1u64];
        let first_keys = vec![Vec::new()];
        let keys_counts = vec![0u64];
        kv.begin_transaction()?;
        kv.set_internal(&master_key(), &encode_master(&node_ids, &first_keys, &keys_counts), false)?;
        kv.commit_transaction()?;
        Ok(Okv {
            kv,
            node_ids,
            first_keys,
            keys_counts,
            next_node_id: 2,
            pending_inserts: BTreeSet::new(),
            pending_deletes: BTreeSet::new(),
            master_dirty: false,
            txn_snapshot: None,
        })
    }

    /// Opens an existing index, reading its master directory back from
    /// the underlying `Kv`.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let kv = Kv::open(path, config)?;
        let raw = kv.get_internal(&master_key())?;
        let (node_ids, first_keys, keys_counts) = decode_master(&raw)?;
        let next_node_id = node_ids.iter().copied().max().unwrap_or(0) + 1;
        Ok(Okv {
            kv,
            node_ids,
            first_keys,
            keys_counts,
            next_node_id,
            pending_inserts: BTreeSet::new(),
            pending_deletes: BTreeSet::new(),
            master_dirty: false,
            txn_snapshot: None,
        })
    }

    pub fn close(mut self) -> Result<()> {
        if self.in_transaction() {
            self.commit_transaction()?;
        }
        self.kv.close()
    }

    pub fn config(&self) -> &Config {
        self.kv.config()
    }

    pub fn in_transaction(&self) -> bool {
        self.kv.in_transaction()
    }

    // -- transactions ----------------------------------------------------

    fn ensure_transaction(&mut self) -> Result<()> {
        if self.txn_snapshot.is_none() {
            self.kv.begin_transaction()?;
            self.txn_snapshot = Some(TxnSnapshot {
                node_ids: self.node_ids.clone(),
                first_keys: self.first_keys.clone(),
                keys_counts: self.keys_counts.clone(),
                next_node_id: self.next_node_id,
            });
        }
        Ok(())
    }

    pub fn begin_transaction(&mut self) -> Result<()> {
        self.ensure_transaction()
    }

    pub fn commit_transaction(&mut self) -> Result<()> {
        self.flush_pending()?;
        if self.master_dirty {
            let master = encode_master(&self.node_ids, &self.first_keys, &self.keys_counts);
            self.kv.set_internal(&master_key(), &master, false)?;
            self.master_dirty = false;
        }
        self.kv.commit_transaction()?;
        self.txn_snapshot = None;
        Ok(())
    }

    pub fn abort_transaction(&mut self) -> Result<()> {
        self.pending_inserts.clear();
        self.pending_deletes.clear();
        if let Some(snap) = self.txn_snapshot.take() {
            self.node_ids = snap.node_ids;
            self.first_keys = snap.first_keys;
            self.keys_counts = snap.keys_counts;
            self.next_node_id = snap.next_node_id;
        }
        self.master_dirty = false;
        self.kv.abort_transaction()
    }

    // -- mutation ----------------------------------------------------------

    pub fn insert(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_transaction()?;
        self.pending_deletes.remove(key);
        self.pending_inserts.insert(key.to_vec());
        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_transaction()?;
        self.pending_inserts.remove(key);
        self.pending_deletes.insert(key.to_vec());
        Ok(())
    }

    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        self.flush_pending()?;
        let idx = self.find_node_index(key);
        let set = self.materialize_node(idx)?;
        Ok(set.contains(key))
    }

    pub fn set_fsync_enabled(&mut self, enabled: bool) {
        self.kv.set_fsync_enabled(enabled);
    }

    pub fn is_fsync_enabled(&self) -> bool {
        self.kv.is_fsync_enabled()
    }

    pub fn iter(&mut self) -> Result<OkvIterator<'_>> {
        self.flush_pending()?;
        Ok(OkvIterator::new(self))
    }

    pub(super) fn node_count(&self) -> usize {
        self.node_ids.len()
    }

    pub(super) fn find_node_index(&self, key: &[u8]) -> usize {
        self.first_keys.partition_point(|k| k.as_slice() <= key).saturating_sub(1)
    }

    pub(super) fn materialize_node_sorted(&self, idx: usize) -> Result<Vec<Vec<u8>>> {
        let set = self.materialize_node(idx)?;
        Ok(set.into_iter().collect())
    }

    fn read_node_raw(&self, node_id: u64) -> Result<Vec<u8>> {
        match self.kv.get_internal(&node_key(node_id)) {
            Ok(v) => Ok(v),
            Err(Error::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn materialize_node(&self, idx: usize) -> Result<BTreeSet<Vec<u8>>> {
        let raw = self.read_node_raw(self.node_ids[idx])?;
        let (_, entries) = decode_node_payload(&raw)?;
        decode_node_entries(entries)
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.pending_inserts.is_empty() && self.pending_deletes.is_empty() {
            return Ok(());
        }
        let mut by_node: BTreeMap<usize, Vec<(bool, Vec<u8>)>> = BTreeMap::new();
        for key in std::mem::take(&mut self.pending_inserts) {
            let idx = self.find_node_index(&key);
            by_node.entry(idx).or_default().push((true, key));
        }
        for key in std::mem::take(&mut self.pending_deletes) {
            let idx = self.find_node_index(&key);
            by_node.entry(idx).or_default().push((false, key));
        }
        // Highest index first: splitting or merging a lower node shifts
        // the indices of everything above it.
        for (idx, ops) in by_node.into_iter().rev() {
            self.apply_node_ops(idx, ops)?;
        }
        Ok(())
    }

    /// Appends `ops` to node `idx`'s in-memory change log and decides how
    /// to persist it. Below `MAX_CHANGES_COUNT` the log is just written
    /// as-is; at or above it the node is materialized and, depending on
    /// its resulting key count, removed, split, compacted-and-merged, or
    /// just compacted.
    fn apply_node_ops(&mut self, idx: usize, ops: Vec<(bool, Vec<u8>)>) -> Result<()> {
        let node_id = self.node_ids[idx];
        let key = node_key(node_id);
        let existing = self.read_node_raw(node_id)?;
        let (changes_count, entries) = decode_node_payload(&existing)?;
        let mut new_entries = entries.to_vec();
        for (insert, k) in &ops {
            append_node_entry(&mut new_entries, *insert, k);
        }
        let new_changes_count = changes_count + ops.len() as u64;

        if new_changes_count < MAX_CHANGES_COUNT {
            let raw = encode_node_payload(new_changes_count, &new_entries);
            self.kv.set_internal(&key, &raw, false)?;
            return Ok(());
        }

        let set = decode_node_entries(&new_entries)?;
        let keys_count = set.len() as u64;

        if keys_count == 0 {
            match self.kv.delete_internal(&key, false) {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
            debug!("node {node_id} emptied out, removing it from the master");
            self.node_ids.remove(idx);
            self.first_keys.remove(idx);
            self.keys_counts.remove(idx);
            self.master_dirty = true;
        } else if keys_count > MAX_KEYS_PER_NODE {
            self.split_node(idx, set)?;
        } else if keys_count < KEYS_PER_NODE_MERGE_THRESHOLD {
            self.write_compacted(idx, &set)?;
            self.keys_counts[idx] = keys_count;
            self.master_dirty = true;
            let mut cur = idx;
            if cur > 0 && self.try_merge(cur - 1)? {
                cur -= 1;
            }
            self.try_merge(cur)?;
        } else {
            self.write_compacted(idx, &set)?;
            self.keys_counts[idx] = keys_count;
            self.master_dirty = true;
        }
        Ok(())
    }

    fn write_compacted(&mut self, idx: usize, set: &BTreeSet<Vec<u8>>) -> Result<()> {
        let log = encode_compacted_log(set.iter());
        let raw = encode_node_payload(set.len() as u64, &log);
        self.kv.set_internal(&node_key(self.node_ids[idx]), &raw, false)
    }

    /// Splits an over-full node into `ceil(keys / MEAN_KEYS_PER_NODE)`
    /// new nodes, each holding up to `MEAN_KEYS_PER_NODE` keys, then
    /// attempts to merge the last of them with its successor.
    fn split_node(&mut self, idx: usize, set: BTreeSet<Vec<u8>>) -> Result<()> {
        let keys: Vec<Vec<u8>> = set.into_iter().collect();
        let chunk_size = MEAN_KEYS_PER_NODE as usize;
        let original_first_key = self.first_keys[idx].clone();
        let original_node_id = self.node_ids[idx];

        let mut new_ids = Vec::new();
        let mut new_first_keys = Vec::new();
        let mut new_counts = Vec::new();
        for (i, chunk) in keys.chunks(chunk_size).enumerate() {
            let node_id = if i == 0 {
                original_node_id
            } else {
                let id = self.next_node_id;
                self.next_node_id += 1;
                id
            };
            let log = encode_compacted_log(chunk.iter());
            let raw = encode_node_payload(chunk.len() as u64, &log);
            self.kv.set_internal(&node_key(node_id), &raw, false)?;
            new_first_keys.push(if i == 0 { original_first_key.clone() } else { chunk[0].clone() });
            new_counts.push(chunk.len() as u64);
            new_ids.push(node_id);
        }

        debug!("split node {} ({} keys) into {} nodes", original_node_id, keys.len(), new_ids.len());

        let new_node_count = new_ids.len();
        self.node_ids.splice(idx..idx + 1, new_ids);
        self.first_keys.splice(idx..idx + 1, new_first_keys);
        self.keys_counts.splice(idx..idx + 1, new_counts);
        self.master_dirty = true;

        let last_idx = idx + new_node_count - 1;
        self.try_merge(last_idx)?;
        Ok(())
    }

    /// If node `idx` and its successor together hold at most
    /// `MEAN_KEYS_PER_NODE` keys, materializes both, writes their union
    /// into node `idx`'s id, and removes node `idx + 1`. Returns whether
    /// a merge happened, since that shifts every index above `idx`.
    fn try_merge(&mut self, idx: usize) -> Result<bool> {
        if idx + 1 >= self.node_ids.len() {
            return Ok(false);
        }
        let combined = self.keys_counts[idx] + self.keys_counts[idx + 1];
        if combined > MEAN_KEYS_PER_NODE {
            return Ok(false);
        }
        let left = self.materialize_node(idx)?;
        let right = self.materialize_node(idx + 1)?;
        let mut merged = left;
        merged.extend(right);

        let log = encode_compacted_log(merged.iter());
        let raw = encode_node_payload(merged.len() as u64, &log);
        self.kv.set_internal(&node_key(self.node_ids[idx]), &raw, false)?;
        match self.kv.delete_internal(&node_key(self.node_ids[idx + 1]), false) {
            Ok(()) | Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        debug!("merged node {} into {} ({} keys)", self.node_ids[idx + 1], self.node_ids[idx], merged.len());

        self.keys_counts[idx] = merged.len() as u64;
        self.node_ids.remove(idx + 1);
        self.first_keys.remove(idx + 1);
        self.keys_counts.remove(idx + 1);
        self.master_dirty = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("kvdb_rs_okv_test_{}_{}_{}", tag, std::process::id(), unique()))
    }

    fn unique() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
    }

    fn small_config() -> Config {
        Config::default().with_first_table_max_count(17)
    }

    #[test]
    fn insert_then_contains_and_commit_round_trips() {
        let path = temp_path("roundtrip");
        let mut okv = Okv::create(&path, small_config()).unwrap();
        okv.insert(b"banana").unwrap();
        okv.insert(b"apple").unwrap();
        okv.insert(b"cherry").unwrap();
        okv.commit_transaction().unwrap();

        assert!(okv.contains(b"apple").unwrap());
        assert!(okv.contains(b"banana").unwrap());
        assert!(!okv.contains(b"durian").unwrap());
        okv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn remove_takes_effect_after_commit() {
        let path = temp_path("remove");
        let mut okv = Okv::create(&path, small_config()).unwrap();
        okv.insert(b"k1").unwrap();
        okv.commit_transaction().unwrap();

        okv.remove(b"k1").unwrap();
        okv.commit_transaction().unwrap();
        assert!(!okv.contains(b"k1").unwrap());
        okv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn abort_discards_uncommitted_inserts() {
        let path = temp_path("abort");
        let mut okv = Okv::create(&path, small_config()).unwrap();
        okv.insert(b"kept").unwrap();
        okv.commit_transaction().unwrap();

        okv.insert(b"dropped").unwrap();
        okv.abort_transaction().unwrap();

        assert!(okv.contains(b"kept").unwrap());
        assert!(!okv.contains(b"dropped").unwrap());
        okv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn survives_reopen_after_commit() {
        let path = temp_path("reopen");
        {
            let mut okv = Okv::create(&path, small_config()).unwrap();
            okv.insert(b"durable").unwrap();
            okv.commit_transaction().unwrap();
            okv.close().unwrap();
        }
        let mut okv = Okv::open(&path, small_config()).unwrap();
        assert!(okv.contains(b"durable").unwrap());
        okv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn large_bulk_insert_triggers_a_node_split() {
        let path = temp_path("split");
        let mut okv = Okv::create(&path, small_config()).unwrap();
        for i in 0..(MAX_KEYS_PER_NODE + 10) {
            okv.insert(format!("key-{i:08}").as_bytes()).unwrap();
        }
        okv.commit_transaction().unwrap();
        assert!(okv.node_count() > 1);
        assert!(okv.contains(b"key-00000000").unwrap());
        assert!(okv.contains(format!("key-{:08}", MAX_KEYS_PER_NODE + 9).as_bytes()).unwrap());
        okv.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
