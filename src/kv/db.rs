use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::block::encode_next_offset;
use crate::config::Config;
use crate::consts::*;
use crate::error::{Error, Result};
use crate::journal;
use crate::primes::next_prime;
use crate::table::{self, Table};
use crate::txn::Transaction;

/// Bookkeeping for a transaction's not-yet-durable table chain growth
/// and per-table field changes. Kept separate from `Transaction`, which
/// knows nothing about tables, buckets or Bloom filters.
pub(super) struct TxnState {
    pub table_counts_snapshot: Vec<u64>,
    pub free_list_snapshot: [u64; FREELIST_CLASS_COUNT],
    pub durable_table_count: usize,
    /// `(table_idx, bucket)` -> new bucket head offset.
    pub bucket_head_overrides: HashMap<(usize, u64), u64>,
    /// `(table_idx, bit_index)` set bits not yet flushed to disk.
    pub bloom_bit_overrides: HashMap<(usize, u64), bool>,
    /// Tables appended this transaction: `(file offset, maxcount)`.
    pub new_tables: Vec<(u64, u64)>,
}

pub struct Kv {
    pub(super) file: File,
    pub(super) journal_path: PathBuf,
    pub(super) config: Config,
    /// Maxcount of every table in the chain, durable ones and (mid
    /// transaction) pending ones, in chain order.
    pub(super) table_maxcounts: Vec<u64>,
    /// Live item count of every table, mirroring `table_maxcounts`.
    pub(super) table_counts: Vec<u64>,
    /// Only durable (already committed) tables get a mapped `Table`.
    pub(super) tables: Vec<Table>,
    pub(super) free_list_heads: [u64; FREELIST_CLASS_COUNT],
    pub(super) filesize: u64,
    pub(super) txn: Option<Transaction>,
    pub(super) txn_state: Option<TxnState>,
}

fn header_bytes(firstmaxcount: u64, compression: u8, filesize: u64) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE as usize];
    buf[0..4].copy_from_slice(HEADER_MARKER);
    BigEndian::write_u32(&mut buf[HEADER_VERSION_OFFSET as usize..], HEADER_VERSION_INCOMPLETE);
    BigEndian::write_u64(&mut buf[HEADER_FIRSTMAXCOUNT_OFFSET as usize..], firstmaxcount);
    buf[HEADER_COMPRESSION_OFFSET as usize] = compression;
    BigEndian::write_u64(&mut buf[HEADER_FILESIZE_OFFSET as usize..], filesize);
    buf
}

impl Kv {
    /// Creates a brand new database file at `path`. Fails if one
    /// already exists.
    pub fn create<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let firstmaxcount = config.first_table_max_count;
        let table_image = table::new_table_image(firstmaxcount);
        let filesize = HEADER_SIZE + table_image.len() as u64;

        let mut image = header_bytes(firstmaxcount, config.compression.id(), filesize);
        image.extend_from_slice(&table_image);
        file.write_all_at(&image, 0)?;
        if config.fsync_enabled {
            file.sync_all()?;
        }

        // The version field is only set once the rest of the header and
        // the first table are durably on disk; a file stuck at version 0
        // is one whose create() crashed before reaching this point.
        let mut version_bytes = [0u8; 4];
        BigEndian::write_u32(&mut version_bytes, HEADER_VERSION);
        file.write_all_at(&version_bytes, HEADER_VERSION_OFFSET)?;
        if config.fsync_enabled {
            file.sync_all()?;
        }

        debug!("created database at {:?} with firstmaxcount {}", path, firstmaxcount);

        Self::open_file(file, path, config)
    }

    /// Opens an existing database file, running journal recovery first.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::open_file(file, path, config)
    }

    fn open_file(file: File, path: &Path, config: Config) -> Result<Self> {
        let journal_path = journal_path_for(path);
        if journal::recover(&file, &journal_path, config.fsync_enabled)? {
            debug!("replayed a pending journal for {:?}", path);
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)?;
        if &header[0..4] != HEADER_MARKER {
            return Err(Error::corrupted("bad file marker"));
        }
        let version = BigEndian::read_u32(&header[HEADER_VERSION_OFFSET as usize..]);
        if version == HEADER_VERSION_INCOMPLETE {
            return Err(Error::corrupted("create() never completed"));
        }
        if version != HEADER_VERSION {
            return Err(Error::corrupted(format!("unsupported version {version}")));
        }
        let firstmaxcount = BigEndian::read_u64(&header[HEADER_FIRSTMAXCOUNT_OFFSET as usize..]);
        let compression = header[HEADER_COMPRESSION_OFFSET as usize];
        let filesize = BigEndian::read_u64(&header[HEADER_FILESIZE_OFFSET as usize..]);
        let mut free_list_heads = [0u64; FREELIST_CLASS_COUNT];
        for (i, slot) in free_list_heads.iter_mut().enumerate() {
            let off = HEADER_FREELIST_OFFSET as usize + i * 8;
            *slot = BigEndian::read_u64(&header[off..]);
        }

        // Any bytes past the durable filesize belong to a transaction
        // that appended blocks but never reached a journaled commit.
        file.set_len(filesize)?;

        let mut config = config;
        match crate::config::CompressionType::from_id(compression) {
            Ok(c) => config.compression = c,
            Err(_) => warn!("unrecognized compression id {compression} in header, falling back to configured default"),
        }

        let mut tables = Vec::new();
        let mut table_maxcounts = Vec::new();
        let mut table_counts = Vec::new();
        let mut offset = HEADER_SIZE;
        let mut maxcount = firstmaxcount;
        loop {
            let (next_table_offset, count, header_maxcount) = table::read_table_header(&file, offset)?;
            let maxcount_to_use = if header_maxcount != 0 { header_maxcount } else { maxcount };
            let t = Table::open(&file, offset, maxcount_to_use)?;
            table_maxcounts.push(maxcount_to_use);
            table_counts.push(count);
            tables.push(t);
            if next_table_offset == 0 {
                break;
            }
            offset = next_table_offset;
            maxcount = next_prime(maxcount_to_use * 2);
        }

        Ok(Kv {
            file,
            journal_path,
            config,
            table_maxcounts,
            table_counts,
            tables,
            free_list_heads,
            filesize,
            txn: None,
            txn_state: None,
        })
    }

    pub fn close(self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::corrupted("cannot close a database with an open transaction"));
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -- transaction management -------------------------------------

    pub fn begin_transaction(&mut self) -> Result<()> {
        self.begin_transaction_inner(false)
    }

    pub(super) fn ensure_transaction(&mut self) -> Result<()> {
        if self.txn.is_none() {
            self.begin_transaction_inner(true)?;
        }
        Ok(())
    }

    fn begin_transaction_inner(&mut self, implicit: bool) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::corrupted("a transaction is already open"));
        }
        self.txn = Some(Transaction::begin(self.filesize, self.config.write_buffer_size, implicit));
        self.txn_state = Some(TxnState {
            table_counts_snapshot: self.table_counts.clone(),
            free_list_snapshot: self.free_list_heads,
            durable_table_count: self.tables.len(),
            bucket_head_overrides: HashMap::new(),
            bloom_bit_overrides: HashMap::new(),
            new_tables: Vec::new(),
        });
        Ok(())
    }

    pub(super) fn bump_op_and_maybe_autocommit(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.as_mut() {
            txn.bump_op_count();
            if txn.should_auto_commit(self.config.implicit_transaction_max_op) {
                self.commit_transaction()?;
            }
        }
        Ok(())
    }

    pub fn commit_transaction(&mut self) -> Result<()> {
        let mut txn = self.txn.take().ok_or_else(|| Error::corrupted("no open transaction"))?;
        let mut state = self.txn_state.take().ok_or_else(|| Error::corrupted("no open transaction"))?;

        // Per-table item counts that changed this transaction.
        for (idx, &count) in self.table_counts.iter().enumerate() {
            let changed = state
                .table_counts_snapshot
                .get(idx)
                .map(|&c| c != count)
                .unwrap_or(true);
            if changed {
                let offset = self.table_field_offset(idx, &state, TABLE_COUNT_OFFSET);
                let mut bytes = [0u8; 8];
                BigEndian::write_u64(&mut bytes, count);
                txn.queue_write(offset, bytes.to_vec());
            }
        }

        // Bucket head relinks.
        for (&(table_idx, bucket), &head) in state.bucket_head_overrides.iter() {
            let offset = self.bucket_head_file_offset(table_idx, bucket, &state);
            txn.queue_write(offset, encode_next_offset(head).to_vec());
        }

        // Bloom filter bit sets, grouped by byte so each byte is written once.
        let mut byte_updates: HashMap<u64, u8> = HashMap::new();
        for (&(table_idx, bit_index), _) in state.bloom_bit_overrides.iter() {
            let byte_offset = self.bloom_byte_file_offset(table_idx, bit_index, &state);
            let existing = byte_updates
                .get(&byte_offset)
                .copied()
                .unwrap_or_else(|| self.bloom_byte_on_disk(table_idx, bit_index, &state));
            byte_updates.insert(byte_offset, existing | (1 << (bit_index % 8)));
        }
        for (offset, byte) in byte_updates {
            txn.queue_write(offset, vec![byte]);
        }

        // Free list: chain this transaction's recycled blocks onto the
        // current heads, then record which class heads actually moved.
        let mut heads = self.free_list_heads;
        for (&class, offsets) in txn.recycled_this_txn.clone().iter() {
            for &offset in offsets {
                let next = heads[class as usize];
                txn.queue_write(offset, encode_next_offset(next).to_vec());
                heads[class as usize] = offset;
            }
        }
        for class in 0..FREELIST_CLASS_COUNT {
            if heads[class] != state.free_list_snapshot[class] {
                let field_offset = HEADER_FREELIST_OFFSET + (class as u64) * 8;
                txn.queue_write(field_offset, encode_next_offset(heads[class]).to_vec());
            }
        }

        let new_filesize = txn.filesize;
        let mut filesize_bytes = [0u8; 8];
        BigEndian::write_u64(&mut filesize_bytes, new_filesize);
        txn.queue_write(HEADER_FILESIZE_OFFSET, filesize_bytes.to_vec());

        match txn.commit(&self.file, &self.journal_path, self.config.fsync_enabled) {
            Ok(()) => {
                self.filesize = new_filesize;
                self.free_list_heads = heads;
                for (offset, maxcount) in state.new_tables.drain(..) {
                    self.tables.push(Table::open(&self.file, offset, maxcount)?);
                }
                Ok(())
            }
            Err(e) => {
                // Nothing reached disk: unwind the in-memory view back
                // to where it stood before this transaction began.
                self.table_counts = state.table_counts_snapshot;
                self.table_maxcounts.truncate(state.durable_table_count);
                self.free_list_heads = state.free_list_snapshot;
                Err(e)
            }
        }
    }

    pub fn abort_transaction(&mut self) -> Result<()> {
        let txn = self.txn.take().ok_or_else(|| Error::corrupted("no open transaction"))?;
        let state = self.txn_state.take().ok_or_else(|| Error::corrupted("no open transaction"))?;
        self.table_counts = state.table_counts_snapshot;
        self.table_maxcounts.truncate(state.durable_table_count);
        self.free_list_heads = state.free_list_snapshot;
        txn.abort(&self.file, self.config.fsync_enabled)?;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    pub fn set_fsync_enabled(&mut self, enabled: bool) {
        self.config.fsync_enabled = enabled;
    }

    pub fn is_fsync_enabled(&self) -> bool {
        self.config.fsync_enabled
    }

    // -- table chain bookkeeping --------------------------------------

    pub(super) fn table_count(&self) -> usize {
        self.table_maxcounts.len()
    }

    pub(super) fn maxcount_of(&self, table_idx: usize) -> u64 {
        self.table_maxcounts[table_idx]
    }

    pub(super) fn bucket_of(&self, table_idx: usize, hash: u32) -> u64 {
        (hash as u64) % self.maxcount_of(table_idx)
    }

    fn table_field_offset(&self, table_idx: usize, state: &TxnState, field: u64) -> u64 {
        if let Some(t) = self.tables.get(table_idx) {
            t.offset + field
        } else {
            let (offset, _) = state.new_tables[table_idx - state.durable_table_count];
            offset + field
        }
    }

    fn bucket_array_offset(&self, table_idx: usize, state: &TxnState) -> u64 {
        if let Some(t) = self.tables.get(table_idx) {
            t.offset + TABLE_HEADER_SIZE + table::bloom_filter_bytes(t.maxcount)
        } else {
            let (offset, maxcount) = state.new_tables[table_idx - state.durable_table_count];
            offset + TABLE_HEADER_SIZE + table::bloom_filter_bytes(maxcount)
        }
    }

    fn bucket_head_file_offset(&self, table_idx: usize, bucket: u64, state: &TxnState) -> u64 {
        self.bucket_array_offset(table_idx, state) + bucket * 8
    }

    fn bloom_byte_file_offset(&self, table_idx: usize, bit_index: u64, state: &TxnState) -> u64 {
        self.table_field_offset(table_idx, state, TABLE_BLOOM_FILTER_OFFSET) + bit_index / 8
    }

    fn bloom_byte_on_disk(&self, table_idx: usize, bit_index: u64, _state: &TxnState) -> u8 {
        self.tables
            .get(table_idx)
            .map(|t| t.bloom_byte(bit_index))
            .unwrap_or(0)
    }

    pub(super) fn bucket_head_live(&self, table_idx: usize, bucket: u64) -> u64 {
        if let Some(state) = &self.txn_state {
            if let Some(&v) = state.bucket_head_overrides.get(&(table_idx, bucket)) {
                return v;
            }
        }
        self.tables.get(table_idx).map_or(0, |t| t.bucket_head(bucket))
    }

    pub(super) fn set_bucket_head(&mut self, table_idx: usize, bucket: u64, offset: u64) {
        if let Some(state) = self.txn_state.as_mut() {
            state.bucket_head_overrides.insert((table_idx, bucket), offset);
        }
    }

    pub(super) fn bloom_bits_of(&self, table_idx: usize) -> u64 {
        if let Some(t) = self.tables.get(table_idx) {
            t.bloom_bits
        } else {
            let maxcount = self.table_maxcounts[table_idx];
            table::bloom_filter_bits(maxcount)
        }
    }

    pub(super) fn might_contain_live(&self, table_idx: usize, key: &[u8]) -> bool {
        let probes = Table::bloom_probes(key);
        let bloom_bits = self.bloom_bits_of(table_idx);
        for h in probes {
            let idx = (h as u64) % bloom_bits;
            let on_disk = self
                .tables
                .get(table_idx)
                .map_or(false, |t| t.bloom_byte(idx) & (1 << (idx % 8)) != 0);
            let live = self
                .txn_state
                .as_ref()
                .map_or(false, |s| s.bloom_bit_overrides.contains_key(&(table_idx, idx)));
            if !(on_disk || live) {
                return false;
            }
        }
        true
    }

    pub(super) fn set_bloom_bits(&mut self, table_idx: usize, key: &[u8]) {
        let bloom_bits = self.bloom_bits_of(table_idx);
        let probes = Table::bloom_probes(key);
        if let Some(state) = self.txn_state.as_mut() {
            for h in probes {
                let idx = (h as u64) % bloom_bits;
                state.bloom_bit_overrides.insert((table_idx, idx), true);
            }
        }
    }

    pub(super) fn bump_table_count(&mut self, table_idx: usize, delta: i64) {
        let count = &mut self.table_counts[table_idx];
        *count = (*count as i64 + delta).max(0) as u64;
    }

    /// Picks the table new keys should be inserted into, growing the
    /// chain first if the current last table is over its mean collision
    /// budget.
    pub(super) fn select_table_for_insert(&mut self) -> Result<usize> {
        let last = self.table_count() - 1;
        let maxcount = self.maxcount_of(last);
        if self.table_counts[last] > maxcount * MAX_MEAN_COLLISION {
            self.grow_table_chain()?;
            Ok(self.table_count() - 1)
        } else {
            Ok(last)
        }
    }

    fn grow_table_chain(&mut self) -> Result<()> {
        self.ensure_transaction()?;
        let last = self.table_count() - 1;
        let prev_maxcount = self.maxcount_of(last);
        let new_maxcount = next_prime(prev_maxcount * 2);
        let image = table::new_table_image(new_maxcount);

        let txn = self.txn.as_mut().unwrap();
        let offset = txn.append(&image);
        let prev_next_table_offset_field = self.table_field_offset(
            last,
            self.txn_state.as_ref().unwrap(),
            TABLE_NEXT_TABLE_OFFSET,
        );
        self.txn
            .as_mut()
            .unwrap()
            .queue_write(prev_next_table_offset_field, encode_next_offset(offset).to_vec());

        self.txn_state.as_mut().unwrap().new_tables.push((offset, new_maxcount));
        self.table_maxcounts.push(new_maxcount);
        self.table_counts.push(0);
        debug!("grew table chain: new table at {offset} sized {new_maxcount}");
        Ok(())
    }

    // -- block allocator ------------------------------------------------

    pub(super) fn alloc_block(&mut self, class: u8, image: &[u8]) -> Result<u64> {
        let head = self.free_list_heads[class as usize];
        if head != 0 {
            let mut next_buf = [0u8; 8];
            self.file.read_exact_at(&mut next_buf, head)?;
            let next = BigEndian::read_u64(&next_buf);
            self.free_list_heads[class as usize] = next;
            self.txn.as_mut().unwrap().queue_write(head, image.to_vec());
            Ok(head)
        } else {
            Ok(self.txn.as_mut().unwrap().append(image))
        }
    }

    pub(super) fn recycle_block(&mut self, class: u8, offset: u64) {
        if let Some(txn) = self.txn.as_mut() {
            txn.mark_recycled(class, offset);
        }
    }

    pub(super) fn read_block_bytes(&self, offset: u64) -> Result<Vec<u8>> {
        let header_len = BLOCK_KEY_SIZE_OFFSET as usize + 8;
        let header_bytes = match self.txn.as_ref().and_then(|t| t.read_shadow(offset, header_len)) {
            Some(b) => b,
            None => {
                let mut buf = vec![0u8; header_len];
                self.file.read_exact_at(&mut buf, offset)?;
                buf
            }
        };
        let class = header_bytes[BLOCK_LOG2SIZE_OFFSET as usize];
        let total = crate::block::block_file_size(class) as usize;
        if let Some(full) = self.txn.as_ref().and_then(|t| t.read_shadow(offset, total)) {
            return Ok(full);
        }
        let mut buf = vec![0u8; total];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    pub(super) fn write_block_next_offset(&mut self, offset: u64, next: u64) {
        self.txn.as_mut().unwrap().queue_write(offset, encode_next_offset(next).to_vec());
    }

    pub(super) fn filesize(&self) -> u64 {
        self.filesize
    }
}

fn journal_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(JOURNAL_SUFFIX);
    PathBuf::from(name)
}
