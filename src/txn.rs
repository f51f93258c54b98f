//! Transaction shadow state: everything a running transaction has
//! changed but not yet made durable. Nothing here touches the database
//! file except `commit`, which assembles the accumulated changes into a
//! single journal and replays it, and `abort`, which throws the shadow
//! state away and truncates off any newly appended blocks.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use crate::buffer::WriteBuffer;
use crate::error::Result;
use crate::journal::{self, JournalWrite};

/// A live transaction. Reads that fall inside a bucket this transaction
/// has touched must be satisfied from its shadow state before ever
/// consulting the on-disk chain, since the chain may be stale relative
/// to in-memory changes not yet journaled.
pub struct Transaction {
    /// File size when the transaction began; also the write buffer's
    /// anchor and the rollback point on abort.
    pub base_filesize: u64,
    /// Current logical end of file, including this transaction's own
    /// appends.
    pub filesize: u64,
    pub buffer: WriteBuffer,
    /// Small fixed-size field updates (table counts, bucket heads,
    /// bloom filter bytes, free-list heads, new table headers, the
    /// header's filesize field) queued for the next commit.
    writes: Vec<JournalWrite>,
    /// Per-bucket touched state: `(table_index, bucket)` -> the full
    /// set of block offsets now reachable from that bucket's chain,
    /// newest first. Used to shadow on-disk reads for this transaction.
    pub touched_buckets: HashMap<(usize, u64), Vec<u64>>,
    /// Blocks freed during this transaction, per size class. Not
    /// reusable until commit: allocation must not hand out a block
    /// whose old contents might still be needed by an abort.
    pub recycled_this_txn: HashMap<u8, Vec<u64>>,
    pub implicit: bool,
    pub op_count: u64,
}

impl Transaction {
    pub fn begin(filesize: u64, buffer_capacity: usize, implicit: bool) -> Self {
        let mut buffer = WriteBuffer::new(buffer_capacity);
        buffer.anchor(filesize);
        Transaction {
            base_filesize: filesize,
            filesize,
            buffer,
            writes: Vec::new(),
            touched_buckets: HashMap::new(),
            recycled_this_txn: HashMap::new(),
            implicit,
            op_count: 0,
        }
    }

    /// Appends `bytes` past the current end of file, growing it, and
    /// returns the offset they were placed at.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.filesize;
        if self.buffer.remaining() < bytes.len() {
            // The staging buffer only ever grows from its anchor; once a
            // caller needs more room than it has left we simply track
            // the allocation as a queued write instead of buffering it.
            self.writes.push(JournalWrite::new(offset, bytes.to_vec()));
        } else {
            self.buffer.append(bytes);
        }
        self.filesize += bytes.len() as u64;
        offset
    }

    /// Queues a small, already-computed write (a field update) for the
    /// next commit. Does not affect `filesize`.
    pub fn queue_write(&mut self, offset: u64, bytes: Vec<u8>) {
        self.writes.push(JournalWrite::new(offset, bytes));
    }

    /// Reads bytes this transaction itself has written (buffered append
    /// or queued small write) without touching the file, if any are
    /// available at `offset`. Falls through to the on-disk/mmap view
    /// for anything not shadowed here.
    pub fn read_shadow(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        if let Some(bytes) = self.buffer.read_at(offset, len) {
            return Some(bytes.to_vec());
        }
        for w in self.writes.iter().rev() {
            if w.offset <= offset && offset + len as u64 <= w.offset + w.bytes.len() as u64 {
                let start = (offset - w.offset) as usize;
                return Some(w.bytes[start..start + len].to_vec());
            }
        }
        None
    }

    pub fn mark_recycled(&mut self, class: u8, offset: u64) {
        self.recycled_this_txn.entry(class).or_default().push(offset);
    }

    pub fn note_touched_bucket(&mut self, table_index: usize, bucket: u64, chain: Vec<u64>) {
        self.touched_buckets.insert((table_index, bucket), chain);
    }

    pub fn touched_chain(&self, table_index: usize, bucket: u64) -> Option<&Vec<u64>> {
        self.touched_buckets.get(&(table_index, bucket))
    }

    pub fn bump_op_count(&mut self) {
        self.op_count += 1;
    }

    pub fn should_auto_commit(&self, max_ops: u64) -> bool {
        self.implicit && self.op_count >= max_ops
    }

    /// Assembles every queued change (the buffered append region plus
    /// all small field writes) into one journal, writes it durably,
    /// replays it into `file`, and deletes it. Consumes the
    /// transaction: there is nothing left to shadow once this returns.
    /// `fsync_enabled` gates the two `fsync` points this involves; with
    /// it off, a crash mid-commit can lose the transaction.
    pub fn commit(mut self, file: &File, journal_path: &Path, fsync_enabled: bool) -> Result<()> {
        let mut all = Vec::with_capacity(self.writes.len() + 1);
        if let Some(location) = self.buffer.location() {
            if !self.buffer.data().is_empty() {
                all.push(JournalWrite::new(location, self.buffer.data().to_vec()));
            }
        }
        all.append(&mut self.writes);

        journal::write_journal(journal_path, &all, fsync_enabled)?;
        journal::apply_writes(file, &all, fsync_enabled)?;
        std::fs::remove_file(journal_path)?;
        Ok(())
    }

    /// Discards every change this transaction made and truncates the
    /// file back to its size when the transaction began.
    pub fn abort(self, file: &File, fsync_enabled: bool) -> Result<()> {
        file.set_len(self.base_filesize)?;
        if fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }
}
