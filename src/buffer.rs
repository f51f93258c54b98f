//! Write buffer: a single contiguous staging area for newly appended
//! (never overwritten) blocks, flushed to disk as one `pwrite`.

use std::fs::File;
use std::io::{Result as IoResult, Write};
use std::os::unix::fs::FileExt;

pub struct WriteBuffer {
    capacity: usize,
    data: Vec<u8>,
    /// File offset the buffer is anchored at, if it holds anything.
    location: Option<u64>,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        WriteBuffer {
            capacity,
            data: Vec::with_capacity(capacity),
            location: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_anchored(&self) -> bool {
        self.location.is_some()
    }

    pub fn location(&self) -> Option<u64> {
        self.location
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Anchors the (empty) buffer at `offset`. No-op if already anchored.
    pub fn anchor(&mut self, offset: u64) {
        if self.location.is_none() {
            self.location = Some(offset);
            self.data.clear();
        }
    }

    /// Appends `bytes` to the buffer. Caller is responsible for having
    /// checked `remaining() >= bytes.len()` and that the buffer is
    /// anchored contiguously with the previous append.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// If `offset` falls at or after the buffer's anchor, returns the
    /// corresponding byte window inside the buffer; any block recycled
    /// or read at such an offset was written in this same transaction
    /// and is guaranteed to lie within the filled region.
    pub fn read_at(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let location = self.location?;
        if offset < location {
            return None;
        }
        let start = (offset - location) as usize;
        self.data.get(start..start + len)
    }

    pub fn contains(&self, offset: u64) -> bool {
        matches!(self.location, Some(location) if offset >= location)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Writes the buffered bytes to `file` at the anchor offset and
    /// resets the buffer to empty/unanchored.
    pub fn flush(&mut self, file: &File) -> IoResult<()> {
        if let Some(location) = self.location {
            file.write_all_at(&self.data, location)?;
        }
        self.data.clear();
        self.location = None;
        Ok(())
    }
}

/// Convenience used by callers that want a Write-style append without
/// checking remaining() manually first.
impl Write for WriteBuffer {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        let n = buf.len().min(self.remaining());
        self.append(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_is_sticky_until_flush() {
        let mut buf = WriteBuffer::new(64);
        buf.anchor(100);
        buf.anchor(200); // no-op, already anchored
        assert_eq!(buf.location(), Some(100));
    }

    #[test]
    fn read_at_finds_bytes_written_after_anchor() {
        let mut buf = WriteBuffer::new(64);
        buf.anchor(100);
        buf.append(b"hello");
        assert_eq!(buf.read_at(100, 5), Some(&b"hello"[..]));
        assert_eq!(buf.read_at(99, 1), None);
    }

    #[test]
    fn remaining_shrinks_as_data_is_appended() {
        let mut buf = WriteBuffer::new(10);
        buf.anchor(0);
        assert_eq!(buf.remaining(), 10);
        buf.append(&[0u8; 4]);
        assert_eq!(buf.remaining(), 6);
    }
}
