//! Write-ahead journal: format, atomic write, and crash recovery replay.
//!
//! Format: 4-byte magic `"KVJL"`, a 4-byte big-endian MurmurHash2
//! checksum (seed 0) of every byte that follows, then zero or more
//! records of `<8-byte BE offset><2-byte BE length><length bytes>`.
//! A transaction's commit is "durable" the instant this file lands on
//! disk with a valid checksum; replaying it is just re-running the
//! positional writes it describes.

use byteorder::{BigEndian, ByteOrder};
use std::fs::{self, File, OpenOptions};
use std::io::Write as IoWrite;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::codec::hash::murmur_hash2;
use crate::consts::{JOURNAL_HEADER_SIZE, JOURNAL_MARKER, JOURNAL_RECORD_HEADER_SIZE};
use crate::error::{Error, Result};

/// One positional write the journal records and, on commit, replays.
#[derive(Debug, Clone)]
pub struct JournalWrite {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

impl JournalWrite {
    pub fn new(offset: u64, bytes: Vec<u8>) -> Self {
        JournalWrite { offset, bytes }
    }
}

fn encode_records(writes: &[JournalWrite]) -> Vec<u8> {
    let mut body = Vec::new();
    for w in writes {
        debug_assert!(w.bytes.len() <= u16::MAX as usize);
        let mut header = [0u8; JOURNAL_RECORD_HEADER_SIZE as usize];
        BigEndian::write_u64(&mut header[0..8], w.offset);
        BigEndian::write_u16(&mut header[8..10], w.bytes.len() as u16);
        body.extend_from_slice(&header);
        body.extend_from_slice(&w.bytes);
    }
    body
}

/// Builds the full byte image of a journal file for `writes`.
pub fn encode_journal(writes: &[JournalWrite]) -> Vec<u8> {
    let body = encode_records(writes);
    let checksum = murmur_hash2(&body, 0);
    let mut out = Vec::with_capacity(JOURNAL_HEADER_SIZE as usize + body.len());
    out.extend_from_slice(JOURNAL_MARKER);
    let mut checksum_bytes = [0u8; 4];
    BigEndian::write_u32(&mut checksum_bytes, checksum);
    out.extend_from_slice(&checksum_bytes);
    out.extend_from_slice(&body);
    out
}

/// Writes `writes` to `journal_path`, replacing any prior contents, and
/// fsyncs unless `fsync_enabled` is false. This is the durability point
/// of a commit; disabling the sync trades crash durability for speed
/// without changing the format.
pub fn write_journal(journal_path: &Path, writes: &[JournalWrite], fsync_enabled: bool) -> Result<()> {
    let image = encode_journal(writes);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(journal_path)?;
    file.write_all(&image)?;
    if fsync_enabled {
        file.sync_all()?;
    }
    Ok(())
}

fn decode_records(body: &[u8]) -> Result<Vec<JournalWrite>> {
    let mut writes = Vec::new();
    let mut pos = 0usize;
    while pos < body.len() {
        if pos + JOURNAL_RECORD_HEADER_SIZE as usize > body.len() {
            return Err(Error::invalid_journal("truncated record header"));
        }
        let offset = BigEndian::read_u64(&body[pos..pos + 8]);
        let len = BigEndian::read_u16(&body[pos + 8..pos + 10]) as usize;
        pos += JOURNAL_RECORD_HEADER_SIZE as usize;
        if pos + len > body.len() {
            return Err(Error::invalid_journal("truncated record payload"));
        }
        writes.push(JournalWrite::new(offset, body[pos..pos + len].to_vec()));
        pos += len;
    }
    Ok(writes)
}

/// Parses and validates a journal image already read into memory.
/// Returns the records to replay, or an error if the magic or checksum
/// don't match (the journal is from a crash mid-write and must be
/// discarded, not replayed).
fn parse_journal(image: &[u8]) -> Result<Vec<JournalWrite>> {
    if image.len() < JOURNAL_HEADER_SIZE as usize {
        return Err(Error::invalid_journal("shorter than the journal header"));
    }
    if &image[0..4] != JOURNAL_MARKER {
        return Err(Error::invalid_journal("bad magic"));
    }
    let stored_checksum = BigEndian::read_u32(&image[4..8]);
    let body = &image[JOURNAL_HEADER_SIZE as usize..];
    let computed = murmur_hash2(body, 0);
    if stored_checksum != computed {
        return Err(Error::invalid_journal("checksum mismatch"));
    }
    decode_records(body)
}

/// Applies a set of positional writes to `file` and fsyncs once unless
/// `fsync_enabled` is false. Shared by recovery replay and by a live
/// transaction's own commit, since both are "take these (offset, bytes)
/// pairs and make them durable".
pub fn apply_writes(file: &File, writes: &[JournalWrite], fsync_enabled: bool) -> Result<()> {
    for w in writes {
        file.write_all_at(&w.bytes, w.offset)?;
    }
    if fsync_enabled {
        file.sync_all()?;
    }
    Ok(())
}

/// Looks for a journal at `journal_path`, and if present and valid,
/// replays its records into `file` via positional writes, fsyncs unless
/// `fsync_enabled` is false, then deletes the journal. An invalid
/// (crash-mid-write) journal is simply deleted without being replayed.
/// Returns whether a journal was found at all (valid or not), so the
/// caller knows a recovery pass ran.
pub fn recover(file: &File, journal_path: &Path, fsync_enabled: bool) -> Result<bool> {
    let image = match fs::read(journal_path) {
        Ok(bytes) => bytes,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::from(e)),
    };

    match parse_journal(&image) {
        Ok(writes) => {
            apply_writes(file, &writes, fsync_enabled)?;
            fs::remove_file(journal_path)?;
            Ok(true)
        }
        Err(Error::InvalidJournal(_)) => {
            fs::remove_file(journal_path)?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_parse_round_trips() {
        let writes = vec![
            JournalWrite::new(0, vec![1, 2, 3, 4]),
            JournalWrite::new(100, vec![9, 9]),
        ];
        let image = encode_journal(&writes);
        let parsed = parse_journal(&image).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].offset, 0);
        assert_eq!(parsed[0].bytes, vec![1, 2, 3, 4]);
        assert_eq!(parsed[1].offset, 100);
        assert_eq!(parsed[1].bytes, vec![9, 9]);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let writes = vec![JournalWrite::new(0, vec![1, 2, 3])];
        let mut image = encode_journal(&writes);
        let last = image.len() - 1;
        image[last] ^= 0xff;
        assert!(parse_journal(&image).is_err());
    }

    #[test]
    fn recover_replays_a_valid_journal_and_deletes_it() {
        let dir = std::env::temp_dir().join(format!("kvdb_rs_journal_test_{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        let data_path = dir.join("data.db");
        let journal_path = dir.join("data.db.journal");

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)
            .unwrap();
        data_file.write_all_at(&[0u8; 16], 0).unwrap();

        let writes = vec![JournalWrite::new(4, vec![0xAA, 0xBB])];
        write_journal(&journal_path, &writes, true).unwrap();

        let replayed = recover(&data_file, &journal_path, true).unwrap();
        assert!(replayed);
        assert!(!journal_path.exists());

        let mut check = [0u8; 2];
        data_file.read_exact_at(&mut check, 4).unwrap();
        assert_eq!(check, [0xAA, 0xBB]);

        let _ = fs::remove_dir_all(&dir);
    }
}
