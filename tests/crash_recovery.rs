//! Simulates a crash in the window between a commit's journal fsync and
//! the journal's unlink: a journal is left on disk describing a write
//! that was never applied to the main file. Opening the database must
//! replay it and clean up, exactly as if the process had died there.

use std::path::PathBuf;

use byteorder::{BigEndian, ByteOrder};
use kvdb_rs::consts::{HEADER_FILESIZE_OFFSET, JOURNAL_SUFFIX};
use kvdb_rs::journal::{self, JournalWrite};
use kvdb_rs::{Config, Kv};

fn unique_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "kvdb_rs_it_{tag}_{}_{}",
        std::process::id(),
        unique()
    ))
}

fn unique() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
}

#[test]
fn a_journal_left_behind_by_a_crash_is_replayed_on_open() {
    let path = unique_path("crash_recovery");
    let mut kv = Kv::create(&path, Config::default()).expect("create");
    kv.set(b"foo", b"bar").expect("set");
    kv.commit_transaction().expect("commit");
    kv.close().expect("close");

    let durable_len = std::fs::metadata(&path).expect("stat").len();
    let bumped_len = durable_len + 4096;

    let journal_path = PathBuf::from(format!("{}.{}", path.display(), JOURNAL_SUFFIX));
    let mut bumped_len_bytes = [0u8; 8];
    BigEndian::write_u64(&mut bumped_len_bytes, bumped_len);
    let writes = vec![JournalWrite::new(HEADER_FILESIZE_OFFSET, bumped_len_bytes.to_vec())];
    journal::write_journal(&journal_path, &writes, true).expect("write journal");
    assert!(journal_path.exists(), "journal must be on disk before the simulated crash");

    let kv = Kv::open(&path, Config::default()).expect("open replays the journal");
    assert!(!journal_path.exists(), "recovery must unlink the journal once replayed");
    assert_eq!(kv.get(b"foo").expect("get"), b"bar", "pre-crash data must be unaffected");

    let reopened_len = std::fs::metadata(&path).expect("stat after recovery").len();
    assert_eq!(reopened_len, bumped_len, "the journaled filesize write must have been applied");

    kv.close().expect("close");
    let _ = std::fs::remove_file(&path);
}
