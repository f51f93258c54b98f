use std::path::PathBuf;

use kvdb_rs::{Config, Okv};

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
fn keys_iterate_in_sorted_order_regardless_of_insert_order() {
    let path = unique_path("ordered_iteration");
    let mut okv = Okv::create(&path, Config::default()).expect("create");

    for k in [b"b".as_slice(), b"d", b"a", b"c"] {
        okv.insert(k).expect("insert");
    }
    okv.commit_transaction().expect("commit");

    let mut it = okv.iter().expect("iter");
    it.seek_first().expect("seek_first");
    let mut forward = Vec::new();
    while it.is_valid() {
        forward.push(it.get_key().unwrap().to_vec());
        it.next().expect("next");
    }
    assert_eq!(forward, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

    let mut it = okv.iter().expect("iter");
    it.seek_after(b"b2").expect("seek_after");
    let mut after = Vec::new();
    while it.is_valid() {
        after.push(it.get_key().unwrap().to_vec());
        it.next().expect("next");
    }
    assert_eq!(after, vec![b"c".to_vec(), b"d".to_vec()]);

    let mut it = okv.iter().expect("iter");
    it.seek_last().expect("seek_last");
    let mut backward = Vec::new();
    while it.is_valid() {
        backward.push(it.get_key().unwrap().to_vec());
        it.previous().expect("previous");
    }
    assert_eq!(
        backward,
        vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
    );

    okv.close().expect("close");
    let _ = std::fs::remove_file(&path);
}
