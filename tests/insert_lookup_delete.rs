use std::path::PathBuf;

use kvdb_rs::{Config, Error, Kv};

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
fn set_get_then_delete_round_trips() {
    let path = unique_path("insert_lookup_delete");
    let mut kv = Kv::create(&path, Config::default()).expect("create");

    kv.set(b"hoa", b"test").expect("set");
    kv.commit_transaction().expect("commit");
    assert_eq!(kv.get(b"hoa").expect("get"), b"test");

    kv.delete(b"hoa").expect("delete");
    kv.commit_transaction().expect("commit");
    assert!(matches!(kv.get(b"hoa"), Err(Error::NotFound)));

    kv.close().expect("close");
    let _ = std::fs::remove_file(&path);
}
