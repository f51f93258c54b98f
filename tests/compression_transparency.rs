//! A highly-compressible large value is stored and retrieved intact, and
//! the committed file grows by meaningfully less than the value's raw
//! size, demonstrating that compression actually ran rather than just
//! being accepted as a no-op config knob.

use std::path::PathBuf;

use kvdb_rs::{CompressionType, Config, Kv};

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
fn a_compressible_value_round_trips_and_shrinks_on_disk() {
    let path = unique_path("compression");
    let config = Config::default().with_compression(CompressionType::Lz4);
    let mut kv = Kv::create(&path, config).expect("create");

    let value = vec![b'x'; 64 * 1024];
    let before = std::fs::metadata(&path).expect("stat before").len();

    kv.set(b"big", &value).expect("set");
    kv.commit_transaction().expect("commit");

    let after = std::fs::metadata(&path).expect("stat after").len();
    let grown_by = after - before;
    assert!(
        grown_by < (value.len() / 2) as u64,
        "expected compressed growth under {} bytes, file grew by {grown_by}",
        value.len() / 2
    );

    assert_eq!(kv.get(b"big").expect("get"), value);

    kv.close().expect("close");
    let _ = std::fs::remove_file(&path);
}
