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

const COUNT: usize = 2_000;

#[test]
fn bulk_insert_survives_reopen_then_half_deleted() {
    let path = unique_path("bulk_reopen");
    {
        let mut kv = Kv::create(&path, Config::default()).expect("create");
        for i in 0..COUNT {
            kv.set(format!("key-{i:06}").as_bytes(), format!("value-{i}").as_bytes())
                .expect("set");
        }
        kv.commit_transaction().expect("commit");
        kv.close().expect("close");
    }

    let mut kv = Kv::open(&path, Config::default()).expect("reopen");
    for i in 0..COUNT {
        assert_eq!(
            kv.get(format!("key-{i:06}").as_bytes()).expect("get"),
            format!("value-{i}").as_bytes()
        );
    }

    let half = COUNT / 2;
    for i in 0..half {
        kv.delete(format!("key-{i:06}").as_bytes()).expect("delete");
    }
    kv.commit_transaction().expect("commit");

    for i in 0..half {
        assert!(matches!(kv.get(format!("key-{i:06}").as_bytes()), Err(Error::NotFound)));
    }
    for i in half..COUNT {
        assert_eq!(
            kv.get(format!("key-{i:06}").as_bytes()).expect("get"),
            format!("value-{i}").as_bytes()
        );
    }

    kv.close().expect("close");
    let _ = std::fs::remove_file(&path);
}
